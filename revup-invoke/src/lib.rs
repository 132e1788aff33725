//! This crate is used to invoke `revup` subcommands. It owns process-level
//! concerns: argument parsing, terminal color configuration, tracing
//! installation, the tokio runtime, configuration loading, and SIGINT
//! handling.

#![warn(missing_docs)]
#![warn(
    clippy::all,
    clippy::as_conversions,
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro
)]
#![allow(clippy::too_many_arguments, clippy::blocks_in_conditions)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt::Write;
use std::future::Future;

use clap::{CommandFactory, FromArgMatches, Parser};
use eyre::Context;
use lib::core::config::{env_vars::get_path_to_git, load_config_file, ConfigFile};
use lib::core::effects::Effects;
use lib::git::{GitRunInfo, GitRunOpts};
use lib::util::{ExitCode, EyreExitOr};
use revup_opts::{ColorSetting, GlobalArgs};
use tracing::level_filters::LevelFilter;
use tracing::instrument;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Shared context for all commands.
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// The `Effects` to use.
    pub effects: Effects,

    /// Information about the Git executable currently being used.
    pub git_run_info: GitRunInfo,

    /// The layered on-disk configuration.
    pub config_file: ConfigFile,
}

#[instrument]
fn install_tracing(verbose: bool) -> eyre::Result<()> {
    // Limit to first-party targets; the workspace crates all start with
    // `revup`.
    let default_directive = if verbose {
        "revup=debug,revup_lib=debug,revup_upload=debug,revup_invoke=debug"
    } else {
        "revup=warn,revup_lib=warn,revup_upload=warn,revup_invoke=warn"
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse(
            std::env::var(EnvFilter::DEFAULT_ENV)
                .unwrap_or_else(|_| default_directive.to_string()),
        )?;
    let fmt_layer = tracing_fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(fmt_layer.with_filter(env_filter))
        .try_init()?;
    Ok(())
}

async fn make_command_context(effects: Effects) -> eyre::Result<CommandContext> {
    let git_run_info = GitRunInfo {
        path_to_git: get_path_to_git(),
        working_directory: std::env::current_dir()?,
        env: {
            let env: HashMap<OsString, OsString> = std::env::vars_os().collect();
            env
        },
    };

    // The config layer needs the repo root; resolve it directly rather than
    // through the full adapter, since the adapter isn't constructed yet.
    let repo_root = match git_run_info
        .run_silent(
            &["rev-parse", "--show-toplevel"],
            GitRunOpts {
                treat_git_failure_as_error: false,
                ..Default::default()
            },
        )
        .await
    {
        Ok(result) if result.exit_code == 0 => {
            Some(std::path::PathBuf::from(result.stdout_trimmed()?))
        }
        Ok(_) | Err(_) => None,
    };
    let config_file = load_config_file(repo_root.as_deref())?;

    Ok(CommandContext {
        effects,
        git_run_info,
        config_file,
    })
}

/// Wrapper function for `main` to ensure that `Drop` is called for local
/// variables, since `std::process::exit` will skip them. You probably want
/// to call `invoke_subcommand_main` instead.
pub fn do_main_and_drop_locals<T: Parser, F: Future<Output = EyreExitOr<()>>>(
    f: impl FnOnce(CommandContext, T) -> F,
    args: Vec<OsString>,
) -> eyre::Result<i32> {
    let command = GlobalArgs::command();
    let command_args = T::parse_from(&args);
    let matches = command.ignore_errors(true).get_matches_from(&args);
    let GlobalArgs {
        working_directory,
        color,
        verbose,
    } = GlobalArgs::from_arg_matches(&matches)
        .map_err(|err| eyre::eyre!("Could not parse global arguments: {err}"))?;

    if let Some(working_directory) = working_directory {
        std::env::set_current_dir(&working_directory).wrap_err_with(|| {
            format!(
                "Could not set working directory to: {:?}",
                &working_directory
            )
        })?;
    }

    match color {
        Some(ColorSetting::Always) => console::set_colors_enabled(true),
        Some(ColorSetting::Never) => console::set_colors_enabled(false),
        Some(ColorSetting::Auto) | None => {}
    }
    let effects = if verbose {
        Effects::new_verbose()
    } else {
        Effects::new()
    };

    install_tracing(verbose)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("Building tokio runtime")?;
    let exit_status = runtime.block_on(async {
        let ctx = make_command_context(effects.clone()).await?;
        tokio::select! {
            result = f(ctx, command_args) => result,
            _ = tokio::signal::ctrl_c() => {
                // Anything already pushed stays pushed; nothing local was
                // modified, so there is no cleanup to do.
                writeln!(effects.get_error_stream(), "Interrupted")?;
                Ok(Err(ExitCode(130)))
            }
        }
    })?;

    let exit_code = match exit_status {
        Ok(()) => 0,
        Err(exit_code) => exit_code.into_i32_or_default(),
    };
    Ok(exit_code)
}

/// Invoke the provided subcommand main function. This should be used in the
/// `main.rs` file for the subcommand executable.
pub fn invoke_subcommand_main<T: Parser, F: Future<Output = EyreExitOr<()>>>(
    f: impl FnOnce(CommandContext, T) -> F,
) {
    // Install panic handler.
    color_eyre::install().expect("Could not install panic handler");
    let args = std::env::args_os().collect();
    let exit_code = do_main_and_drop_locals(f, args).expect("A fatal error occurred");
    std::process::exit(exit_code);
}
