//! Push the user's commits to GitHub as review branches and pull requests.
//!
//! This crate implements `revup upload`: commits are grouped into topics by
//! their message directives, each topic is synthesized into a review branch
//! by cherry-picking onto the right base with transient indices, and the
//! resulting branches are reconciled against the forge with a minimal set of
//! pushes and API mutations.

#![warn(missing_docs)]
#![warn(
    clippy::all,
    clippy::as_conversions,
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro
)]
#![allow(clippy::too_many_arguments, clippy::blocks_in_conditions)]

pub mod base_branch;
pub mod directives;
pub mod github;
pub mod rebase_detect;
pub mod reconcile;
pub mod render;
pub mod synthesize;
pub mod topic_graph;

use std::collections::HashMap;
use std::fmt::Write as _;

use indexmap::IndexMap;
use lib::core::effects::{Effects, STYLE_ERROR, STYLE_SUCCESS, STYLE_WARNING};
use lib::core::task::WorkerPool;
use lib::git::{Repo, RepoOptions, Signature, Time};
use lib::util::{ExitCode, EyreExitOr};
use revup_invoke::CommandContext;
use revup_opts::{AutoAddUsers, BranchFormat, UploadArgs};
use tracing::instrument;

use base_branch::BaseBranch;
use github::client::GithubClient;
use github::{parse_github_remote_url, Forge, RemotePullRequest};
use reconcile::{build_plan, execute_plan, print_plan, ReconcileOptions};
use synthesize::{synthesize_branches, SynthesisOptions};
use topic_graph::{expand_branches, group_topics, normalize_uploader, TopicGraphOptions};

/// The resolved settings for one upload run: command-line flags layered over
/// the configuration files.
#[derive(Clone, Debug)]
struct ResolvedOptions {
    topics: Vec<String>,
    base_branch: Option<String>,
    relative_branch: Option<String>,
    rebase: bool,
    relative_chain: bool,
    auto_topic: bool,
    skip_confirm: bool,
    dry_run: bool,
    status: bool,
    push_only: bool,
    update_pr_body: bool,
    review_graph: bool,
    patchsets: bool,
    trim_tags: bool,
    create_local_branches: bool,
    auto_add_users: AutoAddUsers,
    labels: Vec<String>,
    user_aliases: Vec<(String, String)>,
    uploader: Option<String>,
    branch_format: BranchFormat,
    head: Option<String>,
    self_authored_only: bool,
    pre_upload: Option<String>,
    keep_temp: bool,
    proxy: Option<String>,
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .collect()
}

fn resolve_options(
    args: UploadArgs,
    config_file: &lib::core::config::ConfigFile,
) -> eyre::Result<ResolvedOptions> {
    let upload = &config_file.upload;

    let resolve_flag_pair = |positive: bool, negative: bool, config: Option<bool>| -> bool {
        if negative {
            false
        } else if positive {
            true
        } else {
            config.unwrap_or(true)
        }
    };

    let auto_add_users = match args.auto_add_users {
        Some(auto_add_users) => auto_add_users,
        None => match upload.auto_add_users.as_deref() {
            None => AutoAddUsers::No,
            Some("no") => AutoAddUsers::No,
            Some("r2a") => AutoAddUsers::R2a,
            Some("a2r") => AutoAddUsers::A2r,
            Some("both") => AutoAddUsers::Both,
            Some(other) => {
                eyre::bail!(
                    "invalid `auto_add_users` config value {other:?}; \
                     expected one of `no`, `r2a`, `a2r`, `both`"
                );
            }
        },
    };

    let branch_format = match args.branch_format {
        Some(branch_format) => branch_format,
        None => match upload.branch_format.as_deref() {
            None => BranchFormat::UserPlusBranch,
            Some("user+branch") => BranchFormat::UserPlusBranch,
            Some("user") => BranchFormat::User,
            Some("branch") => BranchFormat::Branch,
            Some("none") => BranchFormat::None,
            Some(other) => {
                eyre::bail!(
                    "invalid `branch_format` config value {other:?}; \
                     expected one of `user+branch`, `user`, `branch`, `none`"
                );
            }
        },
    };

    let raw_aliases = args
        .user_aliases
        .or_else(|| upload.user_aliases.clone())
        .unwrap_or_default();
    let mut user_aliases = Vec::new();
    for alias in parse_csv(&raw_aliases) {
        match alias.split_once(':') {
            Some((old, new)) if !old.is_empty() && !new.is_empty() => {
                user_aliases.push((old.to_owned(), new.to_owned()));
            }
            _ => {
                eyre::bail!("invalid user alias {alias:?}; expected `old:new`");
            }
        }
    }

    let labels = parse_csv(
        &args
            .labels
            .or_else(|| upload.labels.clone())
            .unwrap_or_default(),
    );

    Ok(ResolvedOptions {
        topics: args.topics,
        base_branch: args.base_branch,
        relative_branch: args.relative_branch,
        rebase: args.rebase || upload.rebase.unwrap_or(false),
        relative_chain: args.relative_chain || upload.relative_chain.unwrap_or(false),
        auto_topic: args.auto_topic || upload.auto_topic.unwrap_or(false),
        skip_confirm: args.skip_confirm || upload.skip_confirm.unwrap_or(false),
        dry_run: args.dry_run || upload.dry_run.unwrap_or(false),
        status: args.status,
        push_only: args.push_only || upload.push_only.unwrap_or(false),
        update_pr_body: !args.no_update_pr_body && upload.update_pr_body.unwrap_or(true),
        review_graph: resolve_flag_pair(
            args.review_graph,
            args.no_review_graph,
            upload.review_graph,
        ),
        patchsets: resolve_flag_pair(args.patchsets, args.no_patchsets, upload.patchsets),
        trim_tags: args.trim_tags || upload.trim_tags.unwrap_or(false),
        create_local_branches: args.create_local_branches
            || upload.create_local_branches.unwrap_or(false),
        auto_add_users,
        labels,
        user_aliases,
        uploader: args.uploader.or_else(|| upload.uploader.clone()),
        branch_format,
        head: args.head,
        self_authored_only: resolve_flag_pair(
            args.self_authored_only,
            args.no_self_authored_only,
            upload.self_authored_only,
        ),
        pre_upload: args.pre_upload.or_else(|| upload.pre_upload.clone()),
        keep_temp: args.keep_temp,
        proxy: args.proxy.or_else(|| config_file.revup.proxy.clone()),
    })
}

/// Run a `--pre-upload` command, aborting the upload on failure.
async fn run_pre_upload(repo: &Repo, command: &str) -> eyre::Result<bool> {
    let words = shell_words::split(command)
        .map_err(|err| eyre::eyre!("could not parse --pre-upload command: {err}"))?;
    let (program, program_args) = match words.split_first() {
        Some(split) => split,
        None => return Ok(true),
    };
    let status = tokio::process::Command::new(program)
        .args(program_args)
        .current_dir(repo.get_working_copy_path())
        .status()
        .await
        .map_err(|err| eyre::eyre!("could not run --pre-upload command: {err}"))?;
    Ok(status.success())
}

async fn confirm_upload(effects: &Effects) -> eyre::Result<bool> {
    let term = console::Term::stdout();
    if !term.is_term() {
        return Ok(true);
    }
    writeln!(
        effects.get_output_stream(),
        "Proceed with upload? [y/N]"
    )?;
    let line = tokio::task::spawn_blocking(move || term.read_line())
        .await
        .map_err(|err| eyre::eyre!("confirmation prompt failed: {err}"))??;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// The committer identity used for every synthesized commit in this run: the
/// local git identity at a single instant, so that repeated runs with no
/// changes produce identical heads.
fn make_committer(name: String, email: String) -> Signature {
    let now = chrono::Local::now();
    Signature {
        name,
        email,
        time: Time {
            seconds: now.timestamp(),
            offset_minutes: now.offset().local_minus_utc() / 60,
        },
    }
}

/// `upload` command.
#[instrument(skip_all)]
pub async fn command_main(ctx: CommandContext, args: UploadArgs) -> EyreExitOr<()> {
    let CommandContext {
        effects,
        git_run_info,
        config_file,
    } = ctx;
    let options = match resolve_options(args, &config_file) {
        Ok(options) => options,
        Err(err) => {
            writeln!(
                effects.get_error_stream(),
                "{}: {err}",
                STYLE_ERROR.apply_to("configuration error"),
            )?;
            return Ok(Err(ExitCode(1)));
        }
    };

    let repo = Repo::discover(
        git_run_info,
        WorkerPool::for_git(),
        RepoOptions {
            keep_temp: options.keep_temp,
        },
    )
    .await?;

    if let Some(pre_upload) = &options.pre_upload {
        if !run_pre_upload(&repo, pre_upload).await? {
            writeln!(
                effects.get_error_stream(),
                "{}: --pre-upload command failed; aborting",
                STYLE_ERROR.apply_to("error"),
            )?;
            return Ok(Err(ExitCode(1)));
        }
    }

    let (user_name, user_email) = match repo.get_user_identity().await {
        Ok(identity) => identity,
        Err(err) => {
            writeln!(effects.get_error_stream(), "{err}")?;
            return Ok(Err(ExitCode(1)));
        }
    };
    let committer = make_committer(user_name, user_email.clone());

    // Determine the head and its base branch.
    let head_ref = options.head.as_deref().unwrap_or("HEAD");
    let head = match repo.resolve_reference(head_ref).await? {
        Some(head) => head,
        None => {
            writeln!(
                effects.get_error_stream(),
                "{}: could not resolve {head_ref:?} to a commit",
                STYLE_ERROR.apply_to("error"),
            )?;
            return Ok(Err(ExitCode(1)));
        }
    };
    let remote_name = config_file.remote_name().to_owned();
    let detected_base = {
        let result = match &options.base_branch {
            Some(base_branch) => {
                base_branch::resolve_branch_tip(&repo, &remote_name, base_branch).await
            }
            None => {
                base_branch::detect_base_branch(
                    &repo,
                    head,
                    &remote_name,
                    config_file.main_branch(),
                    &config_file.release_branch_globs(),
                )
                .await
            }
        };
        match result {
            Ok(detected_base) => detected_base,
            Err(err) => {
                writeln!(effects.get_error_stream(), "{err}")?;
                return Ok(Err(ExitCode(1)));
            }
        }
    };

    // Walk the commits and build the topic graph.
    let commit_oids = repo.rev_list(head, &[detected_base.tip]).await?;
    if commit_oids.is_empty() {
        writeln!(
            effects.get_output_stream(),
            "No commits between {} and {head_ref}; nothing to upload.",
            detected_base.name,
        )?;
        return Ok(Ok(()));
    }
    let commits = repo.find_commits(&commit_oids).await?;

    let uploader = match &options.uploader {
        Some(uploader) => normalize_uploader(uploader),
        None => {
            let local_part = match user_email.split_once('@') {
                Some((local_part, _domain)) => local_part,
                None => user_email.as_str(),
            };
            normalize_uploader(local_part)
        }
    };
    let graph_options = TopicGraphOptions {
        auto_topic: options.auto_topic,
        relative_chain: options.relative_chain,
        self_authored_only: options.self_authored_only,
        user_email: user_email.clone(),
        uploader,
        branch_format: options.branch_format,
        default_base: detected_base.name.clone(),
        topic_filter: options.topics.clone(),
        extra_labels: options.labels.clone(),
        user_aliases: options.user_aliases.clone(),
        auto_add_users: options.auto_add_users,
        relative_branch: options.relative_branch.clone(),
    };
    let (topics, warnings) = match group_topics(&commits, &graph_options) {
        Ok(grouped) => grouped,
        Err(err) => {
            writeln!(effects.get_error_stream(), "{err}")?;
            return Ok(Err(ExitCode(1)));
        }
    };
    for warning in warnings {
        writeln!(
            effects.get_error_stream(),
            "{}: {warning}",
            STYLE_WARNING.apply_to("warning"),
        )?;
    }
    if topics.is_empty() {
        writeln!(
            effects.get_output_stream(),
            "No topics found; nothing to upload. Tag commits with `Topic:` or pass --auto-topic.",
        )?;
        return Ok(Ok(()));
    }

    // Resolve every declared base branch.
    let mut base_tips: IndexMap<String, BaseBranch> = IndexMap::new();
    base_tips.insert(detected_base.name.clone(), detected_base.clone());
    for topic in topics.values() {
        for base in &topic.base_branches {
            if !base_tips.contains_key(base) {
                match base_branch::resolve_branch_tip(&repo, &remote_name, base).await {
                    Ok(base_branch) => {
                        base_tips.insert(base.clone(), base_branch);
                    }
                    Err(err) => {
                        writeln!(effects.get_error_stream(), "{err}")?;
                        return Ok(Err(ExitCode(1)));
                    }
                }
            }
        }
    }

    let graph = match expand_branches(topics, &base_tips, &graph_options) {
        Ok(graph) => graph,
        Err(err) => {
            writeln!(effects.get_error_stream(), "{err}")?;
            return Ok(Err(ExitCode(1)));
        }
    };

    // Synthesize every branch. A conflict anywhere aborts before any push.
    let synthesized = match synthesize_branches(
        &repo,
        &graph,
        &committer,
        &SynthesisOptions {
            trim_tags: options.trim_tags,
        },
    )
    .await
    {
        Ok(synthesized) => synthesized,
        Err(err) => {
            writeln!(effects.get_error_stream(), "{err}")?;
            return Ok(Err(ExitCode(1)));
        }
    };

    // Contact the forge (unless this is a pure dry run).
    let branch_names: Vec<String> = graph
        .branches
        .iter()
        .map(|branch| branch.branch_name.clone())
        .collect();
    let mut repo_owner_for_plan: Option<String> = None;
    let forge: Option<GithubClient> = if options.dry_run && !options.status {
        None
    } else {
        let token = match config_file.github_oauth() {
            Ok(token) => token,
            Err(err) => {
                writeln!(effects.get_error_stream(), "{err}")?;
                return Ok(Err(ExitCode(1)));
            }
        };
        let remote_url = repo
            .get_config(&format!("remote.{remote_name}.url"))
            .await?
            .unwrap_or_default();
        let (repo_owner, repo_name) = match parse_github_remote_url(&remote_url) {
            Some(parsed) => parsed,
            None => {
                writeln!(
                    effects.get_error_stream(),
                    "{}: remote {remote_name:?} ({remote_url:?}) does not look like a GitHub \
                     repository",
                    STYLE_ERROR.apply_to("error"),
                )?;
                return Ok(Err(ExitCode(1)));
            }
        };
        repo_owner_for_plan = Some(repo_owner.clone());
        match GithubClient::new(
            &token,
            repo_owner,
            repo_name,
            WorkerPool::for_forge(),
            options.proxy.as_deref(),
        ) {
            Ok(client) => Some(client),
            Err(err) => {
                writeln!(effects.get_error_stream(), "{err}")?;
                return Ok(Err(ExitCode(1)));
            }
        }
    };

    let pull_requests: HashMap<String, RemotePullRequest> = match &forge {
        None => HashMap::new(),
        Some(forge) => match forge.query_pull_requests(&branch_names).await {
            Ok(pull_requests) => pull_requests,
            Err(err) => {
                writeln!(effects.get_error_stream(), "{err}")?;
                return Ok(Err(ExitCode(1)));
            }
        },
    };

    let reconcile_options = ReconcileOptions {
        remote_name: remote_name.clone(),
        rebase: options.rebase,
        push_only: options.push_only,
        update_pr_body: options.update_pr_body,
        review_graph: options.review_graph,
        patchsets: options.patchsets,
        create_local_branches: options.create_local_branches,
        repo_owner: repo_owner_for_plan,
        now_epoch: committer.time.seconds,
    };
    let plan = build_plan(&repo, &graph, &synthesized, &pull_requests, &reconcile_options)
        .await?;
    print_plan(&effects, &plan, &reconcile_options);

    if options.dry_run || options.status {
        return Ok(Ok(()));
    }
    let forge = forge.expect("Forge client exists when not a dry run");

    if !options.skip_confirm && !confirm_upload(&effects).await? {
        writeln!(effects.get_output_stream(), "Upload aborted.")?;
        return Ok(Ok(()));
    }

    let failures = execute_plan(
        &repo,
        &forge,
        &graph,
        &plan,
        &reconcile_options,
        &effects,
    )
    .await?;
    if !failures.is_empty() {
        for failure in &failures {
            writeln!(
                effects.get_error_stream(),
                "{}: {}: {:#}",
                STYLE_ERROR.apply_to("failed"),
                failure.branch_name,
                failure.error,
            )?;
        }
        return Ok(Err(ExitCode(1)));
    }

    writeln!(
        effects.get_output_stream(),
        "{}",
        STYLE_SUCCESS.apply_to("Upload complete."),
    )?;
    Ok(Ok(()))
}
