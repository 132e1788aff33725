//! The `revup` command-line tool.

#![warn(clippy::all, clippy::as_conversions)]

use revup_invoke::CommandContext;
use revup_opts::{Command, Opts};

fn main() {
    revup_invoke::invoke_subcommand_main(|ctx: CommandContext, opts: Opts| async move {
        match opts.command {
            Command::Upload(args) => revup_upload::command_main(ctx, args).await,
        }
    })
}
