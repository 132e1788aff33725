//! The command-line options for `revup`.

#![warn(missing_docs)]
#![warn(
    clippy::all,
    clippy::as_conversions,
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro
)]
#![allow(clippy::too_many_arguments, clippy::blocks_in_conditions)]

use std::path::PathBuf;

use clap::{Args, Parser, ValueEnum};

/// When to display terminal colors.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ColorSetting {
    /// Automatically determine whether to display colors from the terminal
    /// and environment variables.
    Auto,
    /// Always display terminal colors.
    Always,
    /// Never display terminal colors.
    Never,
}

/// The naming scheme for pushed review branches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BranchFormat {
    /// `revup/<uploader>/<base>/<topic>`: unique across users and bases.
    #[value(name = "user+branch")]
    UserPlusBranch,

    /// `revup/<uploader>/<topic>`: unique across users; retargeting a topic
    /// to a different base reuses the same branch.
    User,

    /// `revup/<base>/<topic>`: unique across bases.
    Branch,

    /// `revup/<topic>`.
    None,
}

/// Whether to copy reviewers to assignees or vice versa.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AutoAddUsers {
    /// Don't copy users between roles.
    No,

    /// Add all reviewers as assignees.
    R2a,

    /// Add all assignees as reviewers.
    A2r,

    /// Both directions.
    Both,
}

/// Global arguments, available to all subcommands.
#[derive(Debug, Default, Parser)]
pub struct GlobalArgs {
    /// Change to the given directory before doing anything else.
    #[clap(value_parser, long = "working-directory", global = true)]
    pub working_directory: Option<PathBuf>,

    /// Flag to force enable or disable terminal colors.
    #[clap(value_enum, long = "color", global = true)]
    pub color: Option<ColorSetting>,

    /// Print every subprocess invocation and forge request.
    #[clap(action, short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
}

/// Group local commits into topics and upload them as review branches and
/// pull requests.
#[derive(Args, Debug, Default)]
pub struct UploadArgs {
    /// Restrict the upload to the given topics (plus the topics they are
    /// relative to). If empty, all topics are uploaded.
    #[clap(value_parser)]
    pub topics: Vec<String>,

    /// Use this base branch instead of auto-detecting one per head.
    #[clap(value_parser, long = "base-branch")]
    pub base_branch: Option<String>,

    /// Target pull requests at this ephemeral branch instead of the computed
    /// parent branch.
    #[clap(value_parser, long = "relative-branch")]
    pub relative_branch: Option<String>,

    /// Push branches whose only change is a rebase. Normally such branches
    /// are skipped.
    #[clap(action, long = "rebase")]
    pub rebase: bool,

    /// Ignore `Relative:` tags and chain each topic onto the previous one in
    /// commit order.
    #[clap(action, long = "relative-chain")]
    pub relative_chain: bool,

    /// Derive a topic name from the commit subject for commits without a
    /// `Topic:` tag.
    #[clap(action, long = "auto-topic")]
    pub auto_topic: bool,

    /// Don't ask for confirmation before pushing and mutating pull requests.
    #[clap(action, long = "skip-confirm")]
    pub skip_confirm: bool,

    /// Print the plan and exit without pushing or contacting the forge.
    #[clap(action, long = "dry-run")]
    pub dry_run: bool,

    /// Print the status of every topic (like `--dry-run`, but also queries
    /// the forge for pull request state).
    #[clap(action, long = "status")]
    pub status: bool,

    /// Push branches, but don't create or update pull requests.
    #[clap(action, long = "push-only")]
    pub push_only: bool,

    /// Don't update pull request titles and bodies from commit messages.
    #[clap(action, long = "no-update-pr-body")]
    pub no_update_pr_body: bool,

    /// Maintain a review-graph comment on each pull request.
    #[clap(action, long = "review-graph", overrides_with = "no_review_graph")]
    pub review_graph: bool,

    /// Don't maintain review-graph comments.
    #[clap(action, long = "no-review-graph")]
    pub no_review_graph: bool,

    /// Maintain a patchsets history comment on each pull request.
    #[clap(action, long = "patchsets", overrides_with = "no_patchsets")]
    pub patchsets: bool,

    /// Don't maintain patchsets comments.
    #[clap(action, long = "no-patchsets")]
    pub no_patchsets: bool,

    /// Strip recognized tags from the uploaded commit messages.
    #[clap(action, long = "trim-tags")]
    pub trim_tags: bool,

    /// Also create a local ref for each pushed branch, under `refs/heads/`.
    #[clap(action, long = "create-local-branches")]
    pub create_local_branches: bool,

    /// Copy reviewers to assignees (`r2a`), assignees to reviewers (`a2r`),
    /// or both.
    #[clap(value_enum, long = "auto-add-users")]
    pub auto_add_users: Option<AutoAddUsers>,

    /// Extra labels (comma-separated) to apply to every uploaded pull
    /// request.
    #[clap(value_parser, long = "labels")]
    pub labels: Option<String>,

    /// Rewrites of user names, as comma-separated `old:new` pairs.
    #[clap(value_parser, long = "user-aliases")]
    pub user_aliases: Option<String>,

    /// Use this uploader name in branch names instead of deriving it from
    /// the git email.
    #[clap(value_parser, long = "uploader")]
    pub uploader: Option<String>,

    /// The naming scheme for pushed branches.
    #[clap(value_enum, long = "branch-format")]
    pub branch_format: Option<BranchFormat>,

    /// Upload the commits reachable from this ref instead of `HEAD`.
    #[clap(value_parser, long = "head")]
    pub head: Option<String>,

    /// Only group commits authored by you into topics (the default).
    #[clap(
        action,
        long = "self-authored-only",
        overrides_with = "no_self_authored_only"
    )]
    pub self_authored_only: bool,

    /// Also group commits authored by other people into topics.
    #[clap(action, long = "no-self-authored-only")]
    pub no_self_authored_only: bool,

    /// Shell command to run before planning the upload; a non-zero exit
    /// aborts.
    #[clap(value_parser, long = "pre-upload")]
    pub pre_upload: Option<String>,

    /// Keep transient index files under `<repo-root>/.revup/` for debugging.
    #[clap(action, long = "keep-temp")]
    pub keep_temp: bool,

    /// HTTP(S) proxy to use for forge requests.
    #[clap(value_parser, long = "proxy")]
    pub proxy: Option<String>,
}

/// Subcommands of `revup`.
#[derive(Debug, Parser)]
pub enum Command {
    /// Group local commits into topics and upload them as review branches
    /// and pull requests.
    Upload(UploadArgs),
}

/// Transform a linear sequence of local commits into independent code-review
/// branches and pull requests.
#[derive(Debug, Parser)]
#[clap(version, author, about)]
pub struct Opts {
    /// Global arguments.
    #[clap(flatten)]
    pub global_args: GlobalArgs,

    /// The subcommand to run.
    #[clap(subcommand)]
    pub command: Command,
}
