//! GitHub forge integration.
//!
//! The pipeline talks to the forge through the [`Forge`] trait, so that the
//! reconciler can be exercised against an in-memory implementation in tests.
//! The production implementation is [`client::GithubClient`], a batched
//! GraphQL client.

pub mod client;

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("forge request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("forge returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("forge returned errors: {}", errors.join("; "))]
    GraphQl { errors: Vec<String> },

    #[error("could not decode forge response: {0}")]
    Decode(String),

    #[error(
        "could not determine the GitHub repository from remote URL {url:?}; \
         expected a github.com URL like `git@github.com:owner/repo.git`"
    )]
    UnrecognizedRemoteUrl { url: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the request might succeed (network errors and server
    /// errors; never 4xx semantic failures).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Status { status, .. } => *status >= 500,
            Error::GraphQl { .. } | Error::Decode(_) | Error::UnrecognizedRemoteUrl { .. } => {
                false
            }
        }
    }
}

/// GraphQL node id of a pull request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PullRequestId(pub String);

/// GraphQL node id of an issue comment.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommentId(pub String);

/// GraphQL node id of a user.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

/// GraphQL node id of a label.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LabelId(pub String);

/// The repository the client operates on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoInfo {
    /// GraphQL node id.
    pub id: String,

    /// Repository owner login.
    pub owner: String,

    /// Repository name.
    pub name: String,
}

impl RepoInfo {
    /// The repository's web URL.
    pub fn https_url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.name)
    }
}

/// A user resolved from a short-form name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedUser {
    /// GraphQL node id.
    pub id: UserId,

    /// The full login.
    pub login: String,
}

/// A label resolved by exact name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLabel {
    /// GraphQL node id.
    pub id: LabelId,

    /// The label name.
    pub name: String,
}

/// The remote state of a pull request, as used by the reconciler.
#[derive(Clone, Debug)]
pub struct RemotePullRequest {
    /// GraphQL node id.
    pub id: PullRequestId,

    /// PR number.
    pub number: u64,

    /// Web URL.
    pub url: String,

    /// Head branch name.
    pub head_ref: String,

    /// Base branch name.
    pub base_ref: String,

    /// Title.
    pub title: String,

    /// Body.
    pub body: String,

    /// Whether the PR is a draft.
    pub draft: bool,

    /// Whether the PR has been merged.
    pub merged: bool,

    /// Label names currently applied.
    pub labels: Vec<String>,

    /// Logins of currently-requested reviewers.
    pub requested_reviewers: Vec<String>,

    /// Logins of current assignees.
    pub assignees: Vec<String>,

    /// The review-graph comment, if the tool has posted one.
    pub review_graph_comment: Option<(CommentId, String)>,

    /// The patchsets comment, if the tool has posted one.
    pub patchsets_comment: Option<(CommentId, String)>,
}

/// Parameters for creating a pull request.
#[derive(Clone, Debug)]
pub struct CreatePullRequestParams {
    /// Head branch name.
    pub head_ref: String,

    /// Base branch name.
    pub base_ref: String,

    /// Title.
    pub title: String,

    /// Body.
    pub body: String,

    /// Create as draft.
    pub draft: bool,
}

/// Updates to apply to an existing pull request. `None` fields are left
/// unchanged.
#[derive(Clone, Debug, Default)]
pub struct UpdatePullRequestParams {
    /// New title.
    pub title: Option<String>,

    /// New body.
    pub body: Option<String>,

    /// New base branch.
    pub base_ref: Option<String>,
}

/// The forge operations the reconciler needs. Implementations must be safe
/// to call concurrently.
#[async_trait]
pub trait Forge: Debug + Send + Sync {
    /// The repository the forge operates on.
    async fn query_repo_info(&self) -> Result<RepoInfo>;

    /// Resolve short-form user names to logins/ids. For each requested name,
    /// the user set with that prefix is searched and the shortest
    /// exact-prefix match wins. Unresolved names are absent from the result
    /// (the caller warns).
    async fn resolve_users(&self, names: &[String]) -> Result<HashMap<String, ResolvedUser>>;

    /// Resolve labels by exact name. Unresolved labels are absent from the
    /// result (the caller warns).
    async fn resolve_labels(&self, names: &[String]) -> Result<HashMap<String, ResolvedLabel>>;

    /// Query open pull requests by head branch name.
    async fn query_pull_requests(
        &self,
        head_refs: &[String],
    ) -> Result<HashMap<String, RemotePullRequest>>;

    /// Create a pull request.
    async fn create_pull_request(
        &self,
        params: CreatePullRequestParams,
    ) -> Result<RemotePullRequest>;

    /// Update a pull request's title/body/base.
    async fn update_pull_request(
        &self,
        id: &PullRequestId,
        params: UpdatePullRequestParams,
    ) -> Result<()>;

    /// Toggle the draft state.
    async fn set_draft(&self, id: &PullRequestId, draft: bool) -> Result<()>;

    /// Add labels.
    async fn add_labels(&self, id: &PullRequestId, labels: &[LabelId]) -> Result<()>;

    /// Remove labels.
    async fn remove_labels(&self, id: &PullRequestId, labels: &[LabelId]) -> Result<()>;

    /// Request reviews. With `union` the users are added to the existing
    /// set; without it the set is replaced.
    async fn request_reviewers(
        &self,
        id: &PullRequestId,
        users: &[UserId],
        union: bool,
    ) -> Result<()>;

    /// Add assignees.
    async fn add_assignees(&self, id: &PullRequestId, users: &[UserId]) -> Result<()>;

    /// Remove assignees.
    async fn remove_assignees(&self, id: &PullRequestId, users: &[UserId]) -> Result<()>;

    /// Post a new comment on the pull request.
    async fn add_comment(&self, id: &PullRequestId, body: &str) -> Result<CommentId>;

    /// Replace the body of an existing comment.
    async fn update_comment(&self, id: &CommentId, body: &str) -> Result<()>;
}

/// Parse a GitHub remote URL (ssh or https) into `(owner, name)`.
pub fn parse_github_remote_url(url: &str) -> Option<(String, String)> {
    let rest = if let Some(rest) = url.strip_prefix("git@github.com:") {
        rest
    } else if let Some(rest) = url.strip_prefix("ssh://git@github.com/") {
        rest
    } else if let Some(rest) = url.strip_prefix("https://github.com/") {
        rest
    } else if let Some(rest) = url.strip_prefix("http://github.com/") {
        rest
    } else {
        return None;
    };
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let (owner, name) = rest.split_once('/')?;
    if owner.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((owner.to_owned(), name.to_owned()))
}

#[cfg(test)]
pub(crate) mod mock;

#[cfg(test)]
mod tests {
    use super::parse_github_remote_url;

    #[test]
    fn test_parse_github_remote_url() {
        assert_eq!(
            parse_github_remote_url("git@github.com:octo/repo.git"),
            Some(("octo".to_owned(), "repo".to_owned()))
        );
        assert_eq!(
            parse_github_remote_url("https://github.com/octo/repo"),
            Some(("octo".to_owned(), "repo".to_owned()))
        );
        assert_eq!(
            parse_github_remote_url("ssh://git@github.com/octo/repo.git"),
            Some(("octo".to_owned(), "repo".to_owned()))
        );
        assert_eq!(parse_github_remote_url("https://example.com/octo/repo"), None);
        assert_eq!(parse_github_remote_url("git@github.com:broken"), None);
    }
}
