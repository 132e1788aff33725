use std::fmt::{self, Display};

/// The name of a reference, fully qualified (e.g. `refs/heads/main`,
/// `refs/remotes/origin/main`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReferenceName(String);

impl ReferenceName {
    /// Constructor.
    pub fn new(name: impl Into<String>) -> Self {
        ReferenceName(name.into())
    }

    /// View as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The fully-qualified name of a local branch.
    pub fn for_branch(branch_name: &str) -> Self {
        ReferenceName(format!("refs/heads/{branch_name}"))
    }

    /// The fully-qualified name of a remote-tracking branch.
    pub fn for_remote_branch(remote_name: &str, branch_name: &str) -> Self {
        ReferenceName(format!("refs/remotes/{remote_name}/{branch_name}"))
    }

    /// If this is a remote-tracking ref of the given remote, the branch name
    /// on that remote.
    pub fn strip_remote_prefix(&self, remote_name: &str) -> Option<&str> {
        self.0.strip_prefix(&format!("refs/remotes/{remote_name}/"))
    }
}

impl Display for ReferenceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReferenceName {
    fn from(name: &str) -> Self {
        ReferenceName(name.to_owned())
    }
}
