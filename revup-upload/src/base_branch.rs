//! Base-branch detection.
//!
//! Every head needs a base branch: the long-lived branch its pull requests
//! will eventually merge into. Candidates are the configured main branch and
//! any remote branches matching the configured release-branch globs; the
//! winner is the candidate whose tip is the nearest ancestor of the head.

use itertools::Itertools;
use lib::git::{NonZeroOid, ReferenceName, Repo, RepoError};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(
        "no base branch found: none of the candidate branches ({candidates}) is an ancestor \
         of the head commit {head}\n\
         If the branch you based your work on is not listed, pass it with --base-branch."
    )]
    NoBaseBranch { candidates: String, head: NonZeroOid },

    #[error(
        "base branch {name:?} not found on remote {remote:?} (no ref {reference_name} exists)"
    )]
    BranchNotFound {
        name: String,
        remote: String,
        reference_name: ReferenceName,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A detected (or explicitly selected) base branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseBranch {
    /// The branch name, as it exists on the remote (e.g. `main`, `rel1.1`).
    pub name: String,

    /// The tip of the remote-tracking ref for the branch.
    pub tip: NonZeroOid,
}

/// Resolve the tip of a branch: the remote-tracking ref if present,
/// otherwise the local branch.
#[instrument]
pub async fn resolve_branch_tip(
    repo: &Repo,
    remote_name: &str,
    branch_name: &str,
) -> Result<BaseBranch> {
    let remote_ref = ReferenceName::for_remote_branch(remote_name, branch_name);
    if let Some(tip) = repo.resolve_reference(remote_ref.as_str()).await? {
        return Ok(BaseBranch {
            name: branch_name.to_owned(),
            tip,
        });
    }
    let local_ref = ReferenceName::for_branch(branch_name);
    if let Some(tip) = repo.resolve_reference(local_ref.as_str()).await? {
        return Ok(BaseBranch {
            name: branch_name.to_owned(),
            tip,
        });
    }
    Err(Error::BranchNotFound {
        name: branch_name.to_owned(),
        remote: remote_name.to_owned(),
        reference_name: remote_ref,
    })
}

/// Detect the base branch for `head`: the candidate branch whose tip is the
/// nearest ancestor of `head` by commit count. Ties prefer the main branch,
/// then lexicographic order.
#[instrument]
pub async fn detect_base_branch(
    repo: &Repo,
    head: NonZeroOid,
    remote_name: &str,
    main_branch: &str,
    release_branch_globs: &[String],
) -> Result<BaseBranch> {
    let mut candidates: Vec<BaseBranch> = Vec::new();
    if let Ok(main) = resolve_branch_tip(repo, remote_name, main_branch).await {
        candidates.push(main);
    }

    let glob_patterns: Vec<String> = release_branch_globs
        .iter()
        .map(|glob| format!("refs/remotes/{remote_name}/{glob}"))
        .collect();
    if !glob_patterns.is_empty() {
        for (reference_name, tip) in repo.for_each_ref(&glob_patterns).await? {
            let branch_name = match reference_name.strip_remote_prefix(remote_name) {
                Some(branch_name) => branch_name.to_owned(),
                None => continue,
            };
            if candidates.iter().any(|candidate| candidate.name == branch_name) {
                continue;
            }
            candidates.push(BaseBranch {
                name: branch_name,
                tip,
            });
        }
    }

    let mut best: Option<(usize, BaseBranch)> = None;
    for candidate in &candidates {
        if !repo.is_ancestor(candidate.tip, head).await? {
            continue;
        }
        let distance = repo.rev_list_count(candidate.tip, head).await?;
        let better = match &best {
            None => true,
            Some((best_distance, best_candidate)) => {
                if distance != *best_distance {
                    distance < *best_distance
                } else if (candidate.name == main_branch) != (best_candidate.name == main_branch)
                {
                    candidate.name == main_branch
                } else {
                    candidate.name < best_candidate.name
                }
            }
        };
        if better {
            best = Some((distance, candidate.clone()));
        }
    }

    match best {
        Some((_distance, base_branch)) => Ok(base_branch),
        None => Err(Error::NoBaseBranch {
            candidates: candidates
                .iter()
                .map(|candidate| candidate.name.as_str())
                .join(", "),
            head,
        }),
    }
}

#[cfg(test)]
mod tests {
    use lib::testing::make_git;

    use super::detect_base_branch;

    #[tokio::test]
    async fn test_detect_base_branch_prefers_nearest_ancestor() -> eyre::Result<()> {
        let git = make_git()?;
        git.init_repo()?;
        git.commit_file("shared", 1)?;

        // Simulate a release branch cut from main, with the head based on it.
        git.run(&["update-ref", "refs/remotes/origin/main", "HEAD"])?;
        git.commit_file("release-only", 2)?;
        git.run(&["update-ref", "refs/remotes/origin/rel1.1", "HEAD"])?;
        git.commit_file("feature", 3)?;
        let head = git.resolve("HEAD")?;

        let repo = git.make_repo().await?;
        let base = detect_base_branch(&repo, head, "origin", "main", &["rel*".to_owned()])
            .await?;
        assert_eq!(base.name, "rel1.1");
        Ok(())
    }

    #[tokio::test]
    async fn test_detect_base_branch_tie_prefers_main() -> eyre::Result<()> {
        let git = make_git()?;
        git.init_repo()?;
        git.commit_file("shared", 1)?;

        // Both candidates point at the same commit.
        git.run(&["update-ref", "refs/remotes/origin/main", "HEAD"])?;
        git.run(&["update-ref", "refs/remotes/origin/rel1.1", "HEAD"])?;
        git.commit_file("feature", 2)?;
        let head = git.resolve("HEAD")?;

        let repo = git.make_repo().await?;
        let base = detect_base_branch(&repo, head, "origin", "main", &["rel*".to_owned()])
            .await?;
        assert_eq!(base.name, "main");
        Ok(())
    }

    #[tokio::test]
    async fn test_detect_base_branch_no_candidate() -> eyre::Result<()> {
        let git = make_git()?;
        git.init_repo()?;

        // Make the remote-tracking main point at a branch which diverged
        // from the head, so it is not an ancestor.
        git.run(&["checkout", "-b", "side"])?;
        git.commit_file("side", 1)?;
        git.run(&["update-ref", "refs/remotes/origin/main", "side"])?;
        git.run(&["checkout", "main"])?;
        git.commit_file("feature", 2)?;
        let head = git.resolve("HEAD")?;

        let repo = git.make_repo().await?;
        let result = detect_base_branch(&repo, head, "origin", "main", &[]).await;
        assert!(result.is_err());
        Ok(())
    }
}
