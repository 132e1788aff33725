//! Deciding whether a synthesized branch semantically matches what is
//! already on the remote.
//!
//! Comparison is by patch equality rather than commit-OID equality, so a
//! branch survives rewritten committer metadata: the patch set of a branch
//! is the ordered list of `(subject, patch-id)` pairs of its commits, where
//! the patch id is the stable hash of the canonical tree diff (see
//! [`lib::git::Repo::get_patch_id`]).

use lib::git::{NonZeroOid, PatchId, Repo, RepoResult};
use tracing::instrument;

/// How a synthesized branch relates to its remote counterpart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchClassification {
    /// The remote branch does not exist yet.
    New,

    /// The remote head is identical to the synthesized head.
    Unchanged,

    /// The patches match but the branch was rebased; no push is needed
    /// unless `--rebase` was given.
    RebasedOnly,

    /// The content differs; a push is required.
    Changed,
}

impl BranchClassification {
    /// Whether this classification requires a push, given the `--rebase`
    /// flag.
    pub fn needs_push(&self, rebase: bool) -> bool {
        match self {
            BranchClassification::New | BranchClassification::Changed => true,
            BranchClassification::RebasedOnly => rebase,
            BranchClassification::Unchanged => false,
        }
    }
}

/// Compute the patch set of `parent..head`: for each commit, its subject and
/// patch id (`None` for an empty commit).
pub async fn patch_set(
    repo: &Repo,
    parent: NonZeroOid,
    head: NonZeroOid,
) -> RepoResult<Vec<(String, Option<PatchId>)>> {
    let oids = repo.rev_list(head, &[parent]).await?;
    let mut result = Vec::with_capacity(oids.len());
    let mut previous = parent;
    for oid in oids {
        let commit = repo.find_commit(oid).await?;
        let patch_id = repo.get_patch_id(previous, oid).await?;
        result.push((commit.get_summary().to_owned(), patch_id));
        previous = oid;
    }
    Ok(result)
}

/// Classify a synthesized branch against the remote.
///
/// `recorded_remote_parent` is the parent recorded in the last patchsets
/// row, when available; otherwise the comparison parent is derived from the
/// merge base of the remote head and the synthesized parent. Any failure to
/// reconstruct the remote patch set (e.g. objects not fetched) degrades to
/// `Changed`, which at worst causes a redundant push.
#[instrument(skip(repo))]
pub async fn classify_branch(
    repo: &Repo,
    synthesized_head: NonZeroOid,
    synthesized_parent: NonZeroOid,
    remote_head: Option<NonZeroOid>,
    recorded_remote_parent: Option<NonZeroOid>,
) -> RepoResult<BranchClassification> {
    let remote_head = match remote_head {
        None => return Ok(BranchClassification::New),
        Some(remote_head) => remote_head,
    };
    if remote_head == synthesized_head {
        return Ok(BranchClassification::Unchanged);
    }

    let remote_parent = match recorded_remote_parent {
        Some(remote_parent) => remote_parent,
        None => match repo.merge_base(remote_head, synthesized_parent).await? {
            Some(merge_base) => merge_base,
            None => return Ok(BranchClassification::Changed),
        },
    };
    if !repo.is_ancestor(remote_parent, remote_head).await? {
        return Ok(BranchClassification::Changed);
    }

    let local_patches = patch_set(repo, synthesized_parent, synthesized_head).await?;
    let remote_patches = match patch_set(repo, remote_parent, remote_head).await {
        Ok(remote_patches) => remote_patches,
        Err(_) => return Ok(BranchClassification::Changed),
    };
    if local_patches == remote_patches {
        Ok(BranchClassification::RebasedOnly)
    } else {
        Ok(BranchClassification::Changed)
    }
}
