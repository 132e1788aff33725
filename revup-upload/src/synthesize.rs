//! Branch synthesis: cherry-picking each topic's commits onto its computed
//! parent using transient indices.
//!
//! Synthesis never touches the working tree, the user's index, or `HEAD`;
//! every tree is computed in a per-branch transient index and written
//! straight to the object database. Branches which share no ancestor
//! dependency are synthesized in parallel; within a branch the commits are
//! applied sequentially.

use itertools::Itertools;
use lib::git::{MergedTree, NonZeroOid, Repo, RepoError, Signature};
use thiserror::Error;
use tracing::instrument;

use crate::topic_graph::{BranchParent, TopicGraph};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(
        "cherry-pick conflict in topic {topic_name:?} at commit {commit}.\n\
         Conflicting paths:\n{paths}\n\
         Nothing was pushed. Rebase your local commits so the topic applies cleanly, then retry."
    )]
    CherryPickConflict {
        topic_name: String,
        commit: String,
        paths: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Options controlling synthesis.
#[derive(Clone, Debug, Default)]
pub struct SynthesisOptions {
    /// Strip recognized directive lines from the uploaded commit messages.
    pub trim_tags: bool,
}

/// The synthesized head for one branch.
#[derive(Clone, Debug)]
pub struct SynthesizedBranch {
    /// The synthesized branch head. Equal to `parent_oid` when the branch is
    /// empty.
    pub head_oid: NonZeroOid,

    /// The parent the branch was synthesized on top of (base tip or parent
    /// branch head).
    pub parent_oid: NonZeroOid,

    /// Whether every commit came out empty, in which case the branch is
    /// dropped from the plan.
    pub is_empty: bool,

    /// The number of commits actually applied (after dropping commits whose
    /// changes were already present).
    pub applied_commits: usize,
}

/// Synthesize every branch in the graph. Branches are processed in
/// topological waves: all branches whose parents are resolved synthesize
/// concurrently. A conflict anywhere aborts the whole upload.
#[instrument(skip(repo, graph, committer, options))]
pub async fn synthesize_branches(
    repo: &Repo,
    graph: &TopicGraph,
    committer: &Signature,
    options: &SynthesisOptions,
) -> Result<Vec<SynthesizedBranch>> {
    let branch_count = graph.branches.len();
    let mut results: Vec<Option<SynthesizedBranch>> = vec![None; branch_count];
    let mut completed = 0;
    while completed < branch_count {
        let ready: Vec<(usize, NonZeroOid)> = (0..branch_count)
            .filter(|&index| results[index].is_none())
            .filter_map(|index| match graph.branches[index].parent {
                BranchParent::BaseTip(tip) => Some((index, tip)),
                BranchParent::TopicBranch(parent_index) => results[parent_index]
                    .as_ref()
                    .map(|parent| (index, parent.head_oid)),
            })
            .collect();
        assert!(!ready.is_empty(), "branch synthesis failed to make progress");

        let wave = futures::future::try_join_all(
            ready
                .iter()
                .map(|&(index, parent_oid)| {
                    synthesize_one(repo, graph, index, parent_oid, committer, options)
                })
                .collect_vec(),
        )
        .await?;
        for ((index, _parent_oid), result) in ready.into_iter().zip(wave) {
            results[index] = Some(result);
            completed += 1;
        }
    }
    Ok(results
        .into_iter()
        .map(|result| result.expect("All branches were synthesized"))
        .collect())
}

#[instrument(skip(repo, graph, committer, options))]
async fn synthesize_one(
    repo: &Repo,
    graph: &TopicGraph,
    branch_index: usize,
    parent_oid: NonZeroOid,
    committer: &Signature,
    options: &SynthesisOptions,
) -> Result<SynthesizedBranch> {
    let branch = &graph.branches[branch_index];
    let topic = graph.topic_for_branch(branch);
    let transient_index = repo.transient_index(&branch_index.to_string());

    let mut current_head = parent_oid;
    let mut current_tree = repo.get_tree_oid(parent_oid).await?;
    let mut applied_commits = 0;
    let mut any_nonempty = false;
    let member_count = topic.commits.len();

    for topic_commit in &topic.commits {
        let commit = &topic_commit.commit;
        let commit_parent_tree = match commit.get_only_parent_oid() {
            Some(commit_parent_oid) => repo.get_tree_oid(commit_parent_oid).await?,
            None => repo.get_empty_tree_oid().await?,
        };
        let originally_empty = commit.get_tree_oid() == commit_parent_tree;

        let new_tree = if originally_empty {
            // An intentionally-empty commit (e.g. a body carrier); nothing
            // to merge.
            current_tree
        } else {
            let merged = transient_index
                .merge_trees(commit_parent_tree, current_tree, commit.get_tree_oid())
                .await?;
            match merged {
                MergedTree::Clean(tree_oid) => tree_oid,
                MergedTree::Conflicted { conflicting_paths } => {
                    return Err(Error::CherryPickConflict {
                        topic_name: topic.name.clone(),
                        commit: commit.friendly_describe(),
                        paths: conflicting_paths
                            .iter()
                            .map(|path| format!("  {}", path.display()))
                            .join("\n"),
                    });
                }
            }
        };

        let synthesized_empty = new_tree == current_tree;
        if !synthesized_empty {
            any_nonempty = true;
        }
        if synthesized_empty && !originally_empty && member_count > 1 {
            // The change is already present on the parent (e.g. it landed
            // upstream); drop the commit.
            continue;
        }

        let message = if options.trim_tags {
            topic_commit.parsed.trimmed_message.as_str()
        } else {
            commit.get_message()
        };
        current_head = repo
            .commit_tree(
                new_tree,
                &[current_head],
                commit.get_author(),
                committer,
                message,
            )
            .await?;
        current_tree = new_tree;
        applied_commits += 1;
    }

    let is_empty = !any_nonempty;
    Ok(SynthesizedBranch {
        head_oid: if is_empty { parent_oid } else { current_head },
        parent_oid,
        is_empty,
        applied_commits,
    })
}
