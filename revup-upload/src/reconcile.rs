//! Reconciling local intent against forge state.
//!
//! Planning computes, per branch, a classification and the mutations that
//! would bring the forge in line with the local topics. Execution performs
//! them in dependency order: push, then create/update the pull request, then
//! reconcile labels/users/draft, then update the comments. Failures are
//! isolated per topic; other topics proceed.

use std::collections::HashMap;
use std::fmt::Write as _;

use eyre::Context;
use futures::future::join_all;
use itertools::Itertools;
use lib::core::effects::{Effects, STYLE_SKIPPED, STYLE_SUCCESS, STYLE_WARNING};
use lib::git::{MaybeZeroOid, NonZeroOid, PushSpec, ReferenceName, Repo};
use tracing::instrument;

use crate::github::{
    CreatePullRequestParams, Forge, RemotePullRequest, ResolvedLabel, ResolvedUser,
    UpdatePullRequestParams, UserId,
};
use crate::rebase_detect::{classify_branch, BranchClassification};
use crate::render::{
    self, format_utc_date, PatchsetRow, PatchsetsData, ReviewGraphEntry,
};
use crate::synthesize::SynthesizedBranch;
use crate::topic_graph::{BranchParent, Topic, TopicGraph};

/// Options affecting planning and execution.
#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    /// The remote to push to.
    pub remote_name: String,

    /// Whether rebase-only branches should be pushed.
    pub rebase: bool,

    /// Skip all pull request mutations; only push.
    pub push_only: bool,

    /// Default for updating PR titles/bodies (overridden per topic by
    /// `Update-Pr-Body:`).
    pub update_pr_body: bool,

    /// Maintain review-graph comments.
    pub review_graph: bool,

    /// Maintain patchsets comments.
    pub patchsets: bool,

    /// Also create local refs for pushed branches.
    pub create_local_branches: bool,

    /// The owner of the repository being uploaded to, for cross-fork
    /// detection.
    pub repo_owner: Option<String>,

    /// The invocation timestamp, for patchset rows.
    pub now_epoch: i64,
}

/// One branch's entry in the upload plan.
#[derive(Clone, Debug)]
pub struct PlanEntry {
    /// Index into `TopicGraph::branches`.
    pub branch_index: usize,

    /// The remote branch name.
    pub branch_name: String,

    /// The owning topic.
    pub topic_name: String,

    /// The base branch.
    pub base_branch: String,

    /// How the branch relates to its remote counterpart.
    pub classification: BranchClassification,

    /// The synthesized head.
    pub head_oid: NonZeroOid,

    /// What the branch was synthesized on.
    pub parent_oid: NonZeroOid,

    /// The last-pushed head, from the remote-tracking ref.
    pub remote_head: Option<NonZeroOid>,

    /// The ref the pull request should target.
    pub target_ref: String,

    /// The existing pull request, if any.
    pub pull_request: Option<RemotePullRequest>,

    /// All commits came out empty; the branch is dropped.
    pub is_empty: bool,

    /// The PR target lives in a different fork; PR creation is deferred.
    pub cross_fork: bool,
}

impl PlanEntry {
    /// Whether this entry requires a push.
    pub fn needs_push(&self, rebase: bool) -> bool {
        !self.is_empty && self.classification.needs_push(rebase)
    }
}

/// The computed upload plan, in the same (topological) order as the graph's
/// branches.
#[derive(Clone, Debug)]
pub struct UploadPlan {
    /// Plan entries.
    pub entries: Vec<PlanEntry>,
}

/// If the relative branch names a fork (`owner:branch`), return the owner.
fn relative_branch_fork_owner(relative_branch: &str) -> Option<&str> {
    relative_branch
        .split_once(':')
        .map(|(owner, _branch)| owner)
}

/// Build the upload plan: classify every branch and compute its PR target.
#[instrument(skip_all)]
pub async fn build_plan(
    repo: &Repo,
    graph: &TopicGraph,
    synthesized: &[SynthesizedBranch],
    pull_requests: &HashMap<String, RemotePullRequest>,
    options: &ReconcileOptions,
) -> eyre::Result<UploadPlan> {
    let mut entries: Vec<PlanEntry> = Vec::with_capacity(graph.branches.len());
    for (branch_index, branch) in graph.branches.iter().enumerate() {
        let synthesized_branch = &synthesized[branch_index];
        let pull_request = pull_requests.get(&branch.branch_name).cloned();

        let remote_ref =
            ReferenceName::for_remote_branch(&options.remote_name, &branch.branch_name);
        let remote_head = repo.resolve_reference(remote_ref.as_str()).await?;

        // The recorded parent of the remote head comes from the last
        // patchsets row when available.
        let recorded_remote_parent = pull_request
            .as_ref()
            .and_then(|pull_request| pull_request.patchsets_comment.as_ref())
            .and_then(|(_id, body)| render::parse_patchsets(body))
            .and_then(|data| data.last_base_oid().and_then(|oid| oid.parse().ok()));

        let classification = if synthesized_branch.is_empty {
            BranchClassification::Unchanged
        } else {
            classify_branch(
                repo,
                synthesized_branch.head_oid,
                synthesized_branch.parent_oid,
                remote_head,
                recorded_remote_parent,
            )
            .await?
        };

        // The PR targets the relative branch if declared, otherwise the
        // parent branch's remote name, otherwise the base branch. Empty
        // parents chain through to their own target.
        let (target_ref, cross_fork) = match &branch.relative_branch {
            Some(relative_branch) => {
                let cross_fork = match (
                    relative_branch_fork_owner(relative_branch),
                    &options.repo_owner,
                ) {
                    (Some(fork_owner), Some(repo_owner)) => fork_owner != repo_owner,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                (relative_branch.clone(), cross_fork)
            }
            None => match branch.parent {
                BranchParent::BaseTip(_) => (branch.base_branch.clone(), false),
                BranchParent::TopicBranch(parent_index) => {
                    let parent_entry: &PlanEntry = &entries[parent_index];
                    if parent_entry.is_empty {
                        (parent_entry.target_ref.clone(), parent_entry.cross_fork)
                    } else {
                        (parent_entry.branch_name.clone(), parent_entry.cross_fork)
                    }
                }
            },
        };

        entries.push(PlanEntry {
            branch_index,
            branch_name: branch.branch_name.clone(),
            topic_name: branch.topic_name.clone(),
            base_branch: branch.base_branch.clone(),
            classification,
            head_oid: synthesized_branch.head_oid,
            parent_oid: synthesized_branch.parent_oid,
            remote_head,
            target_ref,
            pull_request,
            is_empty: synthesized_branch.is_empty,
            cross_fork,
        });
    }
    Ok(UploadPlan { entries })
}

/// Print a human-readable summary of the plan.
pub fn print_plan(effects: &Effects, plan: &UploadPlan, options: &ReconcileOptions) {
    let mut output = effects.get_output_stream();
    for entry in &plan.entries {
        if entry.is_empty {
            let _ = writeln!(
                output,
                "{} {} (all commits empty; dropped)",
                STYLE_SKIPPED.apply_to("skip"),
                entry.branch_name,
            );
            continue;
        }
        let (verb, detail) = match entry.classification {
            BranchClassification::New => (
                STYLE_SUCCESS.apply_to("create").to_string(),
                format!("push, open PR against {}", entry.target_ref),
            ),
            BranchClassification::Changed => (
                STYLE_SUCCESS.apply_to("update").to_string(),
                format!("push, update PR against {}", entry.target_ref),
            ),
            BranchClassification::RebasedOnly if options.rebase => (
                STYLE_SUCCESS.apply_to("rebase").to_string(),
                "push (rebase only)".to_owned(),
            ),
            BranchClassification::RebasedOnly => (
                STYLE_SKIPPED.apply_to("skip").to_string(),
                "rebase only; not pushing (pass --rebase to push)".to_owned(),
            ),
            BranchClassification::Unchanged => (
                STYLE_SKIPPED.apply_to("skip").to_string(),
                "up to date".to_owned(),
            ),
        };
        let pr_note = match &entry.pull_request {
            Some(pull_request) => format!(" [PR #{}]", pull_request.number),
            None if entry.cross_fork => " [waiting on base in another fork]".to_owned(),
            None => String::new(),
        };
        let _ = writeln!(
            output,
            "{verb} {} -> {detail}{pr_note}",
            entry.branch_name
        );
    }
}

/// A per-topic failure recorded during execution.
#[derive(Debug)]
pub struct TopicFailure {
    /// The branch the failure occurred on.
    pub branch_name: String,

    /// The error.
    pub error: eyre::Report,
}

fn set_difference(lhs: &[String], rhs: &[String]) -> Vec<String> {
    lhs.iter()
        .filter(|item| !rhs.contains(item))
        .cloned()
        .collect()
}

fn intersection(lhs: &[String], rhs: &[String]) -> Vec<String> {
    lhs.iter().filter(|item| rhs.contains(item)).cloned().collect()
}

/// Compute the PR title and body for a topic: the first commit with a
/// non-empty subject provides both; if its body is empty, the body is taken
/// from another commit which carries one (so an empty commit can serve as
/// the body carrier).
pub fn pr_title_and_body(topic: &Topic) -> (String, String) {
    let carrier = topic
        .commits
        .iter()
        .find(|topic_commit| !topic_commit.commit.get_summary().trim().is_empty());
    let carrier = match carrier {
        Some(carrier) => carrier,
        None => return (topic.name.clone(), String::new()),
    };
    let title = carrier.commit.get_summary().trim().to_owned();
    let body_of = |topic_commit: &crate::topic_graph::TopicCommit| -> String {
        match topic_commit.parsed.trimmed_message.split_once('\n') {
            None => String::new(),
            Some((_subject, rest)) => rest.trim_matches('\n').to_owned(),
        }
    };
    let mut body = body_of(carrier);
    if body.is_empty() {
        if let Some(other) = topic
            .commits
            .iter()
            .find(|topic_commit| !body_of(topic_commit).is_empty())
        {
            body = body_of(other);
        }
    }
    (title, body)
}

struct EntryOutcome {
    pull_request: Option<RemotePullRequest>,
    pushed: bool,
}

/// Execute the plan. Returns the per-topic failures; an empty list means
/// complete success.
#[instrument(skip_all)]
pub async fn execute_plan(
    repo: &Repo,
    forge: &dyn Forge,
    graph: &TopicGraph,
    plan: &UploadPlan,
    options: &ReconcileOptions,
    effects: &Effects,
) -> eyre::Result<Vec<TopicFailure>> {
    let mut failures: Vec<TopicFailure> = Vec::new();

    // Resolve every user and label we might touch, in one batch each.
    let (resolved_users, resolved_labels) = {
        let mut user_names: Vec<String> = Vec::new();
        let mut label_names: Vec<String> = Vec::new();
        for entry in &plan.entries {
            let topic = &graph.topics[&entry.topic_name];
            for name in topic.reviewers.iter().chain(topic.assignees.iter()) {
                if !user_names.contains(name) {
                    user_names.push(name.clone());
                }
            }
            for name in &topic.labels {
                if !label_names.contains(name) {
                    label_names.push(name.clone());
                }
            }
            if let Some(data) = entry
                .pull_request
                .as_ref()
                .and_then(|pull_request| pull_request.patchsets_comment.as_ref())
                .and_then(|(_id, body)| render::parse_patchsets(body))
            {
                for name in data.managed_labels {
                    if !label_names.contains(&name) {
                        label_names.push(name);
                    }
                }
            }
        }
        let resolved_users = if options.push_only {
            HashMap::new()
        } else {
            forge.resolve_users(&user_names).await?
        };
        let resolved_labels = if options.push_only {
            HashMap::new()
        } else {
            forge.resolve_labels(&label_names).await?
        };
        for name in &user_names {
            if !options.push_only && !resolved_users.contains_key(name) {
                let _ = writeln!(
                    effects.get_error_stream(),
                    "{}: could not resolve user {name:?}; skipping",
                    STYLE_WARNING.apply_to("warning"),
                );
            }
        }
        for name in &label_names {
            if !options.push_only && !resolved_labels.contains_key(name) {
                let _ = writeln!(
                    effects.get_error_stream(),
                    "{}: could not resolve label {name:?}; skipping",
                    STYLE_WARNING.apply_to("warning"),
                );
            }
        }
        (resolved_users, resolved_labels)
    };

    // Execute in topological waves so that a child's PR is only created
    // after its parent's branch exists on the remote.
    let branch_count = plan.entries.len();
    let mut outcomes: Vec<Option<EntryOutcome>> = (0..branch_count).map(|_| None).collect();
    let mut attempted = vec![false; branch_count];
    while outcomes
        .iter()
        .zip(&attempted)
        .any(|(outcome, was_attempted)| outcome.is_none() && !*was_attempted)
    {
        let ready: Vec<usize> = (0..branch_count)
            .filter(|&index| outcomes[index].is_none() && !attempted[index])
            .filter(|&index| match graph.branches[index].parent {
                BranchParent::BaseTip(_) => true,
                BranchParent::TopicBranch(parent_index) => {
                    outcomes[parent_index].is_some() || attempted[parent_index]
                }
            })
            .collect();
        if ready.is_empty() {
            break;
        }

        let wave = join_all(ready.iter().map(|&index| {
            execute_entry(
                repo,
                forge,
                graph,
                &plan.entries[index],
                options,
                &resolved_users,
                &resolved_labels,
                effects,
            )
        }))
        .await;
        for (index, result) in ready.into_iter().zip(wave) {
            attempted[index] = true;
            match result {
                Ok(outcome) => outcomes[index] = Some(outcome),
                Err(error) => failures.push(TopicFailure {
                    branch_name: plan.entries[index].branch_name.clone(),
                    error,
                }),
            }
        }
    }

    // Second pass: review-graph comments, now that every PR exists.
    if options.review_graph && !options.push_only {
        if let Err(error) = update_review_graphs(forge, graph, plan, &outcomes).await {
            failures.push(TopicFailure {
                branch_name: "<review graph>".to_owned(),
                error,
            });
        }
    }

    Ok(failures)
}

async fn execute_entry(
    repo: &Repo,
    forge: &dyn Forge,
    graph: &TopicGraph,
    entry: &PlanEntry,
    options: &ReconcileOptions,
    resolved_users: &HashMap<String, ResolvedUser>,
    resolved_labels: &HashMap<String, ResolvedLabel>,
    effects: &Effects,
) -> eyre::Result<EntryOutcome> {
    if entry.is_empty {
        return Ok(EntryOutcome {
            pull_request: entry.pull_request.clone(),
            pushed: false,
        });
    }
    let topic = &graph.topics[&entry.topic_name];

    let pushed = entry.needs_push(options.rebase);
    if pushed {
        let expected = match entry.remote_head {
            Some(remote_head) => MaybeZeroOid::NonZero(remote_head),
            None => MaybeZeroOid::Zero,
        };
        repo.push_refs(
            &options.remote_name,
            &[PushSpec {
                oid: entry.head_oid,
                remote_branch_name: entry.branch_name.clone(),
                expected,
            }],
        )
        .await
        .wrap_err_with(|| format!("Pushing {}", entry.branch_name))?;
        let _ = writeln!(
            effects.get_output_stream(),
            "{} {}",
            STYLE_SUCCESS.apply_to("pushed"),
            entry.branch_name,
        );
    }

    if options.create_local_branches {
        let local_ref = ReferenceName::for_branch(&entry.branch_name);
        let expected = match repo.resolve_reference(local_ref.as_str()).await? {
            Some(oid) => MaybeZeroOid::NonZero(oid),
            None => MaybeZeroOid::Zero,
        };
        repo.update_ref(&local_ref, entry.head_oid, expected)
            .await
            .wrap_err_with(|| format!("Creating local branch {}", entry.branch_name))?;
    }

    if options.push_only {
        return Ok(EntryOutcome {
            pull_request: entry.pull_request.clone(),
            pushed,
        });
    }

    // Create or update the pull request.
    let update_body = topic.update_pr_body.unwrap_or(options.update_pr_body);
    let (title, body) = pr_title_and_body(topic);
    let mut pull_request = match &entry.pull_request {
        None => {
            if entry.cross_fork {
                let _ = writeln!(
                    effects.get_output_stream(),
                    "{} {}: waiting on base in another fork; not creating a PR",
                    STYLE_SKIPPED.apply_to("defer"),
                    entry.branch_name,
                );
                return Ok(EntryOutcome {
                    pull_request: None,
                    pushed,
                });
            }
            let pull_request = forge
                .create_pull_request(CreatePullRequestParams {
                    head_ref: entry.branch_name.clone(),
                    base_ref: entry.target_ref.clone(),
                    title: title.clone(),
                    body: body.clone(),
                    draft: topic.draft,
                })
                .await
                .wrap_err_with(|| format!("Creating PR for {}", entry.branch_name))?;
            let _ = writeln!(
                effects.get_output_stream(),
                "{} PR #{} for {}",
                STYLE_SUCCESS.apply_to("created"),
                pull_request.number,
                entry.branch_name,
            );
            pull_request
        }
        Some(existing) => {
            let mut params = UpdatePullRequestParams::default();
            if existing.base_ref != entry.target_ref {
                params.base_ref = Some(entry.target_ref.clone());
            }
            if update_body {
                if existing.title != title {
                    params.title = Some(title.clone());
                }
                if existing.body != body {
                    params.body = Some(body.clone());
                }
            }
            if params.title.is_some() || params.body.is_some() || params.base_ref.is_some() {
                forge
                    .update_pull_request(&existing.id, params)
                    .await
                    .wrap_err_with(|| format!("Updating PR #{}", existing.number))?;
            }
            existing.clone()
        }
    };

    // Labels, reviewers, assignees, draft. Only ever remove what the tool
    // previously added (tracked in the patchsets snapshot).
    let previous = entry
        .pull_request
        .as_ref()
        .and_then(|pull_request| pull_request.patchsets_comment.as_ref())
        .and_then(|(_id, body)| render::parse_patchsets(body))
        .unwrap_or_default();

    let desired_labels: Vec<String> = topic
        .labels
        .iter()
        .filter_map(|name| resolved_labels.get(name).map(|label| label.name.clone()))
        .collect();
    let current_labels = &pull_request.labels;
    let labels_to_add = set_difference(&desired_labels, current_labels);
    let labels_to_remove = set_difference(
        &intersection(&previous.managed_labels, current_labels),
        &desired_labels,
    );
    let label_ids = |names: &[String]| {
        names
            .iter()
            .filter_map(|name| {
                resolved_labels
                    .values()
                    .find(|label| &label.name == name)
                    .map(|label| label.id.clone())
            })
            .collect_vec()
    };
    if !labels_to_add.is_empty() {
        forge
            .add_labels(&pull_request.id, &label_ids(&labels_to_add))
            .await?;
    }
    if !labels_to_remove.is_empty() {
        forge
            .remove_labels(&pull_request.id, &label_ids(&labels_to_remove))
            .await?;
    }

    let desired_reviewers: Vec<String> = topic
        .reviewers
        .iter()
        .filter_map(|name| resolved_users.get(name).map(|user| user.login.clone()))
        .collect();
    let current_reviewers = &pull_request.requested_reviewers;
    let reviewers_to_add = set_difference(&desired_reviewers, current_reviewers);
    let reviewers_to_remove = set_difference(
        &intersection(&previous.managed_reviewers, current_reviewers),
        &desired_reviewers,
    );
    if !reviewers_to_remove.is_empty() {
        // GraphQL offers no "remove reviewers" mutation; replace the request
        // set with the survivors plus the additions.
        let final_set: Vec<String> = current_reviewers
            .iter()
            .filter(|login| !reviewers_to_remove.contains(login))
            .chain(reviewers_to_add.iter())
            .cloned()
            .unique()
            .collect();
        let final_ids = resolve_logins(forge, resolved_users, &final_set).await?;
        forge
            .request_reviewers(&pull_request.id, &final_ids, false)
            .await?;
    } else if !reviewers_to_add.is_empty() {
        let add_ids = resolve_logins(forge, resolved_users, &reviewers_to_add).await?;
        forge
            .request_reviewers(&pull_request.id, &add_ids, true)
            .await?;
    }

    let desired_assignees: Vec<String> = topic
        .assignees
        .iter()
        .filter_map(|name| resolved_users.get(name).map(|user| user.login.clone()))
        .collect();
    let current_assignees = &pull_request.assignees;
    let assignees_to_add = set_difference(&desired_assignees, current_assignees);
    let assignees_to_remove = set_difference(
        &intersection(&previous.managed_assignees, current_assignees),
        &desired_assignees,
    );
    if !assignees_to_add.is_empty() {
        let add_ids = resolve_logins(forge, resolved_users, &assignees_to_add).await?;
        forge.add_assignees(&pull_request.id, &add_ids).await?;
    }
    if !assignees_to_remove.is_empty() {
        let remove_ids = resolve_logins(forge, resolved_users, &assignees_to_remove).await?;
        forge.remove_assignees(&pull_request.id, &remove_ids).await?;
    }

    if entry.pull_request.is_some() && pull_request.draft != topic.draft {
        forge.set_draft(&pull_request.id, topic.draft).await?;
    }

    // Patchsets comment: append a row on push, refresh the managed sets.
    if options.patchsets {
        let mut data = previous.clone();
        if pushed {
            data.rows.push(PatchsetRow {
                index: u64::try_from(data.rows.len()).unwrap_or(u64::MAX) + 1,
                date: format_utc_date(options.now_epoch),
                base_oid: entry.parent_oid.to_hex(),
                head_oid: entry.head_oid.to_hex(),
            });
        }
        data.managed_labels = desired_labels;
        data.managed_reviewers = desired_reviewers;
        data.managed_assignees = desired_assignees;

        let repo_info = forge.query_repo_info().await?;
        let rendered = render::render_patchsets(&data, &repo_info.https_url());
        match &pull_request.patchsets_comment {
            Some((comment_id, existing_body)) if *existing_body != rendered => {
                forge.update_comment(comment_id, &rendered).await?;
            }
            Some(_) => {}
            None => {
                let comment_id = forge.add_comment(&pull_request.id, &rendered).await?;
                pull_request.patchsets_comment = Some((comment_id, rendered));
            }
        }
    }

    Ok(EntryOutcome {
        pull_request: Some(pull_request),
        pushed,
    })
}

async fn resolve_logins(
    forge: &dyn Forge,
    resolved_users: &HashMap<String, ResolvedUser>,
    logins: &[String],
) -> eyre::Result<Vec<UserId>> {
    let mut ids = Vec::new();
    let mut missing = Vec::new();
    for login in logins {
        match resolved_users.values().find(|user| &user.login == login) {
            Some(user) => ids.push(user.id.clone()),
            None => missing.push(login.clone()),
        }
    }
    if !missing.is_empty() {
        let extra = forge.resolve_users(&missing).await?;
        for login in &missing {
            if let Some(user) = extra.get(login) {
                ids.push(user.id.clone());
            }
        }
    }
    Ok(ids)
}

/// Update the review-graph comment of every PR in the plan. The graph for a
/// PR lists every PR connected to it through relativity, ancestors first.
async fn update_review_graphs(
    forge: &dyn Forge,
    graph: &TopicGraph,
    plan: &UploadPlan,
    outcomes: &[Option<EntryOutcome>],
) -> eyre::Result<()> {
    let branch_count = plan.entries.len();
    let pull_request_of = |index: usize| -> Option<&RemotePullRequest> {
        outcomes
            .get(index)
            .and_then(|outcome| outcome.as_ref())
            .and_then(|outcome| outcome.pull_request.as_ref())
    };

    // Connected components over the parent edges.
    let mut component_of: Vec<usize> = (0..branch_count).collect();
    for index in 0..branch_count {
        if let BranchParent::TopicBranch(parent_index) = graph.branches[index].parent {
            let root = component_of[parent_index];
            component_of[index] = root;
        }
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for index in 0..branch_count {
        components.entry(component_of[index]).or_default().push(index);
    }

    for indices in components.values() {
        // Depth = number of relative ancestors; plan order is already
        // topological, so parents appear before children.
        let mut depths: HashMap<usize, usize> = HashMap::new();
        for &index in indices {
            let depth = match graph.branches[index].parent {
                BranchParent::BaseTip(_) => 0,
                BranchParent::TopicBranch(parent_index) => {
                    depths.get(&parent_index).copied().unwrap_or(0) + 1
                }
            };
            depths.insert(index, depth);
        }

        let members: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&index| pull_request_of(index).is_some())
            .collect();
        if members.len() < 2 {
            // A lone PR gets no review-graph comment.
            continue;
        }
        for &current_index in &members {
            let current_pr = pull_request_of(current_index).expect("Member has a PR");
            let entries: Vec<ReviewGraphEntry> = members
                .iter()
                .filter_map(|&index| {
                    let pull_request = pull_request_of(index)?;
                    Some(ReviewGraphEntry {
                        depth: depths.get(&index).copied().unwrap_or(0),
                        number: pull_request.number,
                        title: pull_request.title.clone(),
                        url: pull_request.url.clone(),
                        is_current: index == current_index,
                    })
                })
                .collect();

            let rendered = render::render_review_graph(&entries);
            match &current_pr.review_graph_comment {
                Some((comment_id, existing_body)) if *existing_body != rendered => {
                    forge.update_comment(comment_id, &rendered).await?;
                }
                Some(_) => {}
                None => {
                    forge.add_comment(&current_pr.id, &rendered).await?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use lib::git::{Signature, Time};
    use lib::testing::{make_git_with_remote_repo, Git, GitWrapperWithRemoteRepo};
    use revup_opts::{AutoAddUsers, BranchFormat};

    use crate::base_branch::{resolve_branch_tip, BaseBranch};
    use crate::github::mock::MockForge;
    use crate::synthesize::{synthesize_branches, SynthesisOptions};
    use crate::topic_graph::{
        expand_branches, group_topics, TopicGraph, TopicGraphOptions,
    };

    use super::*;

    fn make_graph_options() -> TopicGraphOptions {
        TopicGraphOptions {
            auto_topic: false,
            relative_chain: false,
            self_authored_only: false,
            user_email: "test@example.com".to_owned(),
            uploader: "test".to_owned(),
            branch_format: BranchFormat::UserPlusBranch,
            default_base: "main".to_owned(),
            topic_filter: Vec::new(),
            extra_labels: Vec::new(),
            user_aliases: Vec::new(),
            auto_add_users: AutoAddUsers::No,
            relative_branch: None,
        }
    }

    fn make_reconcile_options() -> ReconcileOptions {
        ReconcileOptions {
            remote_name: "origin".to_owned(),
            rebase: false,
            push_only: false,
            update_pr_body: true,
            review_graph: true,
            patchsets: true,
            create_local_branches: false,
            repo_owner: Some("octo".to_owned()),
            now_epoch: 1700002000,
        }
    }

    /// Run the pipeline stages up to a plan against the given repo.
    async fn make_plan(
        git: &Git,
        forge: &MockForge,
        options: &ReconcileOptions,
    ) -> eyre::Result<(Repo, TopicGraph, UploadPlan)> {
        let repo = git.make_repo().await?;
        let head = repo.resolve_reference("HEAD").await?.unwrap();
        let base = resolve_branch_tip(&repo, "origin", "main").await?;
        let commit_oids = repo.rev_list(head, &[base.tip]).await?;
        let commits = repo.find_commits(&commit_oids).await?;

        let graph_options = make_graph_options();
        let (topics, _warnings) = group_topics(&commits, &graph_options)?;
        let mut base_tips: IndexMap<String, BaseBranch> = IndexMap::new();
        base_tips.insert("main".to_owned(), base);
        let graph = expand_branches(topics, &base_tips, &graph_options)?;

        let committer = Signature {
            name: "Testy McTestface".to_owned(),
            email: "test@example.com".to_owned(),
            time: Time {
                seconds: 1700002000,
                offset_minutes: 0,
            },
        };
        let synthesized = synthesize_branches(
            &repo,
            &graph,
            &committer,
            &SynthesisOptions { trim_tags: false },
        )
        .await?;

        let branch_names: Vec<String> = graph
            .branches
            .iter()
            .map(|branch| branch.branch_name.clone())
            .collect();
        let pull_requests = forge.query_pull_requests(&branch_names).await?;
        let plan = build_plan(&repo, &graph, &synthesized, &pull_requests, options).await?;
        Ok((repo, graph, plan))
    }

    async fn run_upload(
        git: &Git,
        forge: &MockForge,
        options: &ReconcileOptions,
    ) -> eyre::Result<Vec<TopicFailure>> {
        let (repo, graph, plan) = make_plan(git, forge, options).await?;
        let effects = Effects::new().suppress();
        execute_plan(&repo, forge, &graph, &plan, options, &effects).await
    }

    #[tokio::test]
    async fn test_create_flow_pushes_and_opens_prs() -> eyre::Result<()> {
        let GitWrapperWithRemoteRepo {
            temp_dir: _guard,
            original_repo,
            cloned_repo,
        } = make_git_with_remote_repo()?;
        cloned_repo.commit_file_with_contents_and_message(
            "a",
            1,
            "a contents\n",
            "commit a\n\nTopic: foo",
        )?;
        cloned_repo.commit_file_with_contents_and_message(
            "b",
            2,
            "b contents\n",
            "commit b\n\nTopic: bar\nRelative: foo",
        )?;

        let forge = MockForge::new();
        let options = make_reconcile_options();
        let failures = run_upload(&cloned_repo, &forge, &options).await?;
        assert!(failures.is_empty(), "failures: {failures:?}");

        let mutations = forge.take_mutations();
        let creates: Vec<&String> = mutations
            .iter()
            .filter(|mutation| mutation.starts_with("create-pr"))
            .collect();
        assert_eq!(creates.len(), 2);
        assert!(creates
            .iter()
            .any(|mutation| mutation.contains("head=revup/test/main/foo base=main")));
        assert!(creates.iter().any(|mutation| {
            mutation.contains("head=revup/test/main/bar base=revup/test/main/foo")
        }));

        // Both branches exist on the remote.
        let (remote_refs, _stderr) =
            original_repo.run(&["for-each-ref", "--format=%(refname)", "refs/heads/revup/*"])?;
        let mut remote_refs: Vec<&str> = remote_refs.lines().collect();
        remote_refs.sort_unstable();
        assert_eq!(
            remote_refs,
            vec![
                "refs/heads/revup/test/main/bar",
                "refs/heads/revup/test/main/foo",
            ]
        );

        // Patchsets and review-graph comments were posted.
        let pull_requests = forge.pull_requests.lock().unwrap();
        for pull_request in pull_requests.values() {
            let (_id, body) = pull_request
                .patchsets_comment
                .as_ref()
                .expect("patchsets comment");
            let data = crate::render::parse_patchsets(body).expect("parsing patchsets");
            assert_eq!(data.rows.len(), 1);
            assert!(pull_request.review_graph_comment.is_some());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_with_no_changes_is_a_no_op() -> eyre::Result<()> {
        let GitWrapperWithRemoteRepo {
            temp_dir: _guard,
            original_repo: _original_repo,
            cloned_repo,
        } = make_git_with_remote_repo()?;
        cloned_repo.commit_file_with_contents_and_message(
            "a",
            1,
            "a contents\n",
            "commit a\n\nTopic: foo",
        )?;

        let forge = MockForge::new();
        let options = make_reconcile_options();
        let failures = run_upload(&cloned_repo, &forge, &options).await?;
        assert!(failures.is_empty());
        forge.take_mutations();

        // Second run: same commits, same forge state.
        let (_repo, _graph, plan) = make_plan(&cloned_repo, &forge, &options).await?;
        assert_eq!(
            plan.entries[0].classification,
            BranchClassification::Unchanged
        );
        let failures = run_upload(&cloned_repo, &forge, &options).await?;
        assert!(failures.is_empty());
        assert_eq!(forge.take_mutations(), Vec::<String>::new());
        Ok(())
    }

    #[tokio::test]
    async fn test_draft_label_toggles_draft_state() -> eyre::Result<()> {
        let GitWrapperWithRemoteRepo {
            temp_dir: _guard,
            original_repo: _original_repo,
            cloned_repo,
        } = make_git_with_remote_repo()?;
        cloned_repo.commit_file_with_contents_and_message(
            "a",
            1,
            "a contents\n",
            "commit a\n\nTopic: foo\nLabels: draft, bug",
        )?;

        let mut forge = MockForge::new();
        forge.known_labels = vec!["bug".to_owned()];
        let options = make_reconcile_options();
        let failures = run_upload(&cloned_repo, &forge, &options).await?;
        assert!(failures.is_empty());

        let mutations = forge.take_mutations();
        assert!(mutations
            .iter()
            .any(|mutation| mutation.starts_with("create-pr") && mutation.contains("draft=true")));
        assert!(mutations
            .iter()
            .any(|mutation| mutation.contains("add-labels") && mutation.contains("labels=bug")));

        // Drop the `draft` label and re-upload: the PR leaves draft state
        // but keeps its label. The message rewrite leaves the patch
        // unchanged, so no push happens either.
        cloned_repo.run(&[
            "commit",
            "--amend",
            "-m",
            "commit a\n\nTopic: foo\nLabels: bug",
        ])?;
        let (_repo, _graph, plan) = make_plan(&cloned_repo, &forge, &options).await?;
        assert_eq!(
            plan.entries[0].classification,
            BranchClassification::RebasedOnly
        );
        let failures = run_upload(&cloned_repo, &forge, &options).await?;
        assert!(failures.is_empty());
        let mutations = forge.take_mutations();
        assert_eq!(mutations, vec!["set-draft id=PR_100 draft=false".to_owned()]);

        let pull_requests = forge.pull_requests.lock().unwrap();
        let pull_request = pull_requests.values().next().unwrap();
        assert!(!pull_request.draft);
        assert_eq!(pull_request.labels, vec!["bug".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_reviewers_are_resolved_and_reconciled() -> eyre::Result<()> {
        let GitWrapperWithRemoteRepo {
            temp_dir: _guard,
            original_repo: _original_repo,
            cloned_repo,
        } = make_git_with_remote_repo()?;
        cloned_repo.commit_file_with_contents_and_message(
            "a",
            1,
            "a contents\n",
            "commit a\n\nTopic: foo\nReviewers: ali\nAssignees: bob",
        )?;

        let mut forge = MockForge::new();
        forge.known_users = vec!["alice".to_owned(), "bob".to_owned()];
        let options = make_reconcile_options();
        let failures = run_upload(&cloned_repo, &forge, &options).await?;
        assert!(failures.is_empty());

        let mutations = forge.take_mutations();
        assert!(mutations
            .iter()
            .any(|mutation| mutation.contains("request-reviewers") && mutation.contains("alice")));
        assert!(mutations
            .iter()
            .any(|mutation| mutation.contains("add-assignees") && mutation.contains("bob")));
        Ok(())
    }

    #[test]
    fn test_pr_title_and_body_uses_body_carrier() {
        use crate::directives::parse_commit_message;
        use crate::topic_graph::TopicCommit;
        use lib::git::Commit;
        use std::str::FromStr;

        let make_topic_commit = |index: u8, message: &str| -> TopicCommit {
            let oid_hex = format!("{:02x}", index).repeat(20);
            let raw = format!(
                "tree {tree}\nparent {parent}\nauthor A <a@example.com> 1 +0000\ncommitter A <a@example.com> 1 +0000\n\n{message}",
                tree = "a".repeat(40),
                parent = "b".repeat(40),
            );
            let commit = Commit::parse(
                lib::git::NonZeroOid::from_str(&oid_hex).unwrap(),
                raw.as_bytes(),
            )
            .unwrap();
            let parsed = parse_commit_message(commit.get_message()).unwrap();
            TopicCommit { commit, parsed }
        };

        let topic = Topic {
            name: "foo".to_owned(),
            commits: vec![
                make_topic_commit(1, "Fix the bug\n\nTopic: foo"),
                make_topic_commit(2, "unimportant subject\n\nThe detailed explanation.\nTopic: foo"),
            ],
            relative_topic: None,
            base_branches: vec!["main".to_owned()],
            reviewers: Vec::new(),
            assignees: Vec::new(),
            labels: Vec::new(),
            draft: false,
            uploader: None,
            branch_format: None,
            relative_branch: None,
            update_pr_body: None,
        };
        let (title, body) = pr_title_and_body(&topic);
        assert_eq!(title, "Fix the bug");
        assert_eq!(body, "The detailed explanation.");
    }
}
