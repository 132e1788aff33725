//! In-memory [`Forge`] implementation for tests.
//!
//! Stores pull requests keyed by head ref, applies mutations to them, and
//! records every mutation as a human-readable line so tests can assert that
//! the reconciler issues exactly the expected set of calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    CommentId, CreatePullRequestParams, Forge, LabelId, PullRequestId, RemotePullRequest,
    RepoInfo, ResolvedLabel, ResolvedUser, Result, UpdatePullRequestParams, UserId,
};

pub struct MockForge {
    pub repo_info: RepoInfo,

    /// Logins known to the forge, for user resolution.
    pub known_users: Vec<String>,

    /// Label names known to the repository.
    pub known_labels: Vec<String>,

    /// Pull requests by head ref.
    pub pull_requests: Mutex<HashMap<String, RemotePullRequest>>,

    /// Human-readable record of every mutation issued.
    pub mutations: Mutex<Vec<String>>,

    next_number: AtomicU64,
    next_comment: AtomicU64,
}

impl std::fmt::Debug for MockForge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<MockForge repo={}/{}>", self.repo_info.owner, self.repo_info.name)
    }
}

impl MockForge {
    pub fn new() -> Self {
        MockForge {
            repo_info: RepoInfo {
                id: "R_test".to_owned(),
                owner: "octo".to_owned(),
                name: "repo".to_owned(),
            },
            known_users: Vec::new(),
            known_labels: Vec::new(),
            pull_requests: Mutex::new(HashMap::new()),
            mutations: Mutex::new(Vec::new()),
            next_number: AtomicU64::new(100),
            next_comment: AtomicU64::new(1),
        }
    }

    pub fn record(&self, mutation: String) {
        self.mutations.lock().unwrap().push(mutation);
    }

    pub fn take_mutations(&self) -> Vec<String> {
        std::mem::take(&mut *self.mutations.lock().unwrap())
    }

    fn with_pr_mut<T>(
        &self,
        id: &PullRequestId,
        f: impl FnOnce(&mut RemotePullRequest) -> T,
    ) -> T {
        let mut pull_requests = self.pull_requests.lock().unwrap();
        let pull_request = pull_requests
            .values_mut()
            .find(|pull_request| pull_request.id == *id)
            .expect("Mutation for unknown pull request");
        f(pull_request)
    }
}

fn strip_id_prefix(id: &str) -> String {
    id.split_once('_')
        .map(|(_prefix, rest)| rest.to_owned())
        .unwrap_or_else(|| id.to_owned())
}

#[async_trait]
impl Forge for MockForge {
    async fn query_repo_info(&self) -> Result<RepoInfo> {
        Ok(self.repo_info.clone())
    }

    async fn resolve_users(&self, names: &[String]) -> Result<HashMap<String, ResolvedUser>> {
        let mut resolved = HashMap::new();
        for name in names {
            let name_lower = name.to_ascii_lowercase();
            let best = self
                .known_users
                .iter()
                .filter(|login| login.to_ascii_lowercase().starts_with(&name_lower))
                .min_by_key(|login| (login.len(), (*login).clone()));
            if let Some(login) = best {
                resolved.insert(
                    name.clone(),
                    ResolvedUser {
                        id: UserId(format!("U_{login}")),
                        login: login.clone(),
                    },
                );
            }
        }
        Ok(resolved)
    }

    async fn resolve_labels(&self, names: &[String]) -> Result<HashMap<String, ResolvedLabel>> {
        let mut resolved = HashMap::new();
        for name in names {
            if self.known_labels.contains(name) {
                resolved.insert(
                    name.clone(),
                    ResolvedLabel {
                        id: LabelId(format!("L_{name}")),
                        name: name.clone(),
                    },
                );
            }
        }
        Ok(resolved)
    }

    async fn query_pull_requests(
        &self,
        head_refs: &[String],
    ) -> Result<HashMap<String, RemotePullRequest>> {
        let pull_requests = self.pull_requests.lock().unwrap();
        Ok(head_refs
            .iter()
            .filter_map(|head_ref| {
                pull_requests
                    .get(head_ref)
                    .map(|pull_request| (head_ref.clone(), pull_request.clone()))
            })
            .collect())
    }

    async fn create_pull_request(
        &self,
        params: CreatePullRequestParams,
    ) -> Result<RemotePullRequest> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        self.record(format!(
            "create-pr head={} base={} title={:?} draft={}",
            params.head_ref, params.base_ref, params.title, params.draft
        ));
        let pull_request = RemotePullRequest {
            id: PullRequestId(format!("PR_{number}")),
            number,
            url: format!("{}/pull/{number}", self.repo_info.https_url()),
            head_ref: params.head_ref.clone(),
            base_ref: params.base_ref,
            title: params.title,
            body: params.body,
            draft: params.draft,
            merged: false,
            labels: Vec::new(),
            requested_reviewers: Vec::new(),
            assignees: Vec::new(),
            review_graph_comment: None,
            patchsets_comment: None,
        };
        self.pull_requests
            .lock()
            .unwrap()
            .insert(params.head_ref, pull_request.clone());
        Ok(pull_request)
    }

    async fn update_pull_request(
        &self,
        id: &PullRequestId,
        params: UpdatePullRequestParams,
    ) -> Result<()> {
        self.record(format!(
            "update-pr id={} title={:?} body={:?} base={:?}",
            id.0, params.title, params.body, params.base_ref
        ));
        self.with_pr_mut(id, |pull_request| {
            if let Some(title) = params.title {
                pull_request.title = title;
            }
            if let Some(body) = params.body {
                pull_request.body = body;
            }
            if let Some(base_ref) = params.base_ref {
                pull_request.base_ref = base_ref;
            }
        });
        Ok(())
    }

    async fn set_draft(&self, id: &PullRequestId, draft: bool) -> Result<()> {
        self.record(format!("set-draft id={} draft={draft}", id.0));
        self.with_pr_mut(id, |pull_request| pull_request.draft = draft);
        Ok(())
    }

    async fn add_labels(&self, id: &PullRequestId, labels: &[LabelId]) -> Result<()> {
        let names: Vec<String> = labels.iter().map(|label| strip_id_prefix(&label.0)).collect();
        self.record(format!("add-labels id={} labels={}", id.0, names.join(",")));
        self.with_pr_mut(id, |pull_request| {
            for name in names {
                if !pull_request.labels.contains(&name) {
                    pull_request.labels.push(name);
                }
            }
        });
        Ok(())
    }

    async fn remove_labels(&self, id: &PullRequestId, labels: &[LabelId]) -> Result<()> {
        let names: Vec<String> = labels.iter().map(|label| strip_id_prefix(&label.0)).collect();
        self.record(format!(
            "remove-labels id={} labels={}",
            id.0,
            names.join(",")
        ));
        self.with_pr_mut(id, |pull_request| {
            pull_request.labels.retain(|label| !names.contains(label));
        });
        Ok(())
    }

    async fn request_reviewers(
        &self,
        id: &PullRequestId,
        users: &[UserId],
        union: bool,
    ) -> Result<()> {
        let logins: Vec<String> = users.iter().map(|user| strip_id_prefix(&user.0)).collect();
        self.record(format!(
            "request-reviewers id={} users={} union={union}",
            id.0,
            logins.join(",")
        ));
        self.with_pr_mut(id, |pull_request| {
            if union {
                for login in logins {
                    if !pull_request.requested_reviewers.contains(&login) {
                        pull_request.requested_reviewers.push(login);
                    }
                }
            } else {
                pull_request.requested_reviewers = logins;
            }
        });
        Ok(())
    }

    async fn add_assignees(&self, id: &PullRequestId, users: &[UserId]) -> Result<()> {
        let logins: Vec<String> = users.iter().map(|user| strip_id_prefix(&user.0)).collect();
        self.record(format!(
            "add-assignees id={} users={}",
            id.0,
            logins.join(",")
        ));
        self.with_pr_mut(id, |pull_request| {
            for login in logins {
                if !pull_request.assignees.contains(&login) {
                    pull_request.assignees.push(login);
                }
            }
        });
        Ok(())
    }

    async fn remove_assignees(&self, id: &PullRequestId, users: &[UserId]) -> Result<()> {
        let logins: Vec<String> = users.iter().map(|user| strip_id_prefix(&user.0)).collect();
        self.record(format!(
            "remove-assignees id={} users={}",
            id.0,
            logins.join(",")
        ));
        self.with_pr_mut(id, |pull_request| {
            pull_request
                .assignees
                .retain(|assignee| !logins.contains(assignee));
        });
        Ok(())
    }

    async fn add_comment(&self, id: &PullRequestId, body: &str) -> Result<CommentId> {
        let comment_number = self.next_comment.fetch_add(1, Ordering::SeqCst);
        let comment_id = CommentId(format!("C_{comment_number}"));
        let marker = body.lines().next().unwrap_or_default().to_owned();
        self.record(format!("add-comment id={} marker={marker}", id.0));
        self.with_pr_mut(id, |pull_request| {
            let slot = if body.starts_with(crate::render::PATCHSETS_MARKER) {
                &mut pull_request.patchsets_comment
            } else {
                &mut pull_request.review_graph_comment
            };
            *slot = Some((comment_id.clone(), body.to_owned()));
        });
        Ok(comment_id)
    }

    async fn update_comment(&self, id: &CommentId, body: &str) -> Result<()> {
        self.record(format!("update-comment id={}", id.0));
        let mut pull_requests = self.pull_requests.lock().unwrap();
        for pull_request in pull_requests.values_mut() {
            for slot in [
                &mut pull_request.review_graph_comment,
                &mut pull_request.patchsets_comment,
            ] {
                if let Some((comment_id, comment_body)) = slot {
                    if comment_id == id {
                        *comment_body = body.to_owned();
                    }
                }
            }
        }
        Ok(())
    }
}
