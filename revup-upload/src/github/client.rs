//! The production GraphQL client for GitHub.
//!
//! Queries are batched with field aliases (one HTTP round trip resolves many
//! head refs, users, or labels), every request goes through the bounded
//! forge pool, and idempotent failures (network errors, 5xx) are retried
//! with exponential backoff. Mutations are never retried after a partial
//! success; the reconciler isolates failures per topic instead.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use lib::core::task::WorkerPool;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::render::{PATCHSETS_MARKER, REVIEW_GRAPH_MARKER};

use super::{
    CommentId, CreatePullRequestParams, Error, Forge, LabelId, PullRequestId, RemotePullRequest,
    RepoInfo, ResolvedLabel, ResolvedUser, Result, UpdatePullRequestParams, UserId,
};

const GRAPHQL_ENDPOINT: &str = "https://api.github.com/graphql";
const MAX_ATTEMPTS: u32 = 3;
const QUERY_BATCH_SIZE: usize = 20;

const PR_FIELDS_FRAGMENT: &str = "\
fragment PrFields on PullRequest {
  id
  number
  url
  headRefName
  baseRefName
  title
  body
  isDraft
  merged
  labels(first: 100) { nodes { name } }
  reviewRequests(first: 100) { nodes { requestedReviewer { ... on User { login } } } }
  assignees(first: 100) { nodes { login } }
  comments(first: 100) { nodes { id body } }
}";

/// Batched GraphQL client for GitHub.
pub struct GithubClient {
    http: reqwest::Client,
    endpoint: String,
    repo_owner: String,
    repo_name: String,
    pool: WorkerPool,
    repo_info: OnceCell<RepoInfo>,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<GithubClient repo={}/{} endpoint={}>",
            self.repo_owner, self.repo_name, self.endpoint
        )
    }
}

impl GithubClient {
    /// Constructor. `proxy` is an optional HTTP(S) proxy URL.
    pub fn new(
        token: &str,
        repo_owner: String,
        repo_name: String,
        pool: WorkerPool,
        proxy: Option<&str>,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| Error::Decode("OAuth token contains invalid characters".to_owned()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder()
            .user_agent("revup")
            .default_headers(headers);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let http = builder.build()?;
        Ok(GithubClient {
            http,
            endpoint: GRAPHQL_ENDPOINT.to_owned(),
            repo_owner,
            repo_name,
            pool,
            repo_info: OnceCell::new(),
        })
    }

    /// Override the GraphQL endpoint (for GitHub Enterprise or tests).
    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    async fn try_graphql(&self, query: &str, variables: &Value) -> Result<Value> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        let value: Value =
            serde_json::from_str(&body).map_err(|err| Error::Decode(err.to_string()))?;
        if let Some(errors) = value.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(Error::GraphQl {
                    errors: errors
                        .iter()
                        .map(|error| {
                            error
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown error")
                                .to_owned()
                        })
                        .collect(),
                });
            }
        }
        value
            .get("data")
            .cloned()
            .ok_or_else(|| Error::Decode("response had no `data` field".to_owned()))
    }

    /// Issue a query, retrying idempotent failures with bounded exponential
    /// backoff.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let _permit = self.pool.acquire().await;
        debug!(query, %variables, "GraphQL request");
        let mut attempt: u32 = 1;
        loop {
            match self.try_graphql(query, &variables).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = Duration::from_millis(500 * u64::from(2u32.pow(attempt - 1)));
                    warn!(%err, attempt, "Retrying forge request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Issue a mutation: one attempt, no retries.
    async fn graphql_mutation(&self, query: &str, variables: Value) -> Result<Value> {
        let _permit = self.pool.acquire().await;
        debug!(query, %variables, "GraphQL mutation");
        self.try_graphql(query, &variables).await
    }
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a Value> {
    value
        .get(name)
        .ok_or_else(|| Error::Decode(format!("missing field `{name}`")))
}

fn str_field(value: &Value, name: &str) -> Result<String> {
    field(value, name)?
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::Decode(format!("field `{name}` was not a string")))
}

fn u64_field(value: &Value, name: &str) -> Result<u64> {
    field(value, name)?
        .as_u64()
        .ok_or_else(|| Error::Decode(format!("field `{name}` was not an integer")))
}

fn bool_field(value: &Value, name: &str) -> Result<bool> {
    field(value, name)?
        .as_bool()
        .ok_or_else(|| Error::Decode(format!("field `{name}` was not a boolean")))
}

fn nodes(value: &Value, name: &str) -> Vec<Value> {
    value
        .get(name)
        .and_then(|connection| connection.get("nodes"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Render a string as a GraphQL string literal (JSON string syntax).
fn quote(s: &str) -> String {
    serde_json::to_string(s).expect("Serializing string")
}

fn parse_pull_request(node: &Value) -> Result<RemotePullRequest> {
    let labels = nodes(node, "labels")
        .iter()
        .filter_map(|label| label.get("name").and_then(Value::as_str).map(str::to_owned))
        .collect();
    let requested_reviewers = nodes(node, "reviewRequests")
        .iter()
        .filter_map(|request| {
            request
                .get("requestedReviewer")
                .and_then(|reviewer| reviewer.get("login"))
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .collect();
    let assignees = nodes(node, "assignees")
        .iter()
        .filter_map(|assignee| {
            assignee
                .get("login")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .collect();

    let mut review_graph_comment = None;
    let mut patchsets_comment = None;
    for comment in nodes(node, "comments") {
        let (id, body) = match (
            comment.get("id").and_then(Value::as_str),
            comment.get("body").and_then(Value::as_str),
        ) {
            (Some(id), Some(body)) => (id, body),
            _ => continue,
        };
        if body.starts_with(REVIEW_GRAPH_MARKER) {
            review_graph_comment = Some((CommentId(id.to_owned()), body.to_owned()));
        } else if body.starts_with(PATCHSETS_MARKER) {
            patchsets_comment = Some((CommentId(id.to_owned()), body.to_owned()));
        }
    }

    Ok(RemotePullRequest {
        id: PullRequestId(str_field(node, "id")?),
        number: u64_field(node, "number")?,
        url: str_field(node, "url")?,
        head_ref: str_field(node, "headRefName")?,
        base_ref: str_field(node, "baseRefName")?,
        title: str_field(node, "title")?,
        body: str_field(node, "body")?,
        draft: bool_field(node, "isDraft")?,
        merged: bool_field(node, "merged")?,
        labels,
        requested_reviewers,
        assignees,
        review_graph_comment,
        patchsets_comment,
    })
}

#[async_trait::async_trait]
impl Forge for GithubClient {
    async fn query_repo_info(&self) -> Result<RepoInfo> {
        self.repo_info
            .get_or_try_init(|| async {
                let query = "query($owner: String!, $name: String!) { \
                             repository(owner: $owner, name: $name) { id } }";
                let data = self
                    .graphql(
                        query,
                        json!({ "owner": self.repo_owner, "name": self.repo_name }),
                    )
                    .await?;
                let repository = field(&data, "repository")?;
                Ok(RepoInfo {
                    id: str_field(repository, "id")?,
                    owner: self.repo_owner.clone(),
                    name: self.repo_name.clone(),
                })
            })
            .await
            .cloned()
    }

    async fn resolve_users(&self, names: &[String]) -> Result<HashMap<String, ResolvedUser>> {
        let mut resolved = HashMap::new();
        for chunk in names.chunks(QUERY_BATCH_SIZE) {
            let mut query = String::from("query {\n");
            for (index, name) in chunk.iter().enumerate() {
                writeln!(
                    &mut query,
                    "  u{index}: search(query: {}, type: USER, first: 10) \
                     {{ nodes {{ ... on User {{ login id }} }} }}",
                    quote(&format!("{name} in:login")),
                )
                .expect("Formatting query");
            }
            query.push('}');
            let data = self.graphql(&query, json!({})).await?;

            for (index, name) in chunk.iter().enumerate() {
                let candidates = nodes(&data, &format!("u{index}"));
                let name_lower = name.to_ascii_lowercase();
                let best = candidates
                    .iter()
                    .filter_map(|candidate| {
                        let login = candidate.get("login").and_then(Value::as_str)?;
                        let id = candidate.get("id").and_then(Value::as_str)?;
                        login
                            .to_ascii_lowercase()
                            .starts_with(&name_lower)
                            .then(|| (login.to_owned(), id.to_owned()))
                    })
                    .min_by_key(|(login, _id)| (login.len(), login.clone()));
                if let Some((login, id)) = best {
                    resolved.insert(
                        name.clone(),
                        ResolvedUser {
                            id: UserId(id),
                            login,
                        },
                    );
                }
            }
        }
        Ok(resolved)
    }

    async fn resolve_labels(&self, names: &[String]) -> Result<HashMap<String, ResolvedLabel>> {
        let mut resolved = HashMap::new();
        for chunk in names.chunks(QUERY_BATCH_SIZE) {
            let mut query = format!(
                "query {{ repository(owner: {}, name: {}) {{\n",
                quote(&self.repo_owner),
                quote(&self.repo_name),
            );
            for (index, name) in chunk.iter().enumerate() {
                writeln!(
                    &mut query,
                    "  l{index}: label(name: {}) {{ id name }}",
                    quote(name),
                )
                .expect("Formatting query");
            }
            query.push_str("} }");
            let data = self.graphql(&query, json!({})).await?;
            let repository = field(&data, "repository")?;

            for (index, name) in chunk.iter().enumerate() {
                let label = match repository.get(format!("l{index}")) {
                    Some(label) if !label.is_null() => label,
                    _ => continue,
                };
                resolved.insert(
                    name.clone(),
                    ResolvedLabel {
                        id: LabelId(str_field(label, "id")?),
                        name: str_field(label, "name")?,
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
        let mut pull_requests = HashMap::new();
        for chunk in head_refs.chunks(QUERY_BATCH_SIZE) {
            let mut query = format!(
                "query {{ repository(owner: {}, name: {}) {{\n",
                quote(&self.repo_owner),
                quote(&self.repo_name),
            );
            for (index, head_ref) in chunk.iter().enumerate() {
                writeln!(
                    &mut query,
                    "  pr{index}: pullRequests(headRefName: {}, states: [OPEN], first: 1) \
                     {{ nodes {{ ...PrFields }} }}",
                    quote(head_ref),
                )
                .expect("Formatting query");
            }
            query.push_str("} }\n");
            query.push_str(PR_FIELDS_FRAGMENT);
            let data = self.graphql(&query, json!({})).await?;
            let repository = field(&data, "repository")?;

            for (index, head_ref) in chunk.iter().enumerate() {
                if let Some(node) = nodes(repository, &format!("pr{index}")).first() {
                    pull_requests.insert(head_ref.clone(), parse_pull_request(node)?);
                }
            }
        }
        Ok(pull_requests)
    }

    async fn create_pull_request(
        &self,
        params: CreatePullRequestParams,
    ) -> Result<RemotePullRequest> {
        let repo_info = self.query_repo_info().await?;
        let query = format!(
            "mutation($input: CreatePullRequestInput!) {{ \
             createPullRequest(input: $input) {{ pullRequest {{ ...PrFields }} }} }}\n{}",
            PR_FIELDS_FRAGMENT,
        );
        let data = self
            .graphql_mutation(
                &query,
                json!({ "input": {
                    "repositoryId": repo_info.id,
                    "baseRefName": params.base_ref,
                    "headRefName": params.head_ref,
                    "title": params.title,
                    "body": params.body,
                    "draft": params.draft,
                } }),
            )
            .await?;
        let node = field(field(&data, "createPullRequest")?, "pullRequest")?;
        parse_pull_request(node)
    }

    async fn update_pull_request(
        &self,
        id: &PullRequestId,
        params: UpdatePullRequestParams,
    ) -> Result<()> {
        let mut input = json!({ "pullRequestId": id.0 });
        if let Some(title) = params.title {
            input["title"] = json!(title);
        }
        if let Some(body) = params.body {
            input["body"] = json!(body);
        }
        if let Some(base_ref) = params.base_ref {
            input["baseRefName"] = json!(base_ref);
        }
        self.graphql_mutation(
            "mutation($input: UpdatePullRequestInput!) { \
             updatePullRequest(input: $input) { pullRequest { id } } }",
            json!({ "input": input }),
        )
        .await?;
        Ok(())
    }

    async fn set_draft(&self, id: &PullRequestId, draft: bool) -> Result<()> {
        let query = if draft {
            "mutation($input: ConvertPullRequestToDraftInput!) { \
             convertPullRequestToDraft(input: $input) { pullRequest { id } } }"
        } else {
            "mutation($input: MarkPullRequestReadyForReviewInput!) { \
             markPullRequestReadyForReview(input: $input) { pullRequest { id } } }"
        };
        self.graphql_mutation(query, json!({ "input": { "pullRequestId": id.0 } }))
            .await?;
        Ok(())
    }

    async fn add_labels(&self, id: &PullRequestId, labels: &[LabelId]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let label_ids: Vec<&str> = labels.iter().map(|label| label.0.as_str()).collect();
        self.graphql_mutation(
            "mutation($input: AddLabelsToLabelableInput!) { \
             addLabelsToLabelable(input: $input) { clientMutationId } }",
            json!({ "input": { "labelableId": id.0, "labelIds": label_ids } }),
        )
        .await?;
        Ok(())
    }

    async fn remove_labels(&self, id: &PullRequestId, labels: &[LabelId]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        let label_ids: Vec<&str> = labels.iter().map(|label| label.0.as_str()).collect();
        self.graphql_mutation(
            "mutation($input: RemoveLabelsFromLabelableInput!) { \
             removeLabelsFromLabelable(input: $input) { clientMutationId } }",
            json!({ "input": { "labelableId": id.0, "labelIds": label_ids } }),
        )
        .await?;
        Ok(())
    }

    async fn request_reviewers(
        &self,
        id: &PullRequestId,
        users: &[UserId],
        union: bool,
    ) -> Result<()> {
        if users.is_empty() && union {
            return Ok(());
        }
        let user_ids: Vec<&str> = users.iter().map(|user| user.0.as_str()).collect();
        self.graphql_mutation(
            "mutation($input: RequestReviewsInput!) { \
             requestReviews(input: $input) { pullRequest { id } } }",
            json!({ "input": { "pullRequestId": id.0, "userIds": user_ids, "union": union } }),
        )
        .await?;
        Ok(())
    }

    async fn add_assignees(&self, id: &PullRequestId, users: &[UserId]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let user_ids: Vec<&str> = users.iter().map(|user| user.0.as_str()).collect();
        self.graphql_mutation(
            "mutation($input: AddAssigneesToAssignableInput!) { \
             addAssigneesToAssignable(input: $input) { clientMutationId } }",
            json!({ "input": { "assignableId": id.0, "assigneeIds": user_ids } }),
        )
        .await?;
        Ok(())
    }

    async fn remove_assignees(&self, id: &PullRequestId, users: &[UserId]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        let user_ids: Vec<&str> = users.iter().map(|user| user.0.as_str()).collect();
        self.graphql_mutation(
            "mutation($input: RemoveAssigneesFromAssignableInput!) { \
             removeAssigneesFromAssignable(input: $input) { clientMutationId } }",
            json!({ "input": { "assignableId": id.0, "assigneeIds": user_ids } }),
        )
        .await?;
        Ok(())
    }

    async fn add_comment(&self, id: &PullRequestId, body: &str) -> Result<CommentId> {
        let data = self
            .graphql_mutation(
                "mutation($input: AddCommentInput!) { \
                 addComment(input: $input) { commentEdge { node { id } } } }",
                json!({ "input": { "subjectId": id.0, "body": body } }),
            )
            .await?;
        let node = field(
            field(field(&data, "addComment")?, "commentEdge")?,
            "node",
        )?;
        Ok(CommentId(str_field(node, "id")?))
    }

    async fn update_comment(&self, id: &CommentId, body: &str) -> Result<()> {
        self.graphql_mutation(
            "mutation($input: UpdateIssueCommentInput!) { \
             updateIssueComment(input: $input) { issueComment { id } } }",
            json!({ "input": { "id": id.0, "body": body } }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_pull_request, quote};

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("with \"quotes\""), "\"with \\\"quotes\\\"\"");
    }

    #[test]
    fn test_parse_pull_request() {
        let node = json!({
            "id": "PR_123",
            "number": 42,
            "url": "https://github.com/octo/repo/pull/42",
            "headRefName": "revup/alice/main/foo",
            "baseRefName": "main",
            "title": "commit a",
            "body": "body text",
            "isDraft": false,
            "merged": false,
            "labels": { "nodes": [{ "name": "bug" }] },
            "reviewRequests": { "nodes": [
                { "requestedReviewer": { "login": "bob" } },
                { "requestedReviewer": null },
            ] },
            "assignees": { "nodes": [{ "login": "carol" }] },
            "comments": { "nodes": [
                { "id": "C_1", "body": "<!-- revup: patchsets -->\nrest" },
                { "id": "C_2", "body": "unrelated comment" },
            ] },
        });
        let pull_request = parse_pull_request(&node).expect("parsing PR node");
        assert_eq!(pull_request.number, 42);
        assert_eq!(pull_request.labels, vec!["bug".to_owned()]);
        assert_eq!(pull_request.requested_reviewers, vec!["bob".to_owned()]);
        assert_eq!(pull_request.assignees, vec!["carol".to_owned()]);
        let (comment_id, _body) = pull_request.patchsets_comment.expect("patchsets comment");
        assert_eq!(comment_id.0, "C_1");
        assert!(pull_request.review_graph_comment.is_none());
    }
}
