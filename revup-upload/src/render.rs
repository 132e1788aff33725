//! Rendering of the review-graph and patchsets comments.
//!
//! Both comments are plain Markdown with an HTML-comment marker identifying
//! them and, for patchsets, a JSON trailer carrying the machine-readable
//! history. Rendering is deterministic: the same input always produces the
//! same bytes, so a string comparison against the existing comment decides
//! whether an update is needed.

use serde::{Deserialize, Serialize};

/// Marker identifying the review-graph comment.
pub const REVIEW_GRAPH_MARKER: &str = "<!-- revup: review-graph -->";

/// Marker identifying the patchsets comment.
pub const PATCHSETS_MARKER: &str = "<!-- revup: patchsets -->";

const DATA_PREFIX: &str = "<!-- revup-data: ";
const DATA_SUFFIX: &str = " -->";

/// One node of the review graph, flattened in topological order (ancestors
/// first).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewGraphEntry {
    /// Nesting depth (number of relative ancestors).
    pub depth: usize,

    /// The pull request number.
    pub number: u64,

    /// The pull request title.
    pub title: String,

    /// The pull request URL.
    pub url: String,

    /// Whether this entry is the pull request the comment is posted on.
    pub is_current: bool,
}

/// Render the review-graph comment body.
pub fn render_review_graph(entries: &[ReviewGraphEntry]) -> String {
    let mut body = String::new();
    body.push_str(REVIEW_GRAPH_MARKER);
    body.push_str("\n### Reviews in this chain\n\n");
    for entry in entries {
        body.push_str(&"  ".repeat(entry.depth));
        body.push_str(&format!(
            "- [#{} {}]({})",
            entry.number, entry.title, entry.url
        ));
        if entry.is_current {
            body.push_str(" **(this PR)**");
        }
        body.push('\n');
    }
    body
}

/// One row of the patchsets history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchsetRow {
    /// 1-based patchset number.
    pub index: u64,

    /// Push time, UTC, ISO-8601 to seconds.
    pub date: String,

    /// Full OID of the base the branch was synthesized on.
    pub base_oid: String,

    /// Full OID of the pushed head.
    pub head_oid: String,
}

/// The machine-readable state carried inside the patchsets comment. Besides
/// the row history, it records which labels/users the tool applied, so that
/// reconciliation never removes anything added through the UI.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchsetsData {
    /// Patchset rows, append-only, oldest first.
    pub rows: Vec<PatchsetRow>,

    /// Labels last applied by the tool.
    #[serde(default)]
    pub managed_labels: Vec<String>,

    /// Reviewers last requested by the tool.
    #[serde(default)]
    pub managed_reviewers: Vec<String>,

    /// Assignees last set by the tool.
    #[serde(default)]
    pub managed_assignees: Vec<String>,
}

impl PatchsetsData {
    /// The base OID recorded by the most recent row, if any.
    pub fn last_base_oid(&self) -> Option<&str> {
        self.rows.last().map(|row| row.base_oid.as_str())
    }
}

fn short(oid: &str) -> &str {
    oid.get(..8).unwrap_or(oid)
}

/// Render the patchsets comment body. `compare_url_base` is the repository's
/// web URL (e.g. `https://github.com/octocat/spoon-knife`).
pub fn render_patchsets(data: &PatchsetsData, compare_url_base: &str) -> String {
    let mut body = String::new();
    body.push_str(PATCHSETS_MARKER);
    body.push_str("\n### Patchsets\n\n");
    body.push_str("| # | Date (UTC) | Base | Head | Diff | vs upstream |\n");
    body.push_str("|---|---|---|---|---|---|\n");
    let mut previous: Option<&PatchsetRow> = None;
    for row in &data.rows {
        // The plain diff compares against the previous push; the
        // upstream-aware diff excludes changes that came from base movement
        // by comparing against the current base instead when the base moved.
        let (diff_from, diff_to) = match previous {
            None => (short(&row.base_oid), short(&row.head_oid)),
            Some(previous_row) => (short(&previous_row.head_oid), short(&row.head_oid)),
        };
        let diff_link = format!("{compare_url_base}/compare/{diff_from}..{diff_to}");
        let upstream_link = match previous {
            Some(previous_row) if previous_row.base_oid != row.base_oid => format!(
                "{compare_url_base}/compare/{}..{}",
                short(&row.base_oid),
                short(&row.head_oid)
            ),
            _ => diff_link.clone(),
        };
        body.push_str(&format!(
            "| {} | {} | `{}` | `{}` | [diff]({}) | [diff]({}) |\n",
            row.index,
            row.date,
            short(&row.base_oid),
            short(&row.head_oid),
            diff_link,
            upstream_link,
        ));
        previous = Some(row);
    }
    body.push('\n');
    body.push_str(DATA_PREFIX);
    body.push_str(&serde_json::to_string(data).expect("Serializing patchsets data"));
    body.push_str(DATA_SUFFIX);
    body.push('\n');
    body
}

/// Recover the patchsets state from an existing comment body.
pub fn parse_patchsets(body: &str) -> Option<PatchsetsData> {
    let start = body.rfind(DATA_PREFIX)? + DATA_PREFIX.len();
    let end = start + body[start..].find(DATA_SUFFIX)?;
    serde_json::from_str(&body[start..end]).ok()
}

/// Format a timestamp (seconds since the epoch) as UTC ISO-8601 to seconds.
pub fn format_utc_date(epoch_seconds: i64) -> String {
    use chrono::{TimeZone, Utc};
    match Utc.timestamp_opt(epoch_seconds, 0) {
        chrono::LocalResult::Single(datetime) => {
            datetime.format("%Y-%m-%dT%H:%M:%SZ").to_string()
        }
        _ => String::from("1970-01-01T00:00:00Z"),
    }
}
