//! Parsing of commit-message directives.
//!
//! Directives are lines of the form `Name: value1, value2, …` anywhere in a
//! commit message body. Names are case-insensitive and accept both singular
//! and plural forms. Unrecognized names are preserved in the body verbatim.

use std::fmt::{self, Display};

use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("directive `{name}:` has an empty value")]
    EmptyValue { name: String },

    #[error(
        "directive `{name}:` was given more than once, but it takes a single value; \
         remove the duplicates"
    )]
    Duplicate { name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The recognized directive kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    /// Names the topic the commit belongs to.
    Topic,

    /// Names the topic this commit's topic is relative to.
    Relative,

    /// The base branches to upload the topic to.
    Branches,

    /// Reviewers to request on the pull request.
    Reviewers,

    /// Assignees to set on the pull request.
    Assignees,

    /// Labels to apply to the pull request.
    Labels,

    /// Overrides the uploader used in branch names.
    Uploader,

    /// Selects the branch naming scheme.
    BranchFormat,

    /// Targets the pull request at an ephemeral branch.
    RelativeBranch,

    /// Whether to keep the pull request body in sync with the commit.
    UpdatePrBody,
}

impl DirectiveKind {
    /// All recognized directive kinds.
    pub const ALL: &'static [DirectiveKind] = &[
        DirectiveKind::Topic,
        DirectiveKind::Relative,
        DirectiveKind::Branches,
        DirectiveKind::Reviewers,
        DirectiveKind::Assignees,
        DirectiveKind::Labels,
        DirectiveKind::Uploader,
        DirectiveKind::BranchFormat,
        DirectiveKind::RelativeBranch,
        DirectiveKind::UpdatePrBody,
    ];

    /// The canonical (normalized) name.
    pub fn name(&self) -> &'static str {
        match self {
            DirectiveKind::Topic => "topic",
            DirectiveKind::Relative => "relative",
            DirectiveKind::Branches => "branches",
            DirectiveKind::Reviewers => "reviewers",
            DirectiveKind::Assignees => "assignees",
            DirectiveKind::Labels => "labels",
            DirectiveKind::Uploader => "uploader",
            DirectiveKind::BranchFormat => "branch-format",
            DirectiveKind::RelativeBranch => "relative-branch",
            DirectiveKind::UpdatePrBody => "update-pr-body",
        }
    }

    /// Whether multiple occurrences union their values (as opposed to being
    /// an error).
    pub fn is_multi_valued(&self) -> bool {
        matches!(
            self,
            DirectiveKind::Branches
                | DirectiveKind::Reviewers
                | DirectiveKind::Assignees
                | DirectiveKind::Labels
        )
    }

    /// The singular and plural spellings accepted for this directive.
    fn spellings(&self) -> (&'static str, &'static str) {
        match self {
            DirectiveKind::Topic => ("topic", "topics"),
            DirectiveKind::Relative => ("relative", "relatives"),
            DirectiveKind::Branches => ("branch", "branches"),
            DirectiveKind::Reviewers => ("reviewer", "reviewers"),
            DirectiveKind::Assignees => ("assignee", "assignees"),
            DirectiveKind::Labels => ("label", "labels"),
            DirectiveKind::Uploader => ("uploader", "uploaders"),
            DirectiveKind::BranchFormat => ("branch-format", "branch-formats"),
            DirectiveKind::RelativeBranch => ("relative-branch", "relative-branches"),
            DirectiveKind::UpdatePrBody => ("update-pr-body", "update-pr-bodies"),
        }
    }

    /// Match a tag name from a commit message, case-insensitively and
    /// accepting a singular or plural spelling.
    pub fn from_tag_name(tag_name: &str) -> Option<Self> {
        let tag_name = tag_name.to_ascii_lowercase();
        Self::ALL.iter().copied().find(|kind| {
            let (singular, plural) = kind.spellings();
            tag_name == singular || tag_name == plural
        })
    }
}

impl Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The result of parsing a commit message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Recognized directives, in first-appearance order, each with its
    /// values in first-appearance order.
    pub directives: IndexMap<DirectiveKind, Vec<String>>,

    /// Names of unrecognized `Name: value` lines, for warnings. The lines
    /// themselves stay in the message.
    pub unknown_tags: Vec<String>,

    /// The message with recognized directive lines removed (for
    /// `--trim-tags`).
    pub trimmed_message: String,
}

impl ParsedMessage {
    /// The single value of a single-valued directive, if present.
    pub fn get_single(&self, kind: DirectiveKind) -> Option<&str> {
        self.directives
            .get(&kind)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// The values of a multi-valued directive (empty if absent).
    pub fn get_multi(&self, kind: DirectiveKind) -> &[String] {
        self.directives
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

lazy_static! {
    static ref TAG_LINE_RE: Regex =
        Regex::new(r"^([A-Za-z][A-Za-z0-9-]*)[ \t]*:[ \t]*(.*)$").unwrap();
}

/// Parse a full commit message (subject, blank line, body). Directive lines
/// are recognized in the body only.
pub fn parse_commit_message(message: &str) -> Result<ParsedMessage> {
    let (subject, body) = match message.split_once('\n') {
        Some((subject, body)) => (subject, body),
        None => (message, ""),
    };

    let mut directives: IndexMap<DirectiveKind, Vec<String>> = IndexMap::new();
    let mut unknown_tags = Vec::new();
    let mut kept_lines = Vec::new();
    for line in body.lines() {
        let captures = match TAG_LINE_RE.captures(line) {
            Some(captures) => captures,
            None => {
                kept_lines.push(line);
                continue;
            }
        };
        let tag_name = &captures[1];
        let kind = match DirectiveKind::from_tag_name(tag_name) {
            Some(kind) => kind,
            None => {
                unknown_tags.push(tag_name.to_owned());
                kept_lines.push(line);
                continue;
            }
        };

        let values: Vec<String> = captures[2]
            .split(',')
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .collect();
        if values.is_empty() {
            return Err(Error::EmptyValue {
                name: tag_name.to_owned(),
            });
        }

        match directives.entry(kind) {
            indexmap::map::Entry::Vacant(entry) => {
                entry.insert(values);
            }
            indexmap::map::Entry::Occupied(mut entry) => {
                if !kind.is_multi_valued() {
                    return Err(Error::Duplicate {
                        name: tag_name.to_owned(),
                    });
                }
                for value in values {
                    if !entry.get().contains(&value) {
                        entry.get_mut().push(value);
                    }
                }
            }
        }
    }

    let trimmed_message = {
        let mut trimmed = String::from(subject);
        let body = kept_lines.join("\n");
        let body = body.trim_matches('\n');
        if !body.is_empty() {
            trimmed.push_str("\n\n");
            trimmed.push_str(body);
            trimmed.push('\n');
        } else {
            trimmed.push('\n');
        }
        trimmed
    };

    Ok(ParsedMessage {
        directives,
        unknown_tags,
        trimmed_message,
    })
}

/// Format directives back into tag lines, one per directive, in order. Used
/// by tests to check the parse/format round trip.
pub fn format_directives(directives: &IndexMap<DirectiveKind, Vec<String>>) -> String {
    let mut result = String::new();
    for (kind, values) in directives {
        let name = kind.name();
        // Render with the canonical capitalization.
        let mut tag_name = String::new();
        let mut capitalize = true;
        for c in name.chars() {
            if capitalize {
                tag_name.extend(c.to_uppercase());
                capitalize = false;
            } else {
                tag_name.push(c);
            }
            if c == '-' {
                capitalize = true;
            }
        }
        result.push_str(&format!("{}: {}\n", tag_name, values.join(", ")));
    }
    result
}
