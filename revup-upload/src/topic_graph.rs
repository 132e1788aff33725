//! Grouping commits into topics and expanding topics into review branches.
//!
//! The builder runs in two pure stages so that the validation logic is
//! directly testable:
//!
//! 1. [`group_topics`]: walk the commits, parse directives, group by topic,
//!    union/validate directive values, resolve relativity, and validate the
//!    topic DAG.
//! 2. [`expand_branches`]: expand each topic into one branch per declared
//!    base, in topological order, once the caller has resolved every base
//!    branch tip.

use indexmap::{IndexMap, IndexSet};
use lib::git::{Commit, NonZeroOid};
use revup_opts::{AutoAddUsers, BranchFormat};
use thiserror::Error;

use crate::base_branch::BaseBranch;
use crate::directives::{self, parse_commit_message, DirectiveKind, ParsedMessage};

#[derive(Debug, Error)]
pub enum Error {
    #[error("in commit {commit}: {source}")]
    Directive {
        commit: String,
        #[source]
        source: directives::Error,
    },

    #[error(
        "merge commit {commit} is in the uploaded range; uploads require a linear history.\n\
         Rebase to flatten the history, then retry."
    )]
    MergeCommit { commit: String },

    #[error(
        "commits in topic {topic_name:?} disagree on `{directive}:`: {left:?} vs {right:?}.\n\
         Make the values match, or move the commits to different topics."
    )]
    DirectiveMismatch {
        topic_name: String,
        directive: DirectiveKind,
        left: String,
        right: String,
    },

    #[error("invalid `{directive}:` value {value:?} in topic {topic_name:?}: expected {expected}")]
    InvalidValue {
        topic_name: String,
        directive: DirectiveKind,
        value: String,
        expected: &'static str,
    },

    #[error(
        "topic {topic_name:?} is relative to {relative:?}, which is not among the uploaded \
         topics.\n\
         Check the `Relative:` tag, or include the missing topic in the upload."
    )]
    UnknownRelative {
        topic_name: String,
        relative: String,
    },

    #[error(
        "topic relativity forms a cycle: {cycle}.\n\
         Break the cycle by adjusting the `Relative:` tags."
    )]
    RelativeCycle { cycle: String },

    #[error(
        "topic {topic_name:?} declares base branch {base:?}, but its relative topic \
         {relative:?} does not.\n\
         Add {base:?} to the `Branches:` tag of {relative:?}."
    )]
    BaseNotInRelative {
        topic_name: String,
        relative: String,
        base: String,
    },

    #[error(
        "topic {topic_name:?} and its relative ancestor {relative:?} declare different \
         uploaders: {left:?} vs {right:?}"
    )]
    UploaderMismatch {
        topic_name: String,
        relative: String,
        left: String,
        right: String,
    },

    #[error(
        "topic {topic_name:?} sets `Relative-Branch:` but declares {count} base branches; \
         exactly one is required"
    )]
    RelativeBranchBases { topic_name: String, count: usize },

    #[error(
        "topic {topic_name:?} and its relative ancestor {relative:?} declare different \
         relative branches: {left:?} vs {right:?}"
    )]
    RelativeBranchMismatch {
        topic_name: String,
        relative: String,
        left: String,
        right: String,
    },

    #[error("unknown topic {topic_name:?} given on the command line; known topics: {known}")]
    UnknownTopicFilter { topic_name: String, known: String },

    #[error(
        "topic name {topic_name:?} contains characters which are not allowed in a branch name; \
         use only letters, digits, `.`, `_`, and `-`"
    )]
    InvalidTopicName { topic_name: String },

    #[error("topic {topic_name:?} declares base branch {base:?}, which could not be resolved")]
    UnknownBase { topic_name: String, base: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A commit together with its parsed message.
#[derive(Clone, Debug)]
pub struct TopicCommit {
    /// The source commit.
    pub commit: Commit,

    /// The parsed message, including the tag-stripped variant.
    pub parsed: ParsedMessage,
}

/// A named group of commits which becomes one pull request per base branch.
#[derive(Clone, Debug)]
pub struct Topic {
    /// The topic name.
    pub name: String,

    /// Member commits, in walked (parent-before-child) order.
    pub commits: Vec<TopicCommit>,

    /// The topic this one is relative to, if any.
    pub relative_topic: Option<String>,

    /// The declared base branches, in declaration order. Defaults to the
    /// detected base branch.
    pub base_branches: Vec<String>,

    /// Reviewers unioned from all member commits.
    pub reviewers: Vec<String>,

    /// Assignees unioned from all member commits.
    pub assignees: Vec<String>,

    /// Labels unioned from all member commits, minus the `draft`
    /// pseudo-label.
    pub labels: Vec<String>,

    /// Whether the `draft` pseudo-label was present.
    pub draft: bool,

    /// Per-topic uploader override.
    pub uploader: Option<String>,

    /// Per-topic branch-format override.
    pub branch_format: Option<BranchFormat>,

    /// Forge-side ephemeral branch to target instead of the computed parent.
    pub relative_branch: Option<String>,

    /// Per-topic override of `--no-update-pr-body`.
    pub update_pr_body: Option<bool>,
}

/// The parent a review branch is synthesized on top of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchParent {
    /// The tip of the base branch.
    BaseTip(NonZeroOid),

    /// The head of another review branch (index into
    /// [`TopicGraph::branches`]).
    TopicBranch(usize),
}

/// One review branch: a (topic, base) pair.
#[derive(Clone, Debug)]
pub struct TopicBranch {
    /// The owning topic.
    pub topic_name: String,

    /// The base branch this instance targets.
    pub base_branch: String,

    /// The tip of the base branch.
    pub base_tip: NonZeroOid,

    /// The computed remote branch name.
    pub branch_name: String,

    /// What the branch is synthesized on top of.
    pub parent: BranchParent,

    /// Forge-side branch the pull request should target, overriding the
    /// computed parent branch.
    pub relative_branch: Option<String>,
}

/// The validated topic DAG, expanded into branches.
#[derive(Clone, Debug)]
pub struct TopicGraph {
    /// Topics by name, in first-appearance order.
    pub topics: IndexMap<String, Topic>,

    /// Branches in topological order: parents always precede children.
    pub branches: Vec<TopicBranch>,
}

impl TopicGraph {
    /// The topic owning the given branch.
    pub fn topic_for_branch(&self, branch: &TopicBranch) -> &Topic {
        &self.topics[&branch.topic_name]
    }

    /// The branch index of the given (topic, base) pair.
    pub fn branch_index(&self, topic_name: &str, base_branch: &str) -> Option<usize> {
        self.branches.iter().position(|branch| {
            branch.topic_name == topic_name && branch.base_branch == base_branch
        })
    }
}

/// Options controlling topic grouping.
#[derive(Clone, Debug)]
pub struct TopicGraphOptions {
    /// Derive topic names from subjects for untagged commits.
    pub auto_topic: bool,

    /// Ignore `Relative:` tags and chain topics in commit order.
    pub relative_chain: bool,

    /// Hold commits authored by other people out of topic grouping.
    pub self_authored_only: bool,

    /// The user's email, for `self_authored_only`.
    pub user_email: String,

    /// The default uploader (normalized), used in branch names.
    pub uploader: String,

    /// The default branch-format.
    pub branch_format: BranchFormat,

    /// The default base branch name for topics without `Branches:`.
    pub default_base: String,

    /// If non-empty, restrict the upload to these topics plus their
    /// relative ancestors.
    pub topic_filter: Vec<String>,

    /// Extra labels applied to every topic.
    pub extra_labels: Vec<String>,

    /// `old:new` user rewrites applied to reviewers and assignees.
    pub user_aliases: Vec<(String, String)>,

    /// Whether to copy users between the reviewer and assignee roles.
    pub auto_add_users: AutoAddUsers,

    /// Relative branch applied to topics which declare none and have no
    /// relative topic.
    pub relative_branch: Option<String>,
}

fn is_valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !name.contains("..")
        && !name.ends_with('.')
}

/// Normalize an uploader name (typically the local part of an email) into a
/// usable ref component.
pub fn normalize_uploader(raw: &str) -> String {
    let mut normalized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    while normalized.contains("--") {
        normalized = normalized.replace("--", "-");
    }
    normalized.trim_matches('-').to_owned()
}

/// Derive a topic name from a commit subject, for `--auto-topic`.
pub fn auto_topic_name(commit: &Commit) -> String {
    let mut name = String::new();
    for c in commit.get_summary().chars() {
        if name.len() >= 40 {
            break;
        }
        if c.is_ascii_alphanumeric() {
            name.extend(c.to_lowercase());
        } else if !name.ends_with('-') && !name.is_empty() {
            name.push('-');
        }
    }
    let name = name.trim_matches('-').to_owned();
    if name.is_empty() {
        format!("topic-{}", commit.get_oid().to_short_hex())
    } else {
        name
    }
}

/// Compute the remote branch name for a (topic, base) pair.
pub fn branch_name(
    format: BranchFormat,
    uploader: &str,
    base_branch: &str,
    topic_name: &str,
) -> String {
    match format {
        BranchFormat::UserPlusBranch => format!("revup/{uploader}/{base_branch}/{topic_name}"),
        BranchFormat::User => format!("revup/{uploader}/{topic_name}"),
        BranchFormat::Branch => format!("revup/{base_branch}/{topic_name}"),
        BranchFormat::None => format!("revup/{topic_name}"),
    }
}

fn union_into(target: &mut Vec<String>, values: &[String]) {
    for value in values {
        if !target.iter().any(|existing| existing == value) {
            target.push(value.clone());
        }
    }
}

fn set_single_valued(
    topic_name: &str,
    directive: DirectiveKind,
    slot: &mut Option<String>,
    value: Option<&str>,
) -> Result<()> {
    let value = match value {
        Some(value) => value,
        None => return Ok(()),
    };
    match slot {
        None => {
            *slot = Some(value.to_owned());
            Ok(())
        }
        Some(existing) if existing == value => Ok(()),
        Some(existing) => Err(Error::DirectiveMismatch {
            topic_name: topic_name.to_owned(),
            directive,
            left: existing.clone(),
            right: value.to_owned(),
        }),
    }
}

/// Stage 1: group the walked commits into validated topics. Returns the
/// topics in first-appearance order plus human-readable warnings.
pub fn group_topics(
    commits: &[Commit],
    options: &TopicGraphOptions,
) -> Result<(IndexMap<String, Topic>, Vec<String>)> {
    let mut warnings = Vec::new();
    let mut topics: IndexMap<String, Topic> = IndexMap::new();
    let mut topicless_count = 0usize;

    // Raw single-valued directive values, typed later.
    let mut raw_branch_formats: IndexMap<String, Option<String>> = IndexMap::new();
    let mut raw_update_pr_bodies: IndexMap<String, Option<String>> = IndexMap::new();
    let mut raw_relatives: IndexMap<String, Option<String>> = IndexMap::new();

    for commit in commits {
        if commit.get_parent_oids().len() > 1 {
            return Err(Error::MergeCommit {
                commit: commit.friendly_describe(),
            });
        }
        let parsed = parse_commit_message(commit.get_message()).map_err(|source| {
            Error::Directive {
                commit: commit.friendly_describe(),
                source,
            }
        })?;
        for unknown_tag in &parsed.unknown_tags {
            warnings.push(format!(
                "unrecognized tag `{}:` in commit {} (kept in the message)",
                unknown_tag,
                commit.get_oid().to_short_hex()
            ));
        }

        if options.self_authored_only && commit.get_author().email != options.user_email {
            if parsed.get_single(DirectiveKind::Topic).is_some() {
                warnings.push(format!(
                    "skipping commit {} by {}: not authored by you \
                     (pass --no-self-authored-only to include it)",
                    commit.get_oid().to_short_hex(),
                    commit.get_author().email,
                ));
            }
            continue;
        }

        let topic_name = match parsed.get_single(DirectiveKind::Topic) {
            Some(topic_name) => topic_name.to_owned(),
            None if options.auto_topic => auto_topic_name(commit),
            None => {
                topicless_count += 1;
                continue;
            }
        };
        if !is_valid_topic_name(&topic_name) {
            return Err(Error::InvalidTopicName { topic_name });
        }

        let topic = topics.entry(topic_name.clone()).or_insert_with(|| Topic {
            name: topic_name.clone(),
            commits: Vec::new(),
            relative_topic: None,
            base_branches: Vec::new(),
            reviewers: Vec::new(),
            assignees: Vec::new(),
            labels: Vec::new(),
            draft: false,
            uploader: None,
            branch_format: None,
            relative_branch: None,
            update_pr_body: None,
        });

        union_into(&mut topic.base_branches, parsed.get_multi(DirectiveKind::Branches));
        union_into(&mut topic.reviewers, parsed.get_multi(DirectiveKind::Reviewers));
        union_into(&mut topic.assignees, parsed.get_multi(DirectiveKind::Assignees));
        union_into(&mut topic.labels, parsed.get_multi(DirectiveKind::Labels));

        set_single_valued(
            &topic_name,
            DirectiveKind::Relative,
            raw_relatives.entry(topic_name.clone()).or_default(),
            parsed.get_single(DirectiveKind::Relative),
        )?;
        set_single_valued(
            &topic_name,
            DirectiveKind::Uploader,
            &mut topic.uploader,
            parsed.get_single(DirectiveKind::Uploader),
        )?;
        set_single_valued(
            &topic_name,
            DirectiveKind::RelativeBranch,
            &mut topic.relative_branch,
            parsed.get_single(DirectiveKind::RelativeBranch),
        )?;
        set_single_valued(
            &topic_name,
            DirectiveKind::BranchFormat,
            raw_branch_formats.entry(topic_name.clone()).or_default(),
            parsed.get_single(DirectiveKind::BranchFormat),
        )?;
        set_single_valued(
            &topic_name,
            DirectiveKind::UpdatePrBody,
            raw_update_pr_bodies.entry(topic_name.clone()).or_default(),
            parsed.get_single(DirectiveKind::UpdatePrBody),
        )?;

        topic.commits.push(TopicCommit {
            commit: commit.clone(),
            parsed,
        });
    }

    if topicless_count > 0 {
        warnings.push(format!(
            "{topicless_count} commit(s) without a `Topic:` tag will not be uploaded \
             (pass --auto-topic to upload them)"
        ));
    }

    // Type the raw single-valued directives.
    for (topic_name, raw) in raw_branch_formats {
        if let Some(raw) = raw {
            let format = match raw.as_str() {
                "user+branch" => BranchFormat::UserPlusBranch,
                "user" => BranchFormat::User,
                "branch" => BranchFormat::Branch,
                "none" => BranchFormat::None,
                _ => {
                    return Err(Error::InvalidValue {
                        topic_name,
                        directive: DirectiveKind::BranchFormat,
                        value: raw,
                        expected: "one of `user+branch`, `user`, `branch`, `none`",
                    })
                }
            };
            topics[&topic_name].branch_format = Some(format);
        }
    }
    for (topic_name, raw) in raw_update_pr_bodies {
        if let Some(raw) = raw {
            let value = match raw.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(Error::InvalidValue {
                        topic_name,
                        directive: DirectiveKind::UpdatePrBody,
                        value: raw,
                        expected: "`true` or `false`",
                    })
                }
            };
            topics[&topic_name].update_pr_body = Some(value);
        }
    }

    // Resolve relative edges.
    if options.relative_chain {
        let names: Vec<String> = topics.keys().cloned().collect();
        for (index, name) in names.iter().enumerate() {
            topics[name].relative_topic = if index == 0 {
                None
            } else {
                Some(names[index - 1].clone())
            };
        }
    } else {
        for (topic_name, relative) in raw_relatives {
            if let Some(relative) = relative {
                if !topics.contains_key(&relative) {
                    return Err(Error::UnknownRelative {
                        topic_name,
                        relative,
                    });
                }
                topics[&topic_name].relative_topic = Some(relative);
            }
        }
    }

    validate_acyclic(&topics)?;

    // Default bases, then per-topic post-processing.
    let topic_names: Vec<String> = topics.keys().cloned().collect();
    for topic_name in &topic_names {
        let topic = &mut topics[topic_name];
        if topic.base_branches.is_empty() {
            topic.base_branches.push(options.default_base.clone());
        }
        union_into(&mut topic.labels, &options.extra_labels);

        // The `draft` label toggles the PR draft state and is never
        // submitted as a label.
        let draft = topic
            .labels
            .iter()
            .any(|label| label.eq_ignore_ascii_case("draft"));
        if draft {
            topic.draft = true;
            topic.labels.retain(|label| !label.eq_ignore_ascii_case("draft"));
        }

        for (old, new) in &options.user_aliases {
            for user in topic
                .reviewers
                .iter_mut()
                .chain(topic.assignees.iter_mut())
            {
                if user == old {
                    *user = new.clone();
                }
            }
        }
        match options.auto_add_users {
            AutoAddUsers::No => {}
            AutoAddUsers::R2a => {
                let reviewers = topic.reviewers.clone();
                union_into(&mut topic.assignees, &reviewers);
            }
            AutoAddUsers::A2r => {
                let assignees = topic.assignees.clone();
                union_into(&mut topic.reviewers, &assignees);
            }
            AutoAddUsers::Both => {
                let reviewers = topic.reviewers.clone();
                let assignees = topic.assignees.clone();
                union_into(&mut topic.assignees, &reviewers);
                union_into(&mut topic.reviewers, &assignees);
            }
        }

        if topic.relative_branch.is_none()
            && topic.relative_topic.is_none()
            && options.relative_branch.is_some()
        {
            topic.relative_branch = options.relative_branch.clone();
        }
    }

    // Validations which need the whole graph.
    for topic_name in &topic_names {
        let topic = &topics[topic_name];
        if let Some(relative) = &topic.relative_topic {
            let relative_topic = &topics[relative];
            for base in &topic.base_branches {
                if !relative_topic.base_branches.contains(base) {
                    return Err(Error::BaseNotInRelative {
                        topic_name: topic_name.clone(),
                        relative: relative.clone(),
                        base: base.clone(),
                    });
                }
            }
        }

        if let Some(uploader) = &topic.uploader {
            let mut ancestor = topic.relative_topic.clone();
            while let Some(ancestor_name) = ancestor {
                let ancestor_topic = &topics[&ancestor_name];
                if let Some(ancestor_uploader) = &ancestor_topic.uploader {
                    if ancestor_uploader != uploader {
                        return Err(Error::UploaderMismatch {
                            topic_name: topic_name.clone(),
                            relative: ancestor_name,
                            left: uploader.clone(),
                            right: ancestor_uploader.clone(),
                        });
                    }
                }
                ancestor = ancestor_topic.relative_topic.clone();
            }
        }

        if let Some(relative_branch) = &topic.relative_branch {
            if topic.base_branches.len() != 1 {
                return Err(Error::RelativeBranchBases {
                    topic_name: topic_name.clone(),
                    count: topic.base_branches.len(),
                });
            }
            let mut ancestor = topic.relative_topic.clone();
            while let Some(ancestor_name) = ancestor {
                let ancestor_topic = &topics[&ancestor_name];
                if let Some(ancestor_relative_branch) = &ancestor_topic.relative_branch {
                    if ancestor_relative_branch != relative_branch {
                        return Err(Error::RelativeBranchMismatch {
                            topic_name: topic_name.clone(),
                            relative: ancestor_name,
                            left: relative_branch.clone(),
                            right: ancestor_relative_branch.clone(),
                        });
                    }
                }
                ancestor = ancestor_topic.relative_topic.clone();
            }
        }
    }

    // Apply the positional topic filter, closing over relative ancestors.
    if !options.topic_filter.is_empty() {
        let mut keep: IndexSet<String> = IndexSet::new();
        for topic_name in &options.topic_filter {
            if !topics.contains_key(topic_name) {
                return Err(Error::UnknownTopicFilter {
                    topic_name: topic_name.clone(),
                    known: topics.keys().cloned().collect::<Vec<_>>().join(", "),
                });
            }
            let mut current = Some(topic_name.clone());
            while let Some(name) = current {
                current = topics[&name].relative_topic.clone();
                keep.insert(name);
            }
        }
        topics.retain(|topic_name, _| keep.contains(topic_name));
    }

    Ok((topics, warnings))
}

fn validate_acyclic(topics: &IndexMap<String, Topic>) -> Result<()> {
    for start in topics.keys() {
        let mut seen = vec![start.clone()];
        let mut current = topics[start].relative_topic.clone();
        while let Some(name) = current {
            if seen.contains(&name) {
                seen.push(name);
                return Err(Error::RelativeCycle {
                    cycle: seen.join(" -> "),
                });
            }
            seen.push(name.clone());
            current = topics
                .get(&name)
                .and_then(|topic| topic.relative_topic.clone());
        }
    }
    Ok(())
}

/// Stage 2: expand topics into branches in topological order. `base_tips`
/// must contain every base branch any topic declares.
pub fn expand_branches(
    topics: IndexMap<String, Topic>,
    base_tips: &IndexMap<String, BaseBranch>,
    options: &TopicGraphOptions,
) -> Result<TopicGraph> {
    // Kahn's algorithm, stable with respect to first-appearance order.
    let mut order: Vec<String> = Vec::new();
    let mut placed: IndexSet<String> = IndexSet::new();
    while placed.len() < topics.len() {
        let before = placed.len();
        for (topic_name, topic) in &topics {
            if placed.contains(topic_name) {
                continue;
            }
            let ready = match &topic.relative_topic {
                None => true,
                Some(relative) => placed.contains(relative),
            };
            if ready {
                order.push(topic_name.clone());
                placed.insert(topic_name.clone());
            }
        }
        // Unreachable given `validate_acyclic`, but avoid looping forever on
        // a bug.
        assert!(placed.len() > before, "topic graph failed to make progress");
    }

    let mut branches: Vec<TopicBranch> = Vec::new();
    let mut branch_indices: IndexMap<(String, String), usize> = IndexMap::new();
    for topic_name in order {
        let topic = &topics[&topic_name];
        let uploader = topic.uploader.as_deref().unwrap_or(&options.uploader);
        let format = topic.branch_format.unwrap_or(options.branch_format);
        for base in &topic.base_branches {
            let base_branch = base_tips.get(base).ok_or_else(|| Error::UnknownBase {
                topic_name: topic_name.clone(),
                base: base.clone(),
            })?;
            let parent = match &topic.relative_topic {
                Some(relative) => {
                    let parent_index = branch_indices[&(relative.clone(), base.clone())];
                    BranchParent::TopicBranch(parent_index)
                }
                None => BranchParent::BaseTip(base_branch.tip),
            };
            let index = branches.len();
            branches.push(TopicBranch {
                topic_name: topic_name.clone(),
                base_branch: base.clone(),
                base_tip: base_branch.tip,
                branch_name: branch_name(format, uploader, base, &topic_name),
                parent,
                relative_branch: topic.relative_branch.clone(),
            });
            branch_indices.insert((topic_name.clone(), base.clone()), index);
        }
    }

    Ok(TopicGraph { topics, branches })
}
