//! Async adapter over the git executable.
//!
//! Every operation shells out to git plumbing and parses the result. Object
//! creation goes through `hash-object`/`write-tree`/`commit-tree`; ref
//! updates go through `update-ref` with explicit old-value preconditions;
//! pushes use `--force-with-lease`. The user's working tree, real index, and
//! `HEAD` are never modified.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::core::task::WorkerPool;

use super::index::TransientIndex;
use super::object::{self, Commit, Signature};
use super::oid::{MaybeZeroOid, NonZeroOid, ParseOidError};
use super::reference::ReferenceName;
use super::run::{GitRunInfo, GitRunOpts, GitRunResult, RunError};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Object(#[from] object::Error),

    #[error("could not parse OID from {item}: {source}")]
    ParseOid {
        item: &'static str,
        #[source]
        source: ParseOidError,
    },

    #[error("not inside a git repository: {0}")]
    NotARepository(#[source] RunError),

    #[error(
        "git identity is not configured; run:\n\
         git config user.name <name>\n\
         git config user.email <email>"
    )]
    MissingIdentity,

    #[error("could not create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not create transient index directory: {0}")]
    CreateTempDir(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The hash of a patch, as computed by `git patch-id --stable`. Identifies
/// the content of a change independently of the commit metadata and of the
/// tree it was applied to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PatchId(pub String);

/// A ref update to push to a remote.
#[derive(Clone, Debug)]
pub struct PushSpec {
    /// The local object to push.
    pub oid: NonZeroOid,

    /// The branch name on the remote (unqualified, e.g.
    /// `revup/alice/main/foo`).
    pub remote_branch_name: String,

    /// The lease: the value the remote ref is expected to currently have.
    /// `MaybeZeroOid::Zero` means the ref must not exist yet.
    pub expected: MaybeZeroOid,
}

/// Options for opening a repository.
#[derive(Clone, Debug, Default)]
pub struct RepoOptions {
    /// Keep transient index files under `<repo-root>/.revup/` for debugging
    /// instead of a temporary directory.
    pub keep_temp: bool,
}

#[derive(Debug)]
enum TransientDir {
    Temp(tempfile::TempDir),
    Kept(PathBuf),
}

impl TransientDir {
    fn path(&self) -> &Path {
        match self {
            TransientDir::Temp(temp_dir) => temp_dir.path(),
            TransientDir::Kept(path) => path,
        }
    }
}

/// Wrapper around the git repository, exposing async plumbing operations.
pub struct Repo {
    git_run_info: GitRunInfo,
    pool: WorkerPool,
    working_copy_path: PathBuf,
    git_dir: PathBuf,
    transient_dir: TransientDir,
    empty_tree_oid: OnceCell<NonZeroOid>,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Repo path={:?}>", self.working_copy_path)
    }
}

impl Repo {
    /// Open the repository containing the run info's working directory.
    #[instrument]
    pub async fn discover(
        git_run_info: GitRunInfo,
        pool: WorkerPool,
        options: RepoOptions,
    ) -> Result<Self> {
        let result = git_run_info
            .run_silent(
                &["rev-parse", "--show-toplevel", "--absolute-git-dir"],
                GitRunOpts::default(),
            )
            .await
            .map_err(Error::NotARepository)?;
        let stdout = result.stdout_trimmed()?;
        let mut lines = stdout.lines();
        let working_copy_path = PathBuf::from(lines.next().unwrap_or_default());
        let git_dir = PathBuf::from(lines.next().unwrap_or_default());

        let transient_dir = if options.keep_temp {
            let path = working_copy_path.join(".revup");
            std::fs::create_dir_all(&path).map_err(|source| Error::CreateDir {
                path: path.clone(),
                source,
            })?;
            TransientDir::Kept(path)
        } else {
            TransientDir::Temp(
                tempfile::Builder::new()
                    .prefix("revup-index-")
                    .tempdir()
                    .map_err(Error::CreateTempDir)?,
            )
        };

        Ok(Repo {
            git_run_info,
            pool,
            working_copy_path,
            git_dir,
            transient_dir,
            empty_tree_oid: OnceCell::new(),
        })
    }

    /// The root of the working copy.
    pub fn get_working_copy_path(&self) -> &Path {
        &self.working_copy_path
    }

    /// The `.git` directory.
    pub fn get_git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// The run info used for subprocess invocations.
    pub fn get_git_run_info(&self) -> &GitRunInfo {
        &self.git_run_info
    }

    /// Run a git plumbing command through the subprocess pool.
    pub(super) async fn run<S: AsRef<OsStr>>(
        &self,
        args: &[S],
        opts: GitRunOpts,
    ) -> Result<GitRunResult> {
        let _permit = self.pool.acquire().await;
        Ok(self.git_run_info.run_silent(args, opts).await?)
    }

    /// Resolve a ref or revision expression to a commit OID. Returns `None`
    /// if the ref does not exist.
    #[instrument]
    pub async fn resolve_reference(&self, refname: &str) -> Result<Option<NonZeroOid>> {
        let result = self
            .run(
                &[
                    "rev-parse",
                    "--verify",
                    "--quiet",
                    &format!("{refname}^{{commit}}"),
                ],
                GitRunOpts {
                    treat_git_failure_as_error: false,
                    ..Default::default()
                },
            )
            .await?;
        if result.exit_code != 0 {
            return Ok(None);
        }
        let stdout = result.stdout_trimmed()?;
        let oid = NonZeroOid::from_str(&stdout).map_err(|source| Error::ParseOid {
            item: "rev-parse output",
            source,
        })?;
        Ok(Some(oid))
    }

    /// Resolve the tree OID for a commit.
    #[instrument]
    pub async fn get_tree_oid(&self, commit_oid: NonZeroOid) -> Result<NonZeroOid> {
        let result = self
            .run(
                &["rev-parse", &format!("{commit_oid}^{{tree}}")],
                GitRunOpts::default(),
            )
            .await?;
        let stdout = result.stdout_trimmed()?;
        NonZeroOid::from_str(&stdout).map_err(|source| Error::ParseOid {
            item: "rev-parse tree output",
            source,
        })
    }

    /// The OID of the empty tree object, writing it to the object database
    /// if necessary.
    pub async fn get_empty_tree_oid(&self) -> Result<NonZeroOid> {
        self.empty_tree_oid
            .get_or_try_init(|| async {
                let result = self
                    .run(
                        &["hash-object", "-t", "tree", "-w", "--stdin"],
                        GitRunOpts {
                            stdin: Some(Vec::new()),
                            ..Default::default()
                        },
                    )
                    .await?;
                let stdout = result.stdout_trimmed()?;
                NonZeroOid::from_str(&stdout).map_err(|source| Error::ParseOid {
                    item: "hash-object output",
                    source,
                })
            })
            .await
            .copied()
    }

    /// Enumerate refs matching the provided glob patterns, with the OIDs
    /// they point to.
    #[instrument]
    pub async fn for_each_ref(
        &self,
        patterns: &[String],
    ) -> Result<Vec<(ReferenceName, NonZeroOid)>> {
        let mut args = vec![
            "for-each-ref".to_owned(),
            "--format=%(refname) %(objectname)".to_owned(),
        ];
        args.extend(patterns.iter().cloned());
        let result = self.run(&args, GitRunOpts::default()).await?;
        let stdout = result.stdout_trimmed()?;
        let mut refs = Vec::new();
        for line in stdout.lines() {
            let (refname, oid) = match line.rsplit_once(' ') {
                Some(parts) => parts,
                None => continue,
            };
            let oid = NonZeroOid::from_str(oid).map_err(|source| Error::ParseOid {
                item: "for-each-ref output",
                source,
            })?;
            refs.push((ReferenceName::new(refname), oid));
        }
        Ok(refs)
    }

    /// List the commits reachable from `head` but not from any of `exclude`,
    /// in parent-before-child order.
    #[instrument]
    pub async fn rev_list(
        &self,
        head: NonZeroOid,
        exclude: &[NonZeroOid],
    ) -> Result<Vec<NonZeroOid>> {
        let mut args = vec![
            "rev-list".to_owned(),
            "--reverse".to_owned(),
            "--topo-order".to_owned(),
            head.to_hex(),
        ];
        args.extend(exclude.iter().map(|oid| format!("^{oid}")));
        let result = self.run(&args, GitRunOpts::default()).await?;
        let stdout = result.stdout_trimmed()?;
        stdout
            .lines()
            .map(|line| {
                NonZeroOid::from_str(line).map_err(|source| Error::ParseOid {
                    item: "rev-list output",
                    source,
                })
            })
            .collect()
    }

    /// Count the commits in `from..to`.
    #[instrument]
    pub async fn rev_list_count(&self, from: NonZeroOid, to: NonZeroOid) -> Result<usize> {
        let result = self
            .run(
                &["rev-list", "--count", &format!("{from}..{to}")],
                GitRunOpts::default(),
            )
            .await?;
        let stdout = result.stdout_trimmed()?;
        stdout.parse().map_err(|_| {
            Error::Run(RunError::Failed {
                command: "rev-list --count".to_owned(),
                exit_code: 0,
                stderr: format!("unexpected output: {stdout:?}"),
            })
        })
    }

    /// Find the merge base of two commits, if one exists.
    #[instrument]
    pub async fn merge_base(
        &self,
        lhs: NonZeroOid,
        rhs: NonZeroOid,
    ) -> Result<Option<NonZeroOid>> {
        let result = self
            .run(
                &["merge-base", &lhs.to_hex(), &rhs.to_hex()],
                GitRunOpts {
                    treat_git_failure_as_error: false,
                    ..Default::default()
                },
            )
            .await?;
        if result.exit_code != 0 {
            return Ok(None);
        }
        let stdout = result.stdout_trimmed()?;
        let oid = NonZeroOid::from_str(&stdout).map_err(|source| Error::ParseOid {
            item: "merge-base output",
            source,
        })?;
        Ok(Some(oid))
    }

    /// Whether `ancestor` is an ancestor of (or equal to) `descendant`.
    #[instrument]
    pub async fn is_ancestor(
        &self,
        ancestor: NonZeroOid,
        descendant: NonZeroOid,
    ) -> Result<bool> {
        let result = self
            .run(
                &[
                    "merge-base",
                    "--is-ancestor",
                    &ancestor.to_hex(),
                    &descendant.to_hex(),
                ],
                GitRunOpts {
                    treat_git_failure_as_error: false,
                    ..Default::default()
                },
            )
            .await?;
        match result.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(Error::Run(RunError::Failed {
                command: "merge-base --is-ancestor".to_owned(),
                exit_code: result.exit_code,
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            })),
        }
    }

    /// Read and parse a commit object.
    #[instrument]
    pub async fn find_commit(&self, oid: NonZeroOid) -> Result<Commit> {
        let result = self
            .run(&["cat-file", "commit", &oid.to_hex()], GitRunOpts::default())
            .await?;
        Ok(Commit::parse(oid, &result.stdout)?)
    }

    /// Read and parse multiple commit objects, preserving order.
    pub async fn find_commits(&self, oids: &[NonZeroOid]) -> Result<Vec<Commit>> {
        let commits = futures::future::try_join_all(oids.iter().map(|oid| self.find_commit(*oid)))
            .await?;
        Ok(commits)
    }

    /// Read a single config value. Returns `None` when unset.
    #[instrument]
    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .run(
                &["config", "--get", key],
                GitRunOpts {
                    treat_git_failure_as_error: false,
                    ..Default::default()
                },
            )
            .await?;
        if result.exit_code != 0 {
            return Ok(None);
        }
        Ok(Some(result.stdout_trimmed()?))
    }

    /// The configured `user.name`/`user.email` pair, with a remediation hint
    /// when missing.
    pub async fn get_user_identity(&self) -> Result<(String, String)> {
        let name = self.get_config("user.name").await?;
        let email = self.get_config("user.email").await?;
        match (name, email) {
            (Some(name), Some(email)) => Ok((name, email)),
            _ => Err(Error::MissingIdentity),
        }
    }

    /// Create a commit object with the given tree, parents, identities, and
    /// message. The commit is written to the object database only; no ref is
    /// updated.
    #[instrument(skip(message))]
    pub async fn commit_tree(
        &self,
        tree_oid: NonZeroOid,
        parent_oids: &[NonZeroOid],
        author: &Signature,
        committer: &Signature,
        message: &str,
    ) -> Result<NonZeroOid> {
        let mut args = vec!["commit-tree".to_owned(), tree_oid.to_hex()];
        for parent_oid in parent_oids {
            args.push("-p".to_owned());
            args.push(parent_oid.to_hex());
        }
        let extra_env: Vec<(OsString, OsString)> = vec![
            ("GIT_AUTHOR_NAME".into(), author.name.clone().into()),
            ("GIT_AUTHOR_EMAIL".into(), author.email.clone().into()),
            ("GIT_AUTHOR_DATE".into(), author.time.to_git_format().into()),
            ("GIT_COMMITTER_NAME".into(), committer.name.clone().into()),
            ("GIT_COMMITTER_EMAIL".into(), committer.email.clone().into()),
            (
                "GIT_COMMITTER_DATE".into(),
                committer.time.to_git_format().into(),
            ),
        ];
        let result = self
            .run(
                &args,
                GitRunOpts {
                    stdin: Some(message.as_bytes().to_vec()),
                    extra_env,
                    ..Default::default()
                },
            )
            .await?;
        let stdout = result.stdout_trimmed()?;
        NonZeroOid::from_str(&stdout).map_err(|source| Error::ParseOid {
            item: "commit-tree output",
            source,
        })
    }

    /// Update a ref to a new value, with an explicit precondition on its old
    /// value (`MaybeZeroOid::Zero` means "must not exist").
    #[instrument]
    pub async fn update_ref(
        &self,
        refname: &ReferenceName,
        new_oid: NonZeroOid,
        expected_old_oid: MaybeZeroOid,
    ) -> Result<()> {
        self.run(
            &[
                "update-ref",
                refname.as_str(),
                &new_oid.to_hex(),
                &expected_old_oid.to_string(),
            ],
            GitRunOpts::default(),
        )
        .await?;
        Ok(())
    }

    /// Push a batch of refs to the remote in a single invocation, using
    /// `--force-with-lease` with each spec's expected old value.
    #[instrument]
    pub async fn push_refs(&self, remote_name: &str, specs: &[PushSpec]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        let mut args = vec!["push".to_owned()];
        for spec in specs {
            let expected = match spec.expected {
                // An empty expectation means the remote ref must not exist.
                MaybeZeroOid::Zero => String::new(),
                MaybeZeroOid::NonZero(oid) => oid.to_hex(),
            };
            args.push(format!(
                "--force-with-lease=refs/heads/{}:{}",
                spec.remote_branch_name, expected
            ));
        }
        args.push(remote_name.to_owned());
        for spec in specs {
            args.push(format!(
                "{}:refs/heads/{}",
                spec.oid, spec.remote_branch_name
            ));
        }
        self.run(&args, GitRunOpts::default()).await?;
        Ok(())
    }

    /// Compute the canonical patch hash for the change from `parent` to
    /// `commit`. Returns `None` when the two trees are identical (an empty
    /// patch has no ID).
    #[instrument]
    pub async fn get_patch_id(
        &self,
        parent_oid: NonZeroOid,
        commit_oid: NonZeroOid,
    ) -> Result<Option<PatchId>> {
        let diff = self
            .run(
                &[
                    "diff-tree",
                    "-p",
                    "--full-index",
                    &parent_oid.to_hex(),
                    &commit_oid.to_hex(),
                ],
                GitRunOpts::default(),
            )
            .await?;
        if diff.stdout.is_empty() {
            return Ok(None);
        }
        let result = self
            .run(
                &["patch-id", "--stable"],
                GitRunOpts {
                    stdin: Some(diff.stdout),
                    ..Default::default()
                },
            )
            .await?;
        let stdout = result.stdout_trimmed()?;
        match stdout.split_whitespace().next() {
            None | Some("") => Ok(None),
            Some(patch_id) => Ok(Some(PatchId(patch_id.to_owned()))),
        }
    }

    /// Create a transient index with the given unique name. The index file
    /// lives outside the repository's real index; operations on it never
    /// affect the user's staged state.
    pub fn transient_index(&self, name: &str) -> TransientIndex<'_> {
        let index_path = self.transient_dir.path().join(format!("index-{name}"));
        let scratch_dir = self.transient_dir.path().join(format!("scratch-{name}"));
        TransientIndex::new(self, index_path, scratch_dir)
    }
}
