//! Transient indices.
//!
//! A transient index is an index file at a path chosen by the tool, separate
//! from the repository's real index. It is the only mutable filesystem state
//! the synthesis pipeline uses: three-way merges are computed into it with
//! `read-tree`, leftover content conflicts are resolved with `merge-file` and
//! `update-index`, and the result is written back to the object database with
//! `write-tree`. The working tree and the user's staged state are never
//! involved.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bstr::ByteSlice;
use tracing::instrument;

use super::oid::{MaybeZeroOid, NonZeroOid};
use super::repo::{Error, Repo, Result};
use super::run::{GitRunOpts, RunError};

/// The possible stages for items in the index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Normal staged change.
    Stage0,

    /// For a merge conflict, the contents of the file at the common ancestor
    /// of the merged commits.
    Stage1,

    /// "Our" changes.
    Stage2,

    /// "Their" changes (from the commit being merged in).
    Stage3,
}

impl From<Stage> for i32 {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Stage0 => 0,
            Stage::Stage1 => 1,
            Stage::Stage2 => 2,
            Stage::Stage3 => 3,
        }
    }
}

/// A file mode as stored in the index (e.g. `100644`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let FileMode(mode) = self;
        write!(f, "{mode:06o}")
    }
}

impl FromStr for FileMode {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(FileMode(u32::from_str_radix(s, 8)?))
    }
}

/// An entry in the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// The blob's object ID.
    pub oid: NonZeroOid,

    /// The blob's file mode.
    pub file_mode: FileMode,
}

/// An unmerged path in the index after a three-way `read-tree`, with its
/// per-stage entries.
#[derive(Clone, Debug)]
pub struct UnmergedEntry {
    /// The conflicted path.
    pub path: PathBuf,

    /// The common-ancestor entry (stage 1), if present.
    pub base: Option<IndexEntry>,

    /// "Our" entry (stage 2), if present.
    pub ours: Option<IndexEntry>,

    /// "Their" entry (stage 3), if present.
    pub theirs: Option<IndexEntry>,
}

/// The command to update the index, as defined by `git update-index`.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub enum UpdateIndexCommand {
    Delete {
        path: PathBuf,
    },
    Update {
        path: PathBuf,
        stage: Stage,
        mode: FileMode,
        oid: NonZeroOid,
    },
}

/// The outcome of a three-way tree merge.
#[derive(Clone, Debug)]
pub enum MergedTree {
    /// The merge succeeded; the resulting tree was written to the object
    /// database.
    Clean(NonZeroOid),

    /// The merge produced conflicts which could not be resolved at the
    /// content level.
    Conflicted {
        /// The paths which conflicted, sorted.
        conflicting_paths: Vec<PathBuf>,
    },
}

/// A transient index file owned by a single synthesis task.
pub struct TransientIndex<'repo> {
    repo: &'repo Repo,
    index_path: PathBuf,
    scratch_dir: PathBuf,
}

impl std::fmt::Debug for TransientIndex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<TransientIndex path={:?}>", self.index_path)
    }
}

impl<'repo> TransientIndex<'repo> {
    pub(super) fn new(repo: &'repo Repo, index_path: PathBuf, scratch_dir: PathBuf) -> Self {
        TransientIndex {
            repo,
            index_path,
            scratch_dir,
        }
    }

    fn index_env(&self) -> Vec<(OsString, OsString)> {
        vec![(
            OsString::from("GIT_INDEX_FILE"),
            self.index_path.clone().into(),
        )]
    }

    /// Three-way merge `theirs` into `ours` against the common base `base`,
    /// entirely within this index. On success the merged tree is written to
    /// the object database.
    #[instrument]
    pub async fn merge_trees(
        &self,
        base: NonZeroOid,
        ours: NonZeroOid,
        theirs: NonZeroOid,
    ) -> Result<MergedTree> {
        self.repo
            .run(
                &[
                    "read-tree",
                    "-i",
                    "-m",
                    "--aggressive",
                    &base.to_hex(),
                    &ours.to_hex(),
                    &theirs.to_hex(),
                ],
                GitRunOpts {
                    extra_env: self.index_env(),
                    ..Default::default()
                },
            )
            .await?;

        let unmerged = self.ls_unmerged().await?;
        if unmerged.is_empty() {
            return Ok(MergedTree::Clean(self.write_tree().await?));
        }

        let mut conflicting_paths = Vec::new();
        let mut commands = Vec::new();
        for entry in unmerged {
            match self.resolve_content_conflict(&entry).await? {
                Some(resolved) => {
                    // Clear the conflict stages, then stage the merged blob.
                    commands.push(UpdateIndexCommand::Delete {
                        path: entry.path.clone(),
                    });
                    commands.push(UpdateIndexCommand::Update {
                        path: entry.path,
                        stage: Stage::Stage0,
                        mode: resolved.file_mode,
                        oid: resolved.oid,
                    });
                }
                None => conflicting_paths.push(entry.path),
            }
        }
        if !conflicting_paths.is_empty() {
            conflicting_paths.sort();
            return Ok(MergedTree::Conflicted { conflicting_paths });
        }

        self.update_index(&commands).await?;
        Ok(MergedTree::Clean(self.write_tree().await?))
    }

    /// Attempt a content-level merge of a single unmerged path. Returns the
    /// merged entry, or `None` if the path genuinely conflicts.
    async fn resolve_content_conflict(
        &self,
        entry: &UnmergedEntry,
    ) -> Result<Option<IndexEntry>> {
        let (ours, theirs) = match (&entry.ours, &entry.theirs) {
            (Some(ours), Some(theirs)) => (ours, theirs),
            // Delete/modify: no automatic resolution.
            _ => return Ok(None),
        };
        if ours.file_mode != theirs.file_mode {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.scratch_dir).map_err(|source| Error::CreateDir {
            path: self.scratch_dir.clone(),
            source,
        })?;
        let base_path = self.scratch_dir.join("base");
        let ours_path = self.scratch_dir.join("ours");
        let theirs_path = self.scratch_dir.join("theirs");
        let base_contents = match &entry.base {
            Some(base) => self.cat_blob(base.oid).await?,
            None => Vec::new(),
        };
        self.write_scratch_file(&base_path, &base_contents)?;
        self.write_scratch_file(&ours_path, &self.cat_blob(ours.oid).await?)?;
        self.write_scratch_file(&theirs_path, &self.cat_blob(theirs.oid).await?)?;

        let result = self
            .repo
            .run(
                &[
                    OsString::from("merge-file"),
                    OsString::from("-q"),
                    OsString::from("-p"),
                    ours_path.into(),
                    base_path.into(),
                    theirs_path.into(),
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

        let merged_oid = self.hash_blob(result.stdout).await?;
        Ok(Some(IndexEntry {
            oid: merged_oid,
            file_mode: ours.file_mode,
        }))
    }

    fn write_scratch_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        std::fs::write(path, contents).map_err(|source| Error::WriteFile {
            path: path.to_owned(),
            source,
        })
    }

    async fn cat_blob(&self, oid: NonZeroOid) -> Result<Vec<u8>> {
        let result = self
            .repo
            .run(&["cat-file", "blob", &oid.to_hex()], GitRunOpts::default())
            .await?;
        Ok(result.stdout)
    }

    async fn hash_blob(&self, contents: Vec<u8>) -> Result<NonZeroOid> {
        let result = self
            .repo
            .run(
                &["hash-object", "-w", "--stdin"],
                GitRunOpts {
                    stdin: Some(contents),
                    ..Default::default()
                },
            )
            .await?;
        let stdout = result.stdout_trimmed()?;
        NonZeroOid::from_str(&stdout).map_err(|source| Error::ParseOid {
            item: "hash-object output",
            source,
        })
    }

    /// List the unmerged paths in this index, grouped by path.
    pub async fn ls_unmerged(&self) -> Result<Vec<UnmergedEntry>> {
        let result = self
            .repo
            .run(
                &["ls-files", "--unmerged", "-z"],
                GitRunOpts {
                    extra_env: self.index_env(),
                    ..Default::default()
                },
            )
            .await?;

        let mut entries: Vec<UnmergedEntry> = Vec::new();
        for record in result.stdout.split_str(b"\0") {
            if record.is_empty() {
                continue;
            }
            let record = record.to_str().map_err(|_| RunError::DecodeUtf8)?;
            // Format: `<mode> <oid> <stage>\t<path>`.
            let (info, path) = match record.split_once('\t') {
                Some(parts) => parts,
                None => continue,
            };
            let mut fields = info.split_whitespace();
            let (mode, oid, stage) = match (fields.next(), fields.next(), fields.next()) {
                (Some(mode), Some(oid), Some(stage)) => (mode, oid, stage),
                _ => continue,
            };
            let index_entry = IndexEntry {
                oid: NonZeroOid::from_str(oid).map_err(|source| Error::ParseOid {
                    item: "ls-files output",
                    source,
                })?,
                file_mode: FileMode::from_str(mode).map_err(|_| RunError::DecodeUtf8)?,
            };

            let path = PathBuf::from(path);
            if entries.last().map(|entry| entry.path.as_path()) != Some(path.as_path()) {
                entries.push(UnmergedEntry {
                    path: path.clone(),
                    base: None,
                    ours: None,
                    theirs: None,
                });
            }
            let entry = entries.last_mut().expect("Just pushed an entry");
            match stage {
                "1" => entry.base = Some(index_entry),
                "2" => entry.ours = Some(index_entry),
                "3" => entry.theirs = Some(index_entry),
                _ => {}
            }
        }
        Ok(entries)
    }

    /// Update the index. This handles updates to stages other than 0.
    #[instrument]
    pub async fn update_index(&self, commands: &[UpdateIndexCommand]) -> Result<()> {
        let stdin = {
            let mut buf = String::new();
            for command in commands {
                match command {
                    UpdateIndexCommand::Delete { path } => {
                        write!(
                            &mut buf,
                            "0 {zero} 0\t{path}\0",
                            zero = MaybeZeroOid::Zero,
                            path = path.display(),
                        )
                        .expect("Formatting update-index command");
                    }
                    UpdateIndexCommand::Update {
                        path,
                        stage,
                        mode,
                        oid,
                    } => {
                        write!(
                            &mut buf,
                            "{mode} {sha1} {stage}\t{path}\0",
                            sha1 = oid,
                            stage = i32::from(*stage),
                            path = path.display(),
                        )
                        .expect("Formatting update-index command");
                    }
                }
            }
            buf.into_bytes()
        };

        self.repo
            .run(
                &["update-index", "-z", "--index-info"],
                GitRunOpts {
                    stdin: Some(stdin),
                    extra_env: self.index_env(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Write the current contents of this index as a tree object.
    #[instrument]
    pub async fn write_tree(&self) -> Result<NonZeroOid> {
        let result = self
            .repo
            .run(
                &["write-tree"],
                GitRunOpts {
                    extra_env: self.index_env(),
                    ..Default::default()
                },
            )
            .await?;
        let stdout = result.stdout_trimmed()?;
        NonZeroOid::from_str(&stdout).map_err(|source| Error::ParseOid {
            item: "write-tree output",
            source,
        })
    }
}
