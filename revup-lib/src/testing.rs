//! Testing utilities.
//!
//! This is inside `src` rather than `tests` since we use this code in some
//! unit tests.

use std::collections::HashMap;
use std::ffi::OsString;
use std::ops::Deref;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use eyre::Context;
use itertools::Itertools;
use tempfile::TempDir;
use tracing::instrument;

use crate::core::config::env_vars::get_path_to_git;
use crate::core::task::WorkerPool;
use crate::git::{GitRunInfo, NonZeroOid, Repo, RepoOptions};

const DUMMY_NAME: &str = "Testy McTestface";
const DUMMY_EMAIL: &str = "test@example.com";
const DUMMY_EPOCH: i64 = 1700000000;

/// Wrapper around the Git executable, for testing.
#[derive(Clone, Debug)]
pub struct Git {
    /// The path to the repository on disk. The directory itself must exist,
    /// although it might not have a `.git` folder in it. (Use
    /// `Git::init_repo` to initialize it.)
    pub repo_path: PathBuf,

    /// The path to the Git executable on disk.
    pub path_to_git: PathBuf,
}

/// Options for `Git::run_with_options`.
#[derive(Debug, Default)]
pub struct GitRunOptions {
    /// The timestamp of the command. Mostly useful for `git commit`. This
    /// should be a number like 0, 1, 2, 3...
    pub time: isize,

    /// The exit code that `Git` should return.
    pub expected_exit_code: i32,

    /// The input to write to the child process's stdin.
    pub input: Option<String>,

    /// Additional environment variables to start the process with.
    pub env: HashMap<String, String>,
}

impl Git {
    /// Constructor.
    pub fn new(path_to_git: PathBuf, repo_path: PathBuf) -> Self {
        Git {
            repo_path,
            path_to_git,
        }
    }

    /// Get the environment variables needed to run git in the test
    /// environment. Identities and dates are pinned so that commit OIDs are
    /// deterministic.
    pub fn get_base_env(&self, time: isize) -> Vec<(OsString, OsString)> {
        let date: OsString =
            format!("{} +0000", DUMMY_EPOCH + i64::try_from(time).unwrap_or(0)).into();
        let envs = vec![
            ("GIT_CONFIG_NOSYSTEM", OsString::from("1")),
            ("HOME", self.repo_path.as_os_str().into()),
            ("GIT_AUTHOR_NAME", OsString::from(DUMMY_NAME)),
            ("GIT_AUTHOR_EMAIL", OsString::from(DUMMY_EMAIL)),
            ("GIT_AUTHOR_DATE", date.clone()),
            ("GIT_COMMITTER_NAME", OsString::from(DUMMY_NAME)),
            ("GIT_COMMITTER_EMAIL", OsString::from(DUMMY_EMAIL)),
            ("GIT_COMMITTER_DATE", date),
            (
                "PATH",
                std::env::var_os("PATH").unwrap_or_else(|| OsString::from("/usr/bin:/bin")),
            ),
        ];
        envs.into_iter()
            .map(|(key, value)| (OsString::from(key), value))
            .collect()
    }

    #[instrument]
    fn run_with_options_inner(
        &self,
        args: &[&str],
        options: &GitRunOptions,
    ) -> eyre::Result<(String, String)> {
        let GitRunOptions {
            time,
            expected_exit_code,
            input,
            env,
        } = options;

        let mut command = Command::new(&self.path_to_git);
        command
            .current_dir(&self.repo_path)
            .args(args)
            .env_clear()
            .envs(self.get_base_env(*time))
            .envs(env.iter());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().wrap_err("Spawning git subprocess")?;
        if let Some(input) = input {
            use std::io::Write;
            child
                .stdin
                .as_mut()
                .unwrap()
                .write_all(input.as_bytes())
                .wrap_err("Writing process stdin")?;
        }
        let output = child
            .wait_with_output()
            .wrap_err("Waiting for git subprocess")?;

        let exit_code = output.status.code().unwrap_or(1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code != *expected_exit_code {
            eyre::bail!(
                "git {args:?} exited with code {exit_code} (expected {expected_exit_code})\nstdout:\n{stdout}\nstderr:\n{stderr}",
            );
        }
        Ok((stdout, stderr))
    }

    /// Run a git command in the test repository, asserting on its exit code.
    pub fn run_with_options(
        &self,
        args: &[&str],
        options: &GitRunOptions,
    ) -> eyre::Result<(String, String)> {
        self.run_with_options_inner(args, options)
    }

    /// Run a git command in the test repository, asserting that it succeeds.
    pub fn run(&self, args: &[&str]) -> eyre::Result<(String, String)> {
        self.run_with_options(args, &GitRunOptions::default())
    }

    /// Initialize the repository with a `main` branch, a pinned identity,
    /// and an initial commit.
    pub fn init_repo(&self) -> eyre::Result<()> {
        self.run(&["init"])?;
        self.run(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        self.run(&["config", "user.name", DUMMY_NAME])?;
        self.run(&["config", "user.email", DUMMY_EMAIL])?;
        self.commit_file("initial", 0)?;
        Ok(())
    }

    /// Write a file and commit it with a default message.
    pub fn commit_file(&self, name: &str, time: isize) -> eyre::Result<NonZeroOid> {
        self.commit_file_with_contents_and_message(
            name,
            time,
            &format!("{name} contents\n"),
            &format!("create {name}.txt"),
        )
    }

    /// Write a file and commit it with the given contents and message.
    pub fn commit_file_with_contents_and_message(
        &self,
        name: &str,
        time: isize,
        contents: &str,
        message: &str,
    ) -> eyre::Result<NonZeroOid> {
        let path = self.repo_path.join(format!("{name}.txt"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        self.run(&["add", "."])?;
        self.run_with_options(
            &["commit", "-m", message],
            &GitRunOptions {
                time,
                ..Default::default()
            },
        )?;
        self.resolve("HEAD")
    }

    /// Create an empty commit with the given message.
    pub fn commit_empty(&self, message: &str, time: isize) -> eyre::Result<NonZeroOid> {
        self.run_with_options(
            &["commit", "--allow-empty", "-m", message],
            &GitRunOptions {
                time,
                ..Default::default()
            },
        )?;
        self.resolve("HEAD")
    }

    /// Resolve a revision to an OID.
    pub fn resolve(&self, rev: &str) -> eyre::Result<NonZeroOid> {
        let (stdout, _stderr) = self.run(&["rev-parse", rev])?;
        Ok(stdout.trim().parse()?)
    }

    /// Build a `GitRunInfo` for the adapter, pointed at this repository.
    pub fn make_git_run_info(&self) -> GitRunInfo {
        GitRunInfo {
            path_to_git: self.path_to_git.clone(),
            working_directory: self.repo_path.clone(),
            env: self.get_base_env(0).into_iter().collect(),
        }
    }

    /// Open this repository through the async adapter.
    pub async fn make_repo(&self) -> eyre::Result<Repo> {
        let repo = Repo::discover(
            self.make_git_run_info(),
            WorkerPool::for_git(),
            RepoOptions::default(),
        )
        .await?;
        Ok(repo)
    }
}

/// A [`Git`] together with the temporary directory guard keeping its
/// repository alive.
pub struct GitWrapper {
    temp_dir: TempDir,
    git: Git,
}

impl Deref for GitWrapper {
    type Target = Git;

    fn deref(&self) -> &Self::Target {
        &self.git
    }
}

impl GitWrapper {
    /// The temporary directory containing the repository.
    pub fn temp_dir(&self) -> &TempDir {
        &self.temp_dir
    }
}

/// Create a new test repository in a temporary directory. The repository is
/// not yet initialized; call `init_repo`.
pub fn make_git() -> eyre::Result<GitWrapper> {
    let temp_dir = tempfile::Builder::new().prefix("revup-test-").tempdir()?;
    let repo_path = std::fs::canonicalize(temp_dir.path())?;
    let git = Git::new(get_path_to_git(), repo_path);
    Ok(GitWrapper { temp_dir, git })
}

/// A pair of repositories where one is a "remote" for the other, connected
/// via a `file://`-style local remote.
pub struct GitWrapperWithRemoteRepo {
    /// Guard for the underlying temporary directory.
    pub temp_dir: TempDir,

    /// The repository serving as the remote.
    pub original_repo: Git,

    /// The clone with `origin` pointing at `original_repo`.
    pub cloned_repo: Git,
}

/// Create an initialized repository and a clone of it.
pub fn make_git_with_remote_repo() -> eyre::Result<GitWrapperWithRemoteRepo> {
    let temp_dir = tempfile::Builder::new().prefix("revup-test-").tempdir()?;
    let temp_path = std::fs::canonicalize(temp_dir.path())?;
    let original_repo_path = temp_path.join("original");
    std::fs::create_dir_all(&original_repo_path)?;
    let original_repo = Git::new(get_path_to_git(), original_repo_path);
    original_repo.init_repo()?;

    let cloned_repo_path = temp_path.join("cloned");
    original_repo.run(&[
        "clone",
        original_repo.repo_path.to_str().unwrap(),
        cloned_repo_path.to_str().unwrap(),
    ])?;
    let cloned_repo = Git::new(get_path_to_git(), cloned_repo_path);
    cloned_repo.run(&["config", "user.name", DUMMY_NAME])?;
    cloned_repo.run(&["config", "user.email", DUMMY_EMAIL])?;

    Ok(GitWrapperWithRemoteRepo {
        temp_dir,
        original_repo,
        cloned_repo,
    })
}

/// The summary lines of `git log` for the given revision range, for
/// assertions.
pub fn log_summaries(git: &Git, range: &str) -> eyre::Result<Vec<String>> {
    let (stdout, _stderr) = git.run(&["log", "--format=%s", range])?;
    Ok(stdout.lines().map(|line| line.to_owned()).collect_vec())
}
