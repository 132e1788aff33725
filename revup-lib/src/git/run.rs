use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Stdio;

use itertools::Itertools;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Path to the `git` executable on disk to be executed.
#[derive(Clone)]
pub struct GitRunInfo {
    /// The path to the Git executable on disk.
    pub path_to_git: PathBuf,

    /// The working directory that the Git executable should be run in.
    pub working_directory: PathBuf,

    /// The environment variables that should be passed to the Git process.
    pub env: HashMap<OsString, OsString>,
}

impl std::fmt::Debug for GitRunInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<GitRunInfo path_to_git={:?} working_directory={:?} env=not shown>",
            self.path_to_git, self.working_directory
        )
    }
}

/// Options for invoking Git.
pub struct GitRunOpts {
    /// If set, a non-zero exit code will be treated as an error.
    pub treat_git_failure_as_error: bool,

    /// A vector of bytes to write to the Git process's stdin. If `None`,
    /// nothing is written to stdin.
    pub stdin: Option<Vec<u8>>,

    /// Additional environment variables for this invocation only (e.g.
    /// `GIT_INDEX_FILE` for transient-index operations).
    pub extra_env: Vec<(OsString, OsString)>,
}

impl Default for GitRunOpts {
    fn default() -> Self {
        Self {
            treat_git_failure_as_error: true,
            stdin: None,
            extra_env: Vec::new(),
        }
    }
}

/// The result of invoking Git.
#[must_use]
pub struct GitRunResult {
    /// The exit code of the process.
    pub exit_code: i32,

    /// The stdout contents written by the invocation.
    pub stdout: Vec<u8>,

    /// The stderr contents written by the invocation.
    pub stderr: Vec<u8>,
}

impl GitRunResult {
    /// The stdout contents as a string, with the trailing newline removed.
    pub fn stdout_trimmed(&self) -> Result<String, RunError> {
        let stdout = std::str::from_utf8(&self.stdout).map_err(|_| RunError::DecodeUtf8)?;
        Ok(stdout.trim_end_matches('\n').to_owned())
    }
}

impl std::fmt::Debug for GitRunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<GitRunResult exit_code={:?} stdout={:?} stderr={:?}>",
            self.exit_code,
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr),
        )
    }
}

/// An error produced when invoking the git executable.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not spawn git subprocess for `git {command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not communicate with git subprocess for `git {command}`: {source}")]
    Communicate {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {command}` failed with exit code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("could not decode git subprocess output as UTF-8")]
    DecodeUtf8,
}

impl GitRunInfo {
    /// Run Git silently (don't display output to the user), returning its
    /// captured output. The subprocess is killed if the returned future is
    /// dropped, so callers can cancel outstanding work safely.
    pub async fn run_silent<S: AsRef<OsStr>>(
        &self,
        args: &[S],
        opts: GitRunOpts,
    ) -> Result<GitRunResult, RunError> {
        let GitRunInfo {
            path_to_git,
            working_directory,
            env,
        } = self;
        let GitRunOpts {
            treat_git_failure_as_error,
            stdin,
            extra_env,
        } = opts;

        let command_string = shell_words::join(
            args.iter()
                .map(|arg| arg.as_ref().to_string_lossy().into_owned())
                .collect_vec(),
        );
        debug!(command = %format!("git {command_string}"), "Running git command");

        let mut command = tokio::process::Command::new(path_to_git);
        command.current_dir(working_directory);
        command.args(args.iter().map(AsRef::as_ref));
        command.env_clear();
        command.envs(env.iter());
        command.envs(extra_env);
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            command: command_string.clone(),
            source,
        })?;

        if let Some(stdin) = stdin {
            let mut child_stdin = child.stdin.take().expect("Child stdin was piped");
            child_stdin
                .write_all(&stdin)
                .await
                .map_err(|source| RunError::Communicate {
                    command: command_string.clone(),
                    source,
                })?;
            drop(child_stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| RunError::Communicate {
                command: command_string.clone(),
                source,
            })?;

        // On Unix, if the child process was terminated by a signal, we need
        // to call some Unix-specific functions to access the signal that
        // terminated it. For simplicity, just return `1` in those cases.
        let result = GitRunResult {
            exit_code: output.status.code().unwrap_or(1),
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if treat_git_failure_as_error && !output.status.success() {
            return Err(RunError::Failed {
                command: command_string,
                exit_code: result.exit_code,
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::{GitRunInfo, GitRunOpts, RunError};
    use crate::core::config::env_vars::get_path_to_git;

    fn make_git_run_info() -> GitRunInfo {
        GitRunInfo {
            path_to_git: get_path_to_git(),
            working_directory: std::env::temp_dir(),
            env: std::env::vars_os().collect(),
        }
    }

    #[tokio::test]
    async fn test_run_silent_version() -> eyre::Result<()> {
        let git_run_info = make_git_run_info();
        let result = git_run_info
            .run_silent(&["version"], GitRunOpts::default())
            .await?;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout_trimmed()?.starts_with("git version"));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_silent_failures() -> eyre::Result<()> {
        let git_run_info = make_git_run_info();

        let result = git_run_info
            .run_silent(&["some-nonexistent-command"], GitRunOpts::default())
            .await;
        assert!(matches!(result, Err(RunError::Failed { .. })));

        let result = git_run_info
            .run_silent(
                &["some-nonexistent-command"],
                GitRunOpts {
                    treat_git_failure_as_error: false,
                    ..Default::default()
                },
            )
            .await?;
        assert_ne!(result.exit_code, 0);
        Ok(())
    }
}
