//! Accesses revup configuration.
//!
//! Configuration is layered, lowest precedence first: built-in defaults, the
//! repo file (`<repo-root>/.revupconfig`), the user file (`$REVUP_CONFIG_PATH`
//! or `~/.revupconfig`), and finally command-line flags (applied by the
//! command itself). Files are ini-style section/key/value, with `true`/`false`
//! booleans and `_`-separated option names.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use eyre::Context;
use serde::Deserialize;
use tracing::instrument;

/// File name of the per-repository configuration file.
pub const REPO_CONFIG_FILE: &str = ".revupconfig";

/// File name of the per-user configuration file (under the home directory).
pub const USER_CONFIG_FILE: &str = ".revupconfig";

/// The `[revup]` section: identity, forge access, and branch topology.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RevupSection {
    /// OAuth token used to authenticate against the GitHub GraphQL API.
    pub github_oauth: Option<String>,

    /// GitHub login of the user, if it can't be derived from the git email.
    pub github_username: Option<String>,

    /// Name of the git remote to read remote-tracking refs from and push to.
    /// Defaults to `origin`.
    pub remote_name: Option<String>,

    /// Name of the main branch. Defaults to `main`.
    pub main_branch: Option<String>,

    /// Comma-separated globs matched against remote branch names to find
    /// release branches which can serve as bases (e.g. `rel*`).
    pub release_branch_globs: Option<String>,

    /// HTTP(S) proxy for forge requests.
    pub proxy: Option<String>,
}

/// The `[upload]` section: defaults for `revup upload` flags. Every key
/// corresponds to a flag with `-` replaced by `_`.
#[derive(Clone, Debug, Default, Deserialize)]
#[allow(missing_docs)]
pub struct UploadSection {
    pub skip_confirm: Option<bool>,
    pub dry_run: Option<bool>,
    pub rebase: Option<bool>,
    pub relative_chain: Option<bool>,
    pub auto_topic: Option<bool>,
    pub trim_tags: Option<bool>,
    pub push_only: Option<bool>,
    pub update_pr_body: Option<bool>,
    pub review_graph: Option<bool>,
    pub patchsets: Option<bool>,
    pub create_local_branches: Option<bool>,
    pub self_authored_only: Option<bool>,
    pub auto_add_users: Option<String>,
    pub branch_format: Option<String>,
    pub labels: Option<String>,
    pub user_aliases: Option<String>,
    pub uploader: Option<String>,
    pub pre_upload: Option<String>,
}

/// The fully-layered on-disk configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// The `[revup]` section.
    #[serde(default)]
    pub revup: RevupSection,

    /// The `[upload]` section.
    #[serde(default)]
    pub upload: UploadSection,
}

/// Determine the path of the per-user configuration file.
pub fn get_user_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(env_vars::REVUP_CONFIG_PATH) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(USER_CONFIG_FILE))
}

/// Load the layered configuration files. `repo_root` is the working copy
/// root, if the process is running inside a repository.
#[instrument]
pub fn load_config_file(repo_root: Option<&Path>) -> eyre::Result<ConfigFile> {
    let mut builder = Config::builder();
    if let Some(repo_root) = repo_root {
        builder = builder.add_source(
            File::from(repo_root.join(REPO_CONFIG_FILE))
                .format(FileFormat::Ini)
                .required(false),
        );
    }
    if let Some(user_config_path) = get_user_config_path() {
        builder = builder.add_source(
            File::from(user_config_path)
                .format(FileFormat::Ini)
                .required(false),
        );
    }
    let settings = builder.build().wrap_err("Reading configuration files")?;
    let config_file: ConfigFile = settings
        .try_deserialize()
        .wrap_err("Malformed configuration file")?;
    Ok(config_file)
}

impl ConfigFile {
    /// Get the GitHub OAuth token, falling back to the `GITHUB_TOKEN`
    /// environment variable. Produces a remediation hint when missing.
    pub fn github_oauth(&self) -> eyre::Result<String> {
        if let Some(token) = &self.revup.github_oauth {
            return Ok(token.clone());
        }
        if let Some(token) = std::env::var_os(env_vars::GITHUB_TOKEN) {
            if !token.is_empty() {
                return Ok(token.to_string_lossy().into_owned());
            }
        }
        Err(eyre::eyre!(
            "No GitHub OAuth token is configured.\n\
             Add it to your config file:\n\
             \n\
             [revup]\n\
             github_oauth = <token>\n\
             \n\
             or set the GITHUB_TOKEN environment variable."
        ))
    }

    /// The remote to read and push review branches on.
    pub fn remote_name(&self) -> &str {
        self.revup.remote_name.as_deref().unwrap_or("origin")
    }

    /// The configured main branch name.
    pub fn main_branch(&self) -> &str {
        self.revup.main_branch.as_deref().unwrap_or("main")
    }

    /// The configured release-branch globs.
    pub fn release_branch_globs(&self) -> Vec<String> {
        match &self.revup.release_branch_globs {
            None => Vec::new(),
            Some(globs) => globs
                .split(',')
                .map(|glob| glob.trim().to_owned())
                .filter(|glob| !glob.is_empty())
                .collect(),
        }
    }
}

/// Get the configured editor, if any: `$GIT_EDITOR`, then `$EDITOR`.
pub fn get_editor() -> Option<OsString> {
    std::env::var_os("GIT_EDITOR").or_else(|| std::env::var_os("EDITOR"))
}

/// Environment variables which affect the functioning of `revup`.
pub mod env_vars {
    use std::path::PathBuf;

    /// Overrides the location of the per-user configuration file.
    pub const REVUP_CONFIG_PATH: &str = "REVUP_CONFIG_PATH";

    /// Fallback source for the GitHub OAuth token.
    pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";

    /// Path to the Git executable to shell out to as a subprocess. This may
    /// be set during tests.
    pub const TEST_GIT: &str = "TEST_GIT";

    /// Get the path to the Git executable, preferring the test override.
    pub fn get_path_to_git() -> PathBuf {
        match std::env::var_os(TEST_GIT) {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("git"),
        }
    }
}
