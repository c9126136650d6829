//! Process-wide kernel configuration
//!
//! Parsed from `tgp.config.json`. Immutable after boot; the kernel reads no
//! environment variables itself - token injection is the config loader's
//! concern.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{KernelError, Result};

/// Default memory cap for a single guest execution (128 MiB).
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 128 * 1024 * 1024;
/// Default wall-clock cap for a single guest execution.
pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 5_000;
/// Default per-call deadline for git network operations.
pub const DEFAULT_GIT_OP_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Virtual root; every VFS path resolves inside this directory.
    pub root_dir: PathBuf,
    pub git: GitConfig,
    #[serde(default)]
    pub fs: FsConfig,
    /// Bare module specifiers tools may import. Relative imports are always
    /// allowed (they resolve through the module resolver).
    #[serde(default)]
    pub allowed_imports: Vec<String>,
    /// HTTPS URL prefixes the bridge `fetch` may reach. Empty denies all
    /// network access.
    #[serde(default)]
    pub allowed_fetch_urls: Vec<String>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Optional host database hint, surfaced to embedder-injected bridge
    /// capabilities. The kernel attaches no semantics to it.
    #[serde(default)]
    pub db: Option<DbConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    /// Hosting provider; selects the HTTPS host for `owner/name` repos.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// `owner/name`, or a full `https://` clone URL.
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub auth: AuthConfig,
    #[serde(default)]
    pub write_strategy: WriteStrategy,
    /// Per-call deadline for clone/fetch/push.
    #[serde(default = "default_git_op_timeout")]
    pub op_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Personal access token, sent as the HTTPS username.
    pub token: String,
    #[serde(default = "default_author_name")]
    pub user: String,
    #[serde(default = "default_author_email")]
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    /// Commit to the configured branch and push, rebasing on rejection.
    #[default]
    Direct,
    /// Commit to a `tgp/<epoch-ms>-<shortsha>` branch and report that a PR
    /// is wanted; opening it is the embedder's job.
    Pr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsConfig {
    /// Directories (relative to the root) the guest bridge may write into.
    /// Stricter than the jail: reads anywhere inside the root remain legal.
    #[serde(default = "default_allowed_dirs")]
    pub allowed_dirs: Vec<String>,
    /// Reject any path containing `..` components outright.
    #[serde(default = "default_true")]
    pub block_upward_traversal: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            allowed_dirs: default_allowed_dirs(),
            block_upward_traversal: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,
    #[serde(default = "default_exec_timeout")]
    pub timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: default_memory_limit(),
            timeout_ms: default_exec_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbConfig {
    pub dialect: String,
}

fn default_provider() -> String {
    "github".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_author_name() -> String {
    "tgp-agent".to_string()
}

fn default_author_email() -> String {
    "agent@tgp.local".to_string()
}

fn default_allowed_dirs() -> Vec<String> {
    vec!["tools".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_memory_limit() -> usize {
    DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_exec_timeout() -> u64 {
    DEFAULT_EXEC_TIMEOUT_MS
}

fn default_git_op_timeout() -> u64 {
    DEFAULT_GIT_OP_TIMEOUT_MS
}

impl Config {
    /// Parse and validate a JSON config document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| KernelError::ConfigInvalid(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that would fail later in confusing ways.
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(KernelError::ConfigInvalid("rootDir must not be empty".into()));
        }
        if self.git.repo.trim().is_empty() {
            return Err(KernelError::ConfigInvalid("git.repo must not be empty".into()));
        }
        if self.git.branch.trim().is_empty() {
            return Err(KernelError::ConfigInvalid(
                "git.branch must not be empty".into(),
            ));
        }
        if self.git.repo.contains("://") && !self.git.repo.starts_with("https://") {
            return Err(KernelError::ConfigInvalid(format!(
                "git.repo must use https, got '{}'",
                self.git.repo
            )));
        }
        if self.sandbox.memory_limit_bytes == 0 {
            return Err(KernelError::ConfigInvalid(
                "sandbox.memoryLimitBytes must be positive".into(),
            ));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(KernelError::ConfigInvalid(
                "sandbox.timeoutMs must be positive".into(),
            ));
        }
        for url in &self.allowed_fetch_urls {
            if !url.starts_with("https://") {
                return Err(KernelError::ConfigInvalid(format!(
                    "allowedFetchUrls entries must be https prefixes, got '{}'",
                    url
                )));
            }
        }
        Ok(())
    }

    /// Clone URL for the configured repository. `owner/name` maps onto the
    /// provider host over HTTPS; full `https://` URLs and absolute local
    /// paths (air-gapped and test remotes) pass through untouched.
    pub fn remote_url(&self) -> String {
        if self.git.repo.starts_with("https://") || self.git.repo.starts_with('/') {
            return self.git.repo.clone();
        }
        let host = match self.git.provider.as_str() {
            "gitlab" => "gitlab.com",
            "bitbucket" => "bitbucket.org",
            _ => "github.com",
        };
        format!("https://{}/{}.git", host, self.git.repo)
    }
}
