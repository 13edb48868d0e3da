//! Configuration for autosync.
//!
//! Loaded once at startup from a TOML file, path defaults resolved, then
//! passed explicitly into the engine. Nothing downstream reads the process
//! environment or current directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::retry::{RetryPolicy, MAX_DELAY};

/// Placeholder replaced by the source tree path in materializer arguments.
pub const SOURCE_PLACEHOLDER: &str = "{source}";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Complete autosync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Paths, retention and lock settings.
    #[serde(default)]
    pub sync: SyncSection,

    /// Remote and branch names.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Backoff for network steps.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Content verification before commit and after pull.
    #[serde(default)]
    pub verify: VerifyConfig,

    /// The external tool that turns the source tree into live files.
    #[serde(default)]
    pub materializer: MaterializerConfig,

    /// Machine identity override.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Extra noise patterns for the change classifier.
    #[serde(default)]
    pub changes: ChangesConfig,

    /// Commit author for automatic commits.
    #[serde(default)]
    pub commit: CommitConfig,
}

// ---------------------------------------------------------------------------
// [sync]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// The version-controlled source tree.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Lock markers, machine id cache, timestamps. Platform default when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Snapshot root. Defaults to `<state_dir>/backups`.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// Snapshots kept after each successful cycle (default 10).
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,

    /// Seconds to wait for a held lock before giving up (default 30).
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Presence of this file disables push. Defaults to `<state_dir>/dev-mode`.
    #[serde(default)]
    pub dev_mode_marker: Option<PathBuf>,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            state_dir: None,
            backup_dir: None,
            backup_keep: default_backup_keep(),
            lock_timeout_secs: default_lock_timeout(),
            log_level: default_log_level(),
            dev_mode_marker: None,
        }
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("~/.local/share/chezmoi")
}

fn default_backup_keep() -> usize {
    10
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

// ---------------------------------------------------------------------------
// [remote]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote name (default `origin`).
    #[serde(default = "default_remote_name")]
    pub name: String,

    /// Shared branch every machine pulls from (default `main`).
    #[serde(default = "default_authoritative_branch")]
    pub authoritative_branch: String,

    /// Machine branches are `<prefix>/<machine id>` (default `auto-sync`).
    #[serde(default = "default_machine_branch_prefix")]
    pub machine_branch_prefix: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            name: default_remote_name(),
            authoritative_branch: default_authoritative_branch(),
            machine_branch_prefix: default_machine_branch_prefix(),
        }
    }
}

fn default_remote_name() -> String {
    "origin".into()
}

fn default_authoritative_branch() -> String {
    "main".into()
}

fn default_machine_branch_prefix() -> String {
    "auto-sync".into()
}

// ---------------------------------------------------------------------------
// [retry]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.initial_delay_secs),
            self.backoff_multiplier,
        )
    }
}

/// Largest accepted `retry.max_attempts`.
pub const MAX_RETRY_ATTEMPTS: u32 = 20;

/// Largest accepted `retry.backoff_multiplier`.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    5
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// [verify] / [materializer]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializerConfig {
    /// Program name or path (default `chezmoi`).
    #[serde(default = "default_materializer_program")]
    pub program: String,

    /// Arguments for template and schema verification.
    #[serde(default = "default_verify_args")]
    pub verify_args: Vec<String>,

    /// Arguments for an apply that touches nothing.
    #[serde(default = "default_dry_run_args")]
    pub dry_run_args: Vec<String>,

    /// Arguments for the real apply.
    #[serde(default = "default_apply_args")]
    pub apply_args: Vec<String>,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            program: default_materializer_program(),
            verify_args: default_verify_args(),
            dry_run_args: default_dry_run_args(),
            apply_args: default_apply_args(),
        }
    }
}

fn default_materializer_program() -> String {
    "chezmoi".into()
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn default_verify_args() -> Vec<String> {
    args(&["--source", SOURCE_PLACEHOLDER, "--no-pager", "diff"])
}

fn default_dry_run_args() -> Vec<String> {
    args(&["--source", SOURCE_PLACEHOLDER, "apply", "--dry-run", "--force"])
}

fn default_apply_args() -> Vec<String> {
    args(&["--source", SOURCE_PLACEHOLDER, "apply", "--force"])
}

// ---------------------------------------------------------------------------
// [identity] / [changes] / [commit]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Use this instead of the hostname-derived id.
    #[serde(default)]
    pub machine_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesConfig {
    /// Glob patterns, relative to the source tree, that never trigger a push.
    #[serde(default)]
    pub extra_trivial_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitConfig {
    #[serde(default)]
    pub author_name: Option<String>,

    #[serde(default)]
    pub author_email: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Load a [`SyncConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: SyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Expand `~` and fill in platform defaults for every path.
    pub fn resolve_paths(&mut self) -> Result<(), ConfigError> {
        let sync = &mut self.sync;
        sync.source_dir = expand_tilde(&sync.source_dir);

        let state_dir = match sync.state_dir.take() {
            Some(dir) => expand_tilde(&dir),
            None => dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .map(|d| d.join("autosync"))
                .ok_or_else(|| ConfigError::NoDefault("sync.state_dir".into()))?,
        };

        sync.backup_dir = Some(match sync.backup_dir.take() {
            Some(dir) => expand_tilde(&dir),
            None => state_dir.join("backups"),
        });
        sync.dev_mode_marker = Some(match sync.dev_mode_marker.take() {
            Some(path) => expand_tilde(&path),
            None => state_dir.join("dev-mode"),
        });
        debug!(
            source = %sync.source_dir.display(),
            state = %state_dir.display(),
            "resolved configuration paths"
        );
        sync.state_dir = Some(state_dir);
        Ok(())
    }

    /// Validate that all values are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, detail: &str) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.into(),
                detail: detail.into(),
            }
        }

        if self.sync.source_dir.as_os_str().is_empty() {
            return Err(invalid("sync.source_dir", "source directory must not be empty"));
        }
        if self.sync.backup_keep == 0 {
            return Err(invalid("sync.backup_keep", "must keep at least one backup"));
        }
        if self.sync.lock_timeout_secs == 0 {
            return Err(invalid("sync.lock_timeout_secs", "lock timeout must be > 0"));
        }
        if let Some(backups) = &self.sync.backup_dir {
            if backups.starts_with(&self.sync.source_dir) {
                return Err(invalid(
                    "sync.backup_dir",
                    "backups must live outside the source tree",
                ));
            }
        }
        if self.remote.name.trim().is_empty() {
            return Err(invalid("remote.name", "remote name must not be empty"));
        }
        if self.remote.authoritative_branch.trim().is_empty() {
            return Err(invalid(
                "remote.authoritative_branch",
                "authoritative branch must not be empty",
            ));
        }
        if self.remote.machine_branch_prefix.trim_matches('/').is_empty() {
            return Err(invalid(
                "remote.machine_branch_prefix",
                "machine branch prefix must not be empty",
            ));
        }
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.retry.max_attempts) {
            return Err(invalid(
                "retry.max_attempts",
                &format!("must be between 1 and {MAX_RETRY_ATTEMPTS}"),
            ));
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.retry.backoff_multiplier) {
            return Err(invalid(
                "retry.backoff_multiplier",
                &format!("must be between 1.0 and {MAX_BACKOFF_MULTIPLIER}"),
            ));
        }
        if self.retry.initial_delay_secs > MAX_DELAY.as_secs() {
            return Err(invalid(
                "retry.initial_delay_secs",
                &format!("must be at most {}", MAX_DELAY.as_secs()),
            ));
        }
        if self.materializer.program.trim().is_empty() {
            return Err(invalid("materializer.program", "program must not be empty"));
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_paths()?;
        config.validate()?;
        Ok(config)
    }

    /// State directory. Only meaningful after [`SyncConfig::resolve_paths`].
    pub fn state_dir(&self) -> PathBuf {
        self.sync
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".autosync"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.sync
            .backup_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("backups"))
    }

    pub fn dev_mode_marker(&self) -> PathBuf {
        self.sync
            .dev_mode_marker
            .clone()
            .unwrap_or_else(|| self.state_dir().join("dev-mode"))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn machine_id_cache(&self) -> PathBuf {
        self.state_dir().join("machine-id")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.lock_timeout_secs)
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# autosync configuration

[sync]
source_dir = "~/.local/share/chezmoi"
# state_dir = "~/.local/state/autosync"   # platform default
# backup_dir = "~/.local/state/autosync/backups"
backup_keep = 10
lock_timeout_secs = 30
log_level = "info"
# dev_mode_marker = "~/.local/state/autosync/dev-mode"

[remote]
name = "origin"
authoritative_branch = "main"
machine_branch_prefix = "auto-sync"

[retry]
max_attempts = 3
initial_delay_secs = 5
backoff_multiplier = 2.0

[verify]
enabled = true

[materializer]
program = "chezmoi"
# verify_args = ["--source", "{source}", "--no-pager", "diff"]
# dry_run_args = ["--source", "{source}", "apply", "--dry-run", "--force"]
# apply_args = ["--source", "{source}", "apply", "--force"]

[identity]
# machine_id = "work-laptop"

[changes]
# extra_trivial_patterns = ["**/node_modules/**"]

[commit]
# author_name = "autosync"
# author_email = "autosync@localhost"
"#
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
