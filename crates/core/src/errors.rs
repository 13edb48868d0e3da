//! Error types for the autosync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`. The
//! engine-level [`SyncError`] wraps them and carries the failure taxonomy
//! reported to the caller: busy, transient, validation, apply, critical.

use thiserror::Error;

use crate::lock::OperationKind;

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from the versioned store (git2 queries and `git` CLI calls).
#[derive(Debug, Error)]
pub enum GitError {
    /// The source tree does not exist or is not a git repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// The `git` binary was not found on `$PATH`.
    #[error("git binary not found")]
    BinaryNotFound,

    /// A `git` command exited with a non-zero status.
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A rebase stopped on conflicts and was aborted.
    #[error("rebase onto {onto} hit conflicts and was aborted: {detail}")]
    RebaseAborted { onto: String, detail: String },

    /// A ref (branch, remote branch, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GitError {
    /// Whether retrying the same call could plausibly succeed.
    ///
    /// A missing ref or repository will still be missing on the next attempt;
    /// a failed network command might not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::CommandFailed { .. } | Self::IoError(_))
    }
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

/// Errors from the cooperative lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// A live process held the lock for the whole timeout.
    #[error("{kind} lock is held by live process {owner_pid} (waited {waited_secs}s)")]
    Busy {
        kind: OperationKind,
        owner_pid: u32,
        waited_secs: u64,
    },

    /// The marker file could not be read, written or removed.
    #[error("lock marker I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Backup errors
// ---------------------------------------------------------------------------

/// Errors from snapshot creation and pruning.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The tree to back up does not exist.
    #[error("backup source '{0}' does not exist")]
    SourceMissing(String),

    /// Copying or deleting failed.
    #[error("backup I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Materializer errors
// ---------------------------------------------------------------------------

/// Errors from the content materializer (verify / dry-run / apply).
#[derive(Debug, Error)]
pub enum MaterializerError {
    /// The materializer program is not installed. Callers treat this as a skip.
    #[error("materializer '{0}' is not available")]
    Unavailable(String),

    /// The materializer ran and reported failure.
    #[error("{step} failed (exit {exit_code}): {detail}")]
    Failed {
        step: String,
        exit_code: i32,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("materializer I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Identity errors
// ---------------------------------------------------------------------------

/// Errors from machine identity resolution.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No usable hostname could be found.
    #[error("could not determine a hostname for this machine")]
    HostnameUnavailable,

    /// The identity cache could not be read or written.
    #[error("identity cache error at '{path}': {source}")]
    CacheIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// A default directory could not be determined for this platform.
    #[error("no default for '{0}' on this platform; set it explicitly")]
    NoDefault(String),

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Terminal failure of a push or pull cycle.
///
/// No-op outcomes (dev mode, nothing changed, up to date) are not errors;
/// see [`crate::models::SyncOutcome`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another invocation of the same kind holds the lock.
    #[error("sync busy: {0}")]
    Busy(#[source] LockError),

    /// A network step failed on every attempt.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Transient {
        operation: String,
        attempts: u32,
        #[source]
        source: GitError,
    },

    /// Verification or dry-run apply failed; the tree was rolled back.
    #[error("validation failed: {detail}")]
    Validation { detail: String },

    /// The real apply failed and the rollback succeeded.
    #[error("apply failed (rolled back): {detail}")]
    Apply { detail: String },

    /// Rollback itself failed. The tree needs manual recovery.
    #[error("critical: {detail}")]
    Critical { detail: String },

    /// The source tree is missing or is not a repository.
    #[error("invalid source tree '{path}': {detail}")]
    InvalidSourceTree { path: String, detail: String },

    /// A termination signal arrived while the cycle was running.
    #[error("interrupted by signal")]
    Interrupted,

    /// A local git step failed (these fail fast, without retries).
    #[error("sync git error: {0}")]
    Git(#[from] GitError),

    /// The lock store failed for a reason other than contention.
    #[error("sync lock error: {0}")]
    Lock(LockError),

    /// Machine identity could not be resolved.
    #[error("sync identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Writing engine state (timestamps) failed.
    #[error("sync I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy { .. } => Self::Busy(err),
            other => Self::Lock(other),
        }
    }
}

impl SyncError {
    /// Failures that need a human: rollback failed and no further automatic
    /// action will be taken.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical { .. })
    }

    /// Process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => 130,
            _ => 1,
        }
    }
}
