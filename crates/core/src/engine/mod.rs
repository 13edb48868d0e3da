//! The synchronization engine.
//!
//! [`SyncEngine`] runs one push or pull cycle per call. Each cycle is a
//! sequential state machine guarded by a per-kind lock:
//!
//! * push: stage, validate, commit and publish local edits to this machine's
//!   branch after rebasing onto the authoritative branch.
//! * pull: fetch, integrate, validate and apply the authoritative branch,
//!   rolling back to the pre-pull commit on failure.
//!
//! No-op outcomes are successes carrying a [`SkipReason`]. Failures are
//! [`SyncError`]s; both are reported to the [`Notifier`].

mod pull;
mod push;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::backup::BackupManager;
use crate::classify::ChangeClassifier;
use crate::config::SyncConfig;
use crate::errors::{GitError, SyncError};
use crate::git::{GitStore, StashRestore, VersionedStore};
use crate::identity::{MachineId, MachineIdentity};
use crate::lock::{FileLockStore, LockGuard, LockHandle, LockStore, OperationKind};
use crate::materializer::{CommandMaterializer, Materializer};
use crate::models::{SkipReason, SyncOutcome, SyncReport};
use crate::notify::{Notification, Notifier, TracingNotifier};
use crate::retry::{RetryError, RetryPolicy};
use crate::signals::{self, ShutdownFlag};
use crate::state::SyncState;

pub use pull::PullState;
pub use push::PushState;

// ---------------------------------------------------------------------------
// Cycle bookkeeping
// ---------------------------------------------------------------------------

/// Current state and accumulated warnings of one running cycle.
struct Cycle<S> {
    kind: OperationKind,
    state: S,
    warnings: Vec<String>,
    shutdown: ShutdownFlag,
}

impl<S: Copy + fmt::Display> Cycle<S> {
    fn new(kind: OperationKind, initial: S, shutdown: ShutdownFlag) -> Self {
        Self {
            kind,
            state: initial,
            warnings: Vec::new(),
            shutdown,
        }
    }

    fn set_state(&mut self, to: S) {
        info!(operation = %self.kind, from = %self.state, to = %to, "state transition");
        self.state = to;
    }

    /// Transition at a point where the cycle may stop. Fails with
    /// [`SyncError::Interrupted`] once shutdown has been requested.
    fn advance(&mut self, to: S) -> Result<(), SyncError> {
        if self.shutdown.is_triggered() {
            warn!(operation = %self.kind, state = %self.state, next = %to, "shutdown requested, stopping cycle");
            return Err(SyncError::Interrupted);
        }
        self.set_state(to);
        Ok(())
    }

    /// Record a non-fatal problem.
    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(operation = %self.kind, state = %self.state, "{message}");
        self.warnings.push(message);
    }

    fn finish(&mut self, outcome: SyncOutcome) -> SyncReport {
        SyncReport::new(self.kind, outcome).with_warnings(std::mem::take(&mut self.warnings))
    }

    fn skip(&mut self, reason: SkipReason) -> SyncReport {
        info!(operation = %self.kind, state = %self.state, %reason, "nothing to do");
        self.finish(SyncOutcome::skipped(reason))
    }
}

/// Identity, dev mode and last-success timestamps, for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub machine_id: Option<String>,
    pub machine_branch: Option<String>,
    pub dev_mode: bool,
    pub last_push: Option<String>,
    pub last_pull: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Push/pull orchestrator for one source tree.
pub struct SyncEngine {
    config: SyncConfig,
    store: Box<dyn VersionedStore>,
    materializer: Box<dyn Materializer>,
    locks: LockGuard,
    notifier: Arc<dyn Notifier>,
    classifier: ChangeClassifier,
    backups: BackupManager,
    identity: MachineIdentity,
    state: SyncState,
    retry: RetryPolicy,
    shutdown: ShutdownFlag,
}

impl SyncEngine {
    /// Create an engine from a resolved configuration and its collaborators.
    pub fn new(
        config: SyncConfig,
        store: Box<dyn VersionedStore>,
        materializer: Box<dyn Materializer>,
        lock_store: Arc<dyn LockStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        info!(source = %config.sync.source_dir.display(), "initializing sync engine");
        Self {
            classifier: ChangeClassifier::with_extra_patterns(
                &config.changes.extra_trivial_patterns,
            ),
            backups: BackupManager::new(config.backup_dir()),
            identity: MachineIdentity::new(
                config.identity.machine_id.clone(),
                config.machine_id_cache(),
            ),
            state: SyncState::new(config.state_dir()),
            retry: config.retry.policy(),
            locks: LockGuard::new(lock_store),
            shutdown: ShutdownFlag::new(),
            store,
            materializer,
            notifier,
            config,
        }
    }

    /// Engine with the production collaborators: git, the configured
    /// materializer program, lock files in the state directory, and log
    /// notifications.
    pub fn from_config(config: SyncConfig) -> Self {
        let mut store = GitStore::new(&config.sync.source_dir);
        if let (Some(name), Some(email)) =
            (&config.commit.author_name, &config.commit.author_email)
        {
            store = store.with_author(name, email);
        }
        let materializer = CommandMaterializer::new(config.materializer.clone());
        let lock_store = Arc::new(FileLockStore::new(config.lock_dir()));
        Self::new(
            config,
            Box::new(store),
            Box::new(materializer),
            lock_store,
            Arc::new(TracingNotifier),
        )
    }

    /// Replace the lock guard, e.g. to shorten the poll interval.
    pub fn with_lock_guard(mut self, locks: LockGuard) -> Self {
        self.locks = locks;
        self
    }

    /// Stop cycles at the next safe transition once `shutdown` is set.
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Whether the development-mode marker is present.
    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode_marker().exists()
    }

    pub fn machine_id(&self) -> Result<MachineId, SyncError> {
        Ok(self.identity.resolve()?)
    }

    /// `<prefix>/<machine id>`.
    pub fn machine_branch(&self) -> Result<String, SyncError> {
        Ok(self
            .machine_id()?
            .branch_name(&self.config.remote.machine_branch_prefix))
    }

    pub fn status(&self) -> EngineStatus {
        let machine_id = self.machine_id().ok();
        EngineStatus {
            machine_branch: machine_id
                .as_ref()
                .map(|id| id.branch_name(&self.config.remote.machine_branch_prefix)),
            machine_id: machine_id.map(|id| id.to_string()),
            dev_mode: self.is_dev_mode(),
            last_push: self
                .state
                .last(OperationKind::Push)
                .map(|t| t.to_rfc3339()),
            last_pull: self
                .state
                .last(OperationKind::Pull)
                .map(|t| t.to_rfc3339()),
        }
    }

    // -----------------------------------------------------------------------
    // Shared steps
    // -----------------------------------------------------------------------

    /// Race `operation` against shutdown. Only for futures that are safe to
    /// drop at their await points (lock polling, retry backoff).
    async fn interruptible<T, F>(&self, operation: F) -> Result<T, SyncError>
    where
        F: Future<Output = T>,
    {
        signals::run_interruptible(async { Ok(operation.await) }, self.shutdown.wait()).await
    }

    async fn acquire_lock(&self, kind: OperationKind) -> Result<LockHandle, SyncError> {
        let acquired = self
            .interruptible(self.locks.acquire(kind, self.config.lock_timeout()))
            .await?;
        Ok(acquired?)
    }

    fn ensure_repository(&self) -> Result<(), SyncError> {
        let root = self.store.root();
        if !root.is_dir() {
            return Err(SyncError::InvalidSourceTree {
                path: root.display().to_string(),
                detail: "directory does not exist".into(),
            });
        }
        if !self.store.is_repository() {
            return Err(SyncError::InvalidSourceTree {
                path: root.display().to_string(),
                detail: "not a git repository".into(),
            });
        }
        Ok(())
    }

    /// Snapshot the source tree. Failure only degrades rollback, so it is a
    /// warning.
    fn backup<S: Copy + fmt::Display>(&self, cycle: &mut Cycle<S>) -> Option<std::path::PathBuf> {
        match self.backups.create_backup(self.store.root()) {
            Ok(backup) => Some(backup.path),
            Err(e) => {
                cycle.warn(format!("backup failed, continuing without one: {e}"));
                None
            }
        }
    }

    fn prune_backups<S: Copy + fmt::Display>(&self, cycle: &mut Cycle<S>) {
        if let Err(e) = self.backups.prune(self.config.sync.backup_keep) {
            cycle.warn(format!("pruning backups failed: {e}"));
        }
    }

    fn stash_local_edits<S: Copy + fmt::Display>(
        &self,
        cycle: &Cycle<S>,
    ) -> Result<bool, SyncError> {
        let message = format!(
            "autosync {} {}",
            cycle.kind,
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
        );
        Ok(self.store.stash_push(&message)?)
    }

    /// Re-apply an owed stash. Never fails the cycle.
    fn restore_stash<S: Copy + fmt::Display>(&self, cycle: &mut Cycle<S>, owed: bool) {
        if !owed {
            return;
        }
        match self.store.stash_pop() {
            Ok(StashRestore::Restored) => {}
            Ok(StashRestore::Conflicted(detail)) => cycle.warn(format!(
                "local edits conflicted when restored from stash; resolve manually: {detail}"
            )),
            Err(e) => cycle.warn(format!(
                "could not restore local edits from stash; they remain in the stash list: {e}"
            )),
        }
    }

    /// Stamp the last-success time. The cycle already succeeded, so a
    /// failed write is only a warning.
    fn record_success<S: Copy + fmt::Display>(&self, cycle: &mut Cycle<S>) {
        if let Err(e) = self.state.record(cycle.kind, Utc::now()) {
            cycle.warn(format!("could not record last {} time: {e}", cycle.kind));
        }
    }

    /// Log and notify the terminal outcome of a cycle.
    fn conclude(
        &self,
        kind: OperationKind,
        result: Result<SyncReport, SyncError>,
    ) -> Result<SyncReport, SyncError> {
        match &result {
            Ok(report) => {
                info!(operation = %kind, outcome = %report.summary(), "cycle finished");
                if !report.outcome.is_skip() || !report.warnings.is_empty() {
                    self.notifier.notify(&Notification::for_report(report));
                }
            }
            Err(e) => {
                error!(operation = %kind, critical = e.is_critical(), error = %e, "cycle failed");
                self.notifier.notify(&Notification::for_error(kind, e));
            }
        }
        result
    }
}

/// Map an exhausted or aborted retry of a network step to the engine error.
fn retry_failure(operation: &str, err: RetryError<GitError>) -> SyncError {
    if err.last_error.is_transient() {
        SyncError::Transient {
            operation: operation.to_string(),
            attempts: err.attempts,
            source: err.last_error,
        }
    } else {
        SyncError::Git(err.last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_failure_classification() {
        let err = retry_failure(
            "fetch",
            RetryError {
                attempts: 3,
                last_error: GitError::CommandFailed {
                    command: "fetch".into(),
                    exit_code: 128,
                    stderr: "timeout".into(),
                },
            },
        );
        assert!(matches!(err, SyncError::Transient { attempts: 3, .. }));

        let err = retry_failure(
            "rebase-pull",
            RetryError {
                attempts: 1,
                last_error: GitError::RebaseAborted {
                    onto: "origin/main".into(),
                    detail: "conflict".into(),
                },
            },
        );
        assert!(matches!(err, SyncError::Git(GitError::RebaseAborted { .. })));
    }
}
