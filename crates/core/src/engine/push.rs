//! Push path: publish local edits to this machine's branch.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};

use super::{retry_failure, Cycle, SyncEngine};
use crate::classify::ChangeSet;
use crate::errors::{GitError, MaterializerError, SyncError};
use crate::git::DiffScope;
use crate::identity::MachineId;
use crate::lock::OperationKind;
use crate::models::{SkipReason, SyncOutcome, SyncReport};
use crate::retry;

/// Paths listed in a commit message before the rest are summarized.
const MAX_LISTED_PATHS: usize = 20;

/// States of a push cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    DevModeChecked,
    LockAcquired,
    ChangesDetected,
    SignificanceChecked,
    RebasedOnAuthoritative,
    Validated,
    Committed,
    Pushed,
    BackupsPruned,
}

impl fmt::Display for PushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::DevModeChecked => write!(f, "dev_mode_checked"),
            Self::LockAcquired => write!(f, "lock_acquired"),
            Self::ChangesDetected => write!(f, "changes_detected"),
            Self::SignificanceChecked => write!(f, "significance_checked"),
            Self::RebasedOnAuthoritative => write!(f, "rebased_on_authoritative"),
            Self::Validated => write!(f, "validated"),
            Self::Committed => write!(f, "committed"),
            Self::Pushed => write!(f, "pushed"),
            Self::BackupsPruned => write!(f, "backups_pruned"),
        }
    }
}

impl SyncEngine {
    /// Run one push cycle.
    ///
    /// Skips without touching the lock or the repository when the
    /// development-mode marker exists.
    pub async fn push(&self) -> Result<SyncReport, SyncError> {
        let result = self.push_cycle().await;
        self.conclude(OperationKind::Push, result)
    }

    async fn push_cycle(&self) -> Result<SyncReport, SyncError> {
        let mut cycle = Cycle::new(OperationKind::Push, PushState::Idle, self.shutdown.clone());

        if self.is_dev_mode() {
            info!(marker = %self.config.dev_mode_marker().display(), "development mode marker present");
            return Ok(cycle.skip(SkipReason::DevMode));
        }
        cycle.advance(PushState::DevModeChecked)?;

        let lock = self.acquire_lock(OperationKind::Push).await?;
        cycle.advance(PushState::LockAcquired)?;

        let result = self.push_locked(&mut cycle).await;
        if let Err(e) = &result {
            warn!(state = %cycle.state, error = %e, "aborting push cycle");
        }
        drop(lock);

        let report = result?;
        cycle.set_state(PushState::Idle);
        Ok(report)
    }

    async fn push_locked(&self, cycle: &mut Cycle<PushState>) -> Result<SyncReport, SyncError> {
        self.ensure_repository()?;

        // Local differences, in both scopes.
        let unstaged = self.store.diff_names(DiffScope::Unstaged)?;
        let staged = self.store.diff_names(DiffScope::Staged)?;
        if unstaged.is_empty() && staged.is_empty() {
            return Ok(cycle.skip(SkipReason::NoChanges));
        }
        cycle.advance(PushState::ChangesDetected)?;

        let changes: ChangeSet = unstaged.union(&staged).cloned().collect();
        if !self.classifier.is_significant(&changes) {
            debug!(count = changes.len(), "all changes are trivial");
            return Ok(cycle.skip(SkipReason::TrivialChanges));
        }
        cycle.advance(PushState::SignificanceChecked)?;

        let machine_id = self.machine_id()?;
        let branch = machine_id.branch_name(&self.config.remote.machine_branch_prefix);
        info!(machine_id = %machine_id, branch = %branch, changes = changes.len(), "pushing local changes");

        self.backup(cycle);

        let stashed = if unstaged.is_empty() {
            false
        } else {
            self.stash_local_edits(cycle)?
        };

        if let Err(e) = self.rebase_onto_authoritative(cycle).await {
            self.restore_stash(cycle, stashed);
            return Err(e);
        }
        self.restore_stash(cycle, stashed);
        cycle.advance(PushState::RebasedOnAuthoritative)?;

        if self.config.verify.enabled {
            match self.materializer.verify(self.store.root()) {
                Ok(()) => {}
                Err(MaterializerError::Unavailable(program)) => {
                    cycle.warn(format!("verification skipped: '{program}' is not available"));
                }
                Err(e) => {
                    return Err(SyncError::Validation {
                        detail: e.to_string(),
                    });
                }
            }
        }
        cycle.advance(PushState::Validated)?;

        self.store.stage_all()?;
        let staged = self.store.diff_names(DiffScope::Staged)?;
        if staged.is_empty() {
            return Ok(cycle.skip(SkipReason::NothingStaged));
        }

        let message = commit_message(&machine_id, &staged);
        let commit = self.store.commit(&message)?;
        cycle.set_state(PushState::Committed);

        let remote = self.config.remote.name.as_str();
        let store = self.store.as_ref();
        let target = branch.as_str();
        let pushed = retry::run_if(
            &self.retry,
            "push",
            move || async move { store.push(remote, target) },
            GitError::is_transient,
        )
        .await;
        if let Err(e) = pushed {
            if let Err(undo) = self.store.undo_last_commit() {
                warn!(error = %undo, commit = %commit.short(), "could not undo local commit after failed push");
            }
            return Err(retry_failure("push", e));
        }
        cycle.set_state(PushState::Pushed);

        self.prune_backups(cycle);
        cycle.set_state(PushState::BackupsPruned);
        self.record_success(cycle);

        Ok(cycle.finish(SyncOutcome::Synced {
            commit: commit.to_string(),
            branch: Some(branch),
        }))
    }

    /// Rebase the current branch onto the authoritative branch. A remote
    /// without that branch yet leaves nothing to rebase onto.
    async fn rebase_onto_authoritative(
        &self,
        cycle: &mut Cycle<PushState>,
    ) -> Result<(), SyncError> {
        let remote = self.config.remote.name.as_str();
        let branch = self.config.remote.authoritative_branch.as_str();
        let store = self.store.as_ref();

        let result = self
            .interruptible(retry::run_if(
                &self.retry,
                "rebase-pull",
                move || async move { store.rebase_pull(remote, branch) },
                GitError::is_transient,
            ))
            .await?;

        match result {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.last_error, GitError::RefNotFound(_)) => {
                cycle.warn(format!(
                    "authoritative branch {remote}/{branch} does not exist; pushing without rebase"
                ));
                Ok(())
            }
            Err(e) => Err(retry_failure("rebase-pull", e)),
        }
    }
}

/// `autosync: <machine> @ <timestamp>` followed by the staged paths.
fn commit_message(machine_id: &MachineId, paths: &ChangeSet) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut message = format!("autosync: {machine_id} @ {timestamp}\n\n");
    for path in paths.iter().take(MAX_LISTED_PATHS) {
        message.push_str("- ");
        message.push_str(path);
        message.push('\n');
    }
    if paths.len() > MAX_LISTED_PATHS {
        message.push_str(&format!("... and {} more\n", paths.len() - MAX_LISTED_PATHS));
    }
    message
}
