//! Pull path: integrate and apply the authoritative branch.
//!
//! The tree is never left worse than before the cycle: validation failures
//! reset to the commit recorded at the start, and an apply failure resets and
//! re-applies that commit. Only when that recovery itself fails is the cycle
//! reported as critical.

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::{retry_failure, Cycle, SyncEngine};
use crate::errors::{GitError, MaterializerError, SyncError};
use crate::git::{CommitId, DiffScope};
use crate::lock::OperationKind;
use crate::models::{SkipReason, SyncOutcome, SyncReport};
use crate::retry;

/// States of a pull cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Idle,
    LockAcquired,
    PreValidated,
    BackedUp,
    StashedIfDirty,
    Fetched,
    Pulled,
    PostValidated,
    Applied,
    RestashPopped,
    BackupsPruned,
    RolledBack,
}

impl fmt::Display for PullState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::LockAcquired => write!(f, "lock_acquired"),
            Self::PreValidated => write!(f, "pre_validated"),
            Self::BackedUp => write!(f, "backed_up"),
            Self::StashedIfDirty => write!(f, "stashed_if_dirty"),
            Self::Fetched => write!(f, "fetched"),
            Self::Pulled => write!(f, "pulled"),
            Self::PostValidated => write!(f, "post_validated"),
            Self::Applied => write!(f, "applied"),
            Self::RestashPopped => write!(f, "restash_popped"),
            Self::BackupsPruned => write!(f, "backups_pruned"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Where the cycle started, for rollback.
struct Checkpoint {
    initial_commit: CommitId,
    backup: Option<PathBuf>,
    stash_owed: bool,
}

impl SyncEngine {
    /// Run one pull cycle.
    pub async fn pull(&self) -> Result<SyncReport, SyncError> {
        let result = self.pull_cycle().await;
        self.conclude(OperationKind::Pull, result)
    }

    async fn pull_cycle(&self) -> Result<SyncReport, SyncError> {
        let mut cycle = Cycle::new(OperationKind::Pull, PullState::Idle, self.shutdown.clone());

        let lock = self.acquire_lock(OperationKind::Pull).await?;
        cycle.advance(PullState::LockAcquired)?;

        let result = self.pull_locked(&mut cycle).await;
        if let Err(e) = &result {
            warn!(state = %cycle.state, error = %e, "aborting pull cycle");
        }
        drop(lock);

        let report = result?;
        cycle.set_state(PullState::Idle);
        Ok(report)
    }

    async fn pull_locked(&self, cycle: &mut Cycle<PullState>) -> Result<SyncReport, SyncError> {
        let remote = self.config.remote.name.as_str();
        let branch = self.config.remote.authoritative_branch.as_str();

        self.ensure_repository()?;
        if !self.materializer.is_available() {
            cycle.warn("content materializer is not available; verify and apply will be skipped");
        }
        if !self.store.has_remote(remote)? {
            return Ok(cycle.skip(SkipReason::NoTrackingBranch));
        }
        cycle.advance(PullState::PreValidated)?;

        let backup = self.backup(cycle);
        let initial_commit = self.store.current_commit()?;
        debug!(initial = %initial_commit.short(), "recorded pre-pull commit");
        cycle.advance(PullState::BackedUp)?;

        let dirty = !self.store.diff_names(DiffScope::Unstaged)?.is_empty()
            || !self.store.diff_names(DiffScope::Staged)?.is_empty();
        let stash_owed = dirty && self.stash_local_edits(cycle)?;
        let checkpoint = Checkpoint {
            initial_commit,
            backup,
            stash_owed,
        };
        if let Err(e) = cycle.advance(PullState::StashedIfDirty) {
            self.restore_stash(cycle, checkpoint.stash_owed);
            return Err(e);
        }

        let store = self.store.as_ref();
        let fetched = self
            .interruptible(retry::run_if(
                &self.retry,
                "fetch",
                move || async move { store.fetch(remote, branch) },
                GitError::is_transient,
            ))
            .await;
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                self.restore_stash(cycle, checkpoint.stash_owed);
                return Err(e);
            }
        };
        let remote_commit = match fetched {
            Ok(commit) => commit,
            Err(e) if matches!(e.last_error, GitError::RefNotFound(_)) => {
                self.restore_stash(cycle, checkpoint.stash_owed);
                return Ok(cycle.skip(SkipReason::NoTrackingBranch));
            }
            Err(e) => {
                self.restore_stash(cycle, checkpoint.stash_owed);
                return Err(retry_failure("fetch", e));
            }
        };
        if let Err(e) = cycle.advance(PullState::Fetched) {
            self.restore_stash(cycle, checkpoint.stash_owed);
            return Err(e);
        }

        let (ahead, behind) = self
            .store
            .ahead_behind(&checkpoint.initial_commit, &remote_commit)?;
        if behind == 0 {
            debug!(ahead, "local branch contains the remote tip");
            self.restore_stash(cycle, checkpoint.stash_owed);
            return Ok(cycle.skip(SkipReason::UpToDate));
        }
        info!(ahead, behind, remote = %remote_commit.short(), "remote has new commits");

        self.preview_conflicts(&checkpoint.initial_commit, &remote_commit);

        let pulled = self
            .interruptible(retry::run_if(
                &self.retry,
                "rebase-pull",
                move || async move { store.rebase_pull(remote, branch) },
                GitError::is_transient,
            ))
            .await;
        match pulled {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.restore_stash(cycle, checkpoint.stash_owed);
                return Err(retry_failure("rebase-pull", e));
            }
            Err(e) => {
                // Dropped during backoff: the last attempt failed and was aborted.
                self.restore_stash(cycle, checkpoint.stash_owed);
                return Err(e);
            }
        }
        if let Err(e) = cycle.advance(PullState::Pulled) {
            self.rollback_validation(cycle, &checkpoint)?;
            return Err(e);
        }

        if let Err(detail) = self.post_validate(cycle) {
            self.rollback_validation(cycle, &checkpoint)?;
            return Err(SyncError::Validation { detail });
        }
        if let Err(e) = cycle.advance(PullState::PostValidated) {
            self.rollback_validation(cycle, &checkpoint)?;
            return Err(e);
        }

        let backup_commit = self.store.current_commit()?;
        match self.materializer.apply(self.store.root()) {
            Ok(()) => {}
            Err(MaterializerError::Unavailable(program)) => {
                cycle.warn(format!("apply skipped: '{program}' is not available"));
            }
            Err(e) => return Err(self.rollback_apply(cycle, &checkpoint, &backup_commit, e)),
        }
        cycle.set_state(PullState::Applied);

        self.restore_stash(cycle, checkpoint.stash_owed);
        cycle.set_state(PullState::RestashPopped);

        self.prune_backups(cycle);
        cycle.set_state(PullState::BackupsPruned);
        self.record_success(cycle);

        Ok(cycle.finish(SyncOutcome::Synced {
            commit: backup_commit.to_string(),
            branch: None,
        }))
    }

    /// Log paths changed on both sides since the merge base. Advisory only.
    fn preview_conflicts(&self, local: &CommitId, remote: &CommitId) {
        let shared_paths = || -> Result<Vec<String>, GitError> {
            let Some(base) = self.store.merge_base(local, remote)? else {
                return Ok(Vec::new());
            };
            let ours = self.store.diff_between(&base, local)?;
            let theirs = self.store.diff_between(&base, remote)?;
            Ok(ours.intersection(&theirs).cloned().collect())
        };

        match shared_paths() {
            Ok(overlap) if overlap.is_empty() => debug!("no overlapping changes"),
            Ok(overlap) => warn!(paths = ?overlap, "local and remote both changed these paths"),
            Err(e) => debug!(error = %e, "conflict preview failed"),
        }
    }

    /// Verify and dry-run the pulled content. `Err` carries the reason.
    fn post_validate(&self, cycle: &mut Cycle<PullState>) -> Result<(), String> {
        if !self.config.verify.enabled {
            return Ok(());
        }
        let root = self.store.root();
        let checks = self
            .materializer
            .verify(root)
            .and_then(|()| self.materializer.apply_dry_run(root));
        match checks {
            Ok(()) => Ok(()),
            Err(MaterializerError::Unavailable(program)) => {
                cycle.warn(format!("verification skipped: '{program}' is not available"));
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Return to the pre-pull commit after a failed verification.
    fn rollback_validation(
        &self,
        cycle: &mut Cycle<PullState>,
        checkpoint: &Checkpoint,
    ) -> Result<(), SyncError> {
        if let Err(e) = self.store.reset_hard(&checkpoint.initial_commit) {
            return Err(SyncError::Critical {
                detail: format!(
                    "validation failed and reset to {} also failed: {e}{}",
                    checkpoint.initial_commit,
                    backup_hint(checkpoint)
                ),
            });
        }
        cycle.set_state(PullState::RolledBack);
        self.restore_stash(cycle, checkpoint.stash_owed);
        Ok(())
    }

    /// Recover from a failed real apply by resetting to the pre-pull commit
    /// and applying it again. Returns the error that ends the cycle.
    fn rollback_apply(
        &self,
        cycle: &mut Cycle<PullState>,
        checkpoint: &Checkpoint,
        backup_commit: &CommitId,
        cause: MaterializerError,
    ) -> SyncError {
        warn!(error = %cause, "apply failed, rolling back");
        let recovered = self
            .store
            .reset_hard(&checkpoint.initial_commit)
            .map_err(|e| e.to_string())
            .and_then(|()| {
                self.materializer
                    .apply(self.store.root())
                    .map_err(|e| e.to_string())
            });

        match recovered {
            Ok(()) => {
                cycle.set_state(PullState::RolledBack);
                self.restore_stash(cycle, checkpoint.stash_owed);
                SyncError::Apply {
                    detail: format!(
                        "{cause}; restored {}",
                        checkpoint.initial_commit.short()
                    ),
                }
            }
            Err(rollback_err) => SyncError::Critical {
                detail: format!(
                    "apply of {backup_commit} failed ({cause}) and rollback to {} failed ({rollback_err}); \
                     manual intervention required{}{}",
                    checkpoint.initial_commit,
                    backup_hint(checkpoint),
                    if checkpoint.stash_owed {
                        "; local edits remain in the stash list"
                    } else {
                        ""
                    }
                ),
            },
        }
    }
}

fn backup_hint(checkpoint: &Checkpoint) -> String {
    match &checkpoint.backup {
        Some(path) => format!("; backup at {}", path.display()),
        None => "; no backup was taken".to_string(),
    }
}
