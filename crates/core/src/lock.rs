//! Cooperative per-operation locking.
//!
//! Each operation kind (push, pull) owns one marker file holding the PID of
//! the process running it. Acquisition polls once per interval until the
//! marker can be created, reclaiming markers whose owner is no longer alive.
//! The returned [`LockHandle`] removes the marker on drop, so every exit path
//! of the guarded operation releases it, including a future dropped because a
//! shutdown signal won the race.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::LockError;

/// Default acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Operation kind
// ---------------------------------------------------------------------------

/// The operation a lock protects. Push and pull exclude themselves, not each
/// other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Push,
    Pull,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Pull => write!(f, "pull"),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock store
// ---------------------------------------------------------------------------

/// Storage for lock markers.
///
/// The filesystem implementation is [`FileLockStore`]; tests substitute an
/// in-memory store to exercise contention without real processes.
pub trait LockStore: Send + Sync {
    /// Atomically create the marker for `kind` owned by `pid`.
    ///
    /// Returns `Ok(false)` if a marker already exists.
    fn try_create(&self, kind: OperationKind, pid: u32) -> Result<bool, LockError>;

    /// PID recorded in the marker, if one exists. A marker whose contents
    /// cannot be parsed is reported as owned by PID 0, which is never live.
    fn owner(&self, kind: OperationKind) -> Result<Option<u32>, LockError>;

    /// Remove the marker only if it is still owned by `pid`.
    ///
    /// Returns `Ok(true)` if the marker was removed, `Ok(false)` if it was
    /// missing or belongs to someone else. Must be atomic with respect to a
    /// concurrent [`LockStore::try_create`]: a marker created by another
    /// process after `pid`'s marker went away is never deleted.
    fn remove_if_owner(&self, kind: OperationKind, pid: u32) -> Result<bool, LockError>;

    /// Whether `pid` belongs to a running process.
    fn is_live(&self, pid: u32) -> bool;
}

/// Marker files `<dir>/<kind>.lock` containing the owner's PID.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the marker file for `kind`.
    pub fn marker_path(&self, kind: OperationKind) -> PathBuf {
        self.dir.join(format!("{kind}.lock"))
    }

    fn io_err(path: &Path, source: std::io::Error) -> LockError {
        LockError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl LockStore for FileLockStore {
    fn try_create(&self, kind: OperationKind, pid: u32) -> Result<bool, LockError> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;
        let path = self.marker_path(kind);

        // Write the PID to a temp file first, then link it into place without
        // clobbering, so a reader never sees an empty or partial marker.
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;
        tmp.write_all(pid.to_string().as_bytes())
            .map_err(|e| Self::io_err(tmp.path(), e))?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Self::io_err(&path, e.error)),
        }
    }

    fn owner(&self, kind: OperationKind) -> Result<Option<u32>, LockError> {
        let path = self.marker_path(kind);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents.trim().parse().unwrap_or(0))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(&path, e)),
        }
    }

    fn remove_if_owner(&self, kind: OperationKind, pid: u32) -> Result<bool, LockError> {
        let path = self.marker_path(kind);
        if !path.exists() {
            return Ok(false);
        }

        // Move the marker aside under a name only we know, then decide on
        // what was actually taken. The marker path itself is never deleted.
        let aside = tempfile::Builder::new()
            .prefix(&format!(".{kind}.reclaim-"))
            .tempfile_in(&self.dir)
            .map_err(|e| Self::io_err(&self.dir, e))?
            .into_temp_path();
        match fs::rename(&path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Self::io_err(&path, e)),
        }

        let taken = fs::read_to_string(&aside).map_err(|e| Self::io_err(&aside, e))?;
        let taken_pid: u32 = taken.trim().parse().unwrap_or(0);
        if taken_pid == pid {
            aside.close().map_err(|e| Self::io_err(&path, e))?;
            return Ok(true);
        }

        // Not ours to delete: put it back unless a new marker already exists.
        match fs::hard_link(&aside, &path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(%kind, owner_pid = taken_pid, "lock marker replaced while being restored");
            }
            Err(e) => return Err(Self::io_err(&path, e)),
        }
        debug!(%kind, expected_pid = pid, owner_pid = taken_pid, "lock marker changed owner, left in place");
        Ok(false)
    }

    fn is_live(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }
}

/// Check whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    // 0 and values above i32::MAX would address process groups in kill(2).
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }

    #[cfg(unix)]
    {
        // Signal 0 doesn't send a signal, just checks if process exists.
        // EPERM means it exists but belongs to another user.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        pid == std::process::id()
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Acquires locks from a [`LockStore`] with stale-lock reclamation.
#[derive(Clone)]
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    poll_interval: Duration,
    pid: u32,
}

impl LockGuard {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
            pid: std::process::id(),
        }
    }

    /// Override the interval between attempts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the PID written into markers.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Acquire the lock for `kind`, waiting up to `timeout` for a live holder.
    ///
    /// A marker owned by a dead process is removed and acquisition retried
    /// immediately. A marker owned by a live process for the whole timeout
    /// yields [`LockError::Busy`]; the caller aborts rather than queuing.
    pub async fn acquire(
        &self,
        kind: OperationKind,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let started = tokio::time::Instant::now();

        loop {
            if self.store.try_create(kind, self.pid)? {
                info!(%kind, pid = self.pid, "lock acquired");
                return Ok(LockHandle {
                    store: self.store.clone(),
                    kind,
                    pid: self.pid,
                    released: false,
                });
            }

            let owner = match self.store.owner(kind)? {
                Some(pid) => pid,
                // Released between our create attempt and the read.
                None => continue,
            };

            if !self.store.is_live(owner) {
                if self.store.remove_if_owner(kind, owner)? {
                    warn!(%kind, stale_pid = owner, "reclaimed stale lock");
                }
                continue;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(%kind, owner_pid = owner, "lock busy, giving up");
                return Err(LockError::Busy {
                    kind,
                    owner_pid: owner,
                    waited_secs: waited.as_secs(),
                });
            }

            debug!(%kind, owner_pid = owner, "lock held, waiting");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// A held lock. Released explicitly via [`LockHandle::release`] or on drop.
pub struct LockHandle {
    store: Arc<dyn LockStore>,
    kind: OperationKind,
    pid: u32,
    released: bool,
}

impl LockHandle {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Remove the marker. Safe to call more than once.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        if !self.store.remove_if_owner(self.kind, self.pid)? {
            warn!(kind = %self.kind, pid = self.pid, "lock marker was missing or no longer ours");
        }
        self.released = true;
        info!(kind = %self.kind, "lock released");
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(kind = %self.kind, error = %e, "failed to release lock");
        }
    }
}
