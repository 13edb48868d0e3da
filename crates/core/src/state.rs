//! Last-successful-cycle timestamps kept in the state directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::lock::OperationKind;

/// Reads and writes `last-sync` (push) and `last-pull` under one directory.
#[derive(Debug, Clone)]
pub struct SyncState {
    dir: PathBuf,
}

impl SyncState {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, kind: OperationKind) -> PathBuf {
        match kind {
            OperationKind::Push => self.dir.join("last-sync"),
            OperationKind::Pull => self.dir.join("last-pull"),
        }
    }

    pub fn record(&self, kind: OperationKind, at: DateTime<Utc>) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(kind);
        fs::write(&path, format!("{}\n", at.to_rfc3339()))?;
        debug!(%kind, path = %path.display(), "recorded sync timestamp");
        Ok(())
    }

    /// `None` if never recorded or unreadable.
    pub fn last(&self, kind: OperationKind) -> Option<DateTime<Utc>> {
        let path = self.path(kind);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read sync timestamp");
                return None;
            }
        };
        DateTime::parse_from_rfc3339(contents.trim())
            .map(|t| t.with_timezone(&Utc))
            .ok()
    }
}
