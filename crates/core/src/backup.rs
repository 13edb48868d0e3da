//! Timestamped snapshots of the source tree and retention pruning.
//!
//! Snapshots are full recursive copies placed under the backup root in
//! directories named `backup-YYYYMMDD-HHMMSS` in UTC, so wall-clock changes
//! never reorder them. A second snapshot within the same second gets a
//! zero-padded suffix (`-02`, `-03`, ...). [`BackupManager::list`] orders by
//! timestamp then suffix, which is what pruning relies on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::BackupError;

/// Prefix shared by every snapshot directory.
pub const BACKUP_PREFIX: &str = "backup-";

/// Default number of snapshots kept by [`BackupManager::prune`].
pub const DEFAULT_KEEP: usize = 10;

/// An immutable snapshot of the source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub name: String,
    pub path: PathBuf,
}

/// Creates and prunes snapshots under one backup root.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `source` into a new snapshot named after the current UTC time.
    pub fn create_backup(&self, source: &Path) -> Result<Backup, BackupError> {
        self.create_backup_at(source, Utc::now())
    }

    /// Copy `source` into a new snapshot named after `now`.
    ///
    /// Two snapshots within the same second get a numeric suffix so the second
    /// never overwrites the first.
    pub fn create_backup_at(
        &self,
        source: &Path,
        now: DateTime<Utc>,
    ) -> Result<Backup, BackupError> {
        if !source.is_dir() {
            return Err(BackupError::SourceMissing(source.display().to_string()));
        }
        fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;

        let stem = format!("{BACKUP_PREFIX}{}", now.format("%Y%m%d-%H%M%S"));
        let mut name = stem.clone();
        let mut n = 1;
        while self.root.join(&name).exists() {
            n += 1;
            name = format!("{stem}-{n:02}");
        }

        let path = self.root.join(&name);
        copy_tree(source, &path)?;
        info!(backup = %name, source = %source.display(), "created backup");
        Ok(Backup { name, path })
    }

    /// All snapshots, oldest first.
    pub fn list(&self) -> Result<Vec<Backup>, BackupError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root, e)),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .map_err(|e| io_err(&entry.path(), e))?
                .is_dir();
            if is_dir && name.starts_with(BACKUP_PREFIX) {
                backups.push(Backup {
                    path: entry.path(),
                    name,
                });
            }
        }
        backups.sort_by(|a, b| order_key(&a.name).cmp(&order_key(&b.name)));
        Ok(backups)
    }

    /// Delete all but the `keep` most recent snapshots. Returns how many were
    /// removed.
    pub fn prune(&self, keep: usize) -> Result<usize, BackupError> {
        let backups = self.list()?;
        if backups.len() <= keep {
            debug!(count = backups.len(), keep, "nothing to prune");
            return Ok(0);
        }

        let excess = backups.len() - keep;
        for backup in &backups[..excess] {
            fs::remove_dir_all(&backup.path).map_err(|e| io_err(&backup.path, e))?;
            debug!(backup = %backup.name, "pruned backup");
        }
        info!(removed = excess, kept = keep, "pruned old backups");
        Ok(excess)
    }
}

/// `(timestamp stem, same-second counter)`. The unsuffixed first snapshot
/// counts as 1.
fn order_key(name: &str) -> (&str, u64) {
    let stem_len = BACKUP_PREFIX.len() + "YYYYMMDD-HHMMSS".len();
    match name.get(..stem_len).zip(name.get(stem_len..)) {
        Some((stem, "")) => (stem, 1),
        Some((stem, rest)) => match rest.strip_prefix('-').and_then(|n| n.parse().ok()) {
            Some(n) => (stem, n),
            None => (name, 0),
        },
        None => (name, 0),
    }
}

fn io_err(path: &Path, source: io::Error) -> BackupError {
    BackupError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Recursively copy `src` to `dst`, preserving symlinks as symlinks.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), BackupError> {
    fs::create_dir_all(dst).map_err(|e| io_err(dst, e))?;

    for entry in fs::read_dir(src).map_err(|e| io_err(src, e))? {
        let entry = entry.map_err(|e| io_err(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| io_err(&from, e))?;

        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| io_err(&from, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), BackupError> {
    let target = fs::read_link(from).map_err(|e| io_err(from, e))?;
    std::os::unix::fs::symlink(target, to).map_err(|e| io_err(to, e))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), BackupError> {
    tracing::warn!(path = %from.display(), "copying symlink target instead of link");
    fs::copy(from, to).map(|_| ()).map_err(|e| io_err(from, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample_tree(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("top.txt"), "top").unwrap();
        fs::write(src.join("nested/inner.txt"), "inner").unwrap();
        src
    }

    #[test]
    fn test_backup_copies_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));

        let backup = manager.create_backup(&src).unwrap();
        assert!(backup.name.starts_with(BACKUP_PREFIX));
        assert_eq!(fs::read_to_string(backup.path.join("top.txt")).unwrap(), "top");
        assert_eq!(
            fs::read_to_string(backup.path.join("nested/inner.txt")).unwrap(),
            "inner"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_backup_preserves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        std::os::unix::fs::symlink("top.txt", src.join("link")).unwrap();
        let manager = BackupManager::new(dir.path().join("backups"));

        let backup = manager.create_backup(&src).unwrap();
        let link = backup.path.join("link");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("top.txt"));
    }

    #[test]
    fn test_same_second_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));

        let first = manager.create_backup_at(&src, at(0)).unwrap();
        let second = manager.create_backup_at(&src, at(0)).unwrap();
        assert_ne!(first.name, second.name);
        assert!(second.name.starts_with(&first.name));
        assert_eq!(manager.list().unwrap().len(), 2);
    }

    #[test]
    fn test_same_second_snapshots_list_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));

        let mut names = Vec::new();
        for _ in 0..12 {
            names.push(manager.create_backup_at(&src, at(0)).unwrap().name);
        }
        names.push(manager.create_backup_at(&src, at(1)).unwrap().name);

        assert_eq!(names[0], "backup-20231114-221320");
        assert_eq!(names[1], "backup-20231114-221320-02");
        assert_eq!(names[9], "backup-20231114-221320-10");

        let listed: Vec<String> = manager.list().unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(listed, names);

        // Pruning drops the oldest of the burst, not "-10" and "-11".
        manager.prune(3).unwrap();
        let kept: Vec<String> = manager.list().unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(kept, names[10..].to_vec());
    }

    #[test]
    fn test_order_key_counts_the_suffix_numerically() {
        let first = "backup-20231114-221320";
        assert_eq!(order_key(first), (first, 1));
        assert_eq!(order_key("backup-20231114-221320-02").1, 2);
        assert!(order_key("backup-20231114-221320-100") > order_key("backup-20231114-221320-99"));
        assert!(order_key("backup-20231114-221321") > order_key("backup-20231114-221320-99"));
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("backups"));
        let result = manager.create_backup(&dir.path().join("nope"));
        assert!(matches!(result, Err(BackupError::SourceMissing(_))));
    }

    #[test]
    fn test_prune_keeps_ten_most_recent_of_fifteen() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"));

        let mut names = Vec::new();
        for i in 0..15 {
            names.push(manager.create_backup_at(&src, at(i * 60)).unwrap().name);
        }

        // Unrelated entries in the root are left alone.
        fs::create_dir_all(manager.root().join("keep-me")).unwrap();

        let removed = manager.prune(DEFAULT_KEEP).unwrap();
        assert_eq!(removed, 5);

        let remaining: Vec<String> = manager.list().unwrap().into_iter().map(|b| b.name).collect();
        assert_eq!(remaining, names[5..].to_vec());
        assert!(manager.root().join("keep-me").exists());
    }

    #[test]
    fn test_prune_on_missing_root_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("never-created"));
        assert_eq!(manager.prune(3).unwrap(), 0);
    }
}
