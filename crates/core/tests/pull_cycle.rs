//! End-to-end tests for the pull path against real git repositories.
//!
//! The remote is a local bare repository; no network I/O. Tests skip
//! gracefully if `git` is not installed.

mod common;

use std::sync::Arc;

use autosync_core::lock::{FileLockStore, OperationKind};
use autosync_core::notify::Severity;
use autosync_core::{SkipReason, SyncError, SyncOutcome};

use common::*;

#[tokio::test]
async fn test_pull_fast_forwards_and_applies() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    let remote_head = fx.commit_remote("dot_vimrc", "set number\n");

    let materializer = RecordingMaterializer::new();
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    let report = engine.pull().await.expect("pull should succeed");
    assert_eq!(
        report.outcome,
        SyncOutcome::Synced {
            commit: remote_head.clone(),
            branch: None
        }
    );
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    assert_eq!(head(&fx.local), remote_head);
    assert_eq!(read(&fx.local, "dot_vimrc"), "set number\n");
    assert_eq!(materializer.calls(), vec!["verify", "dry_run", "apply"]);

    // One snapshot, taken before the pull.
    assert_eq!(engine.backups().list().unwrap().len(), 1);
    assert!(fx.state.join("last-pull").exists());
    assert!(!FileLockStore::new(fx.state.join("locks"))
        .marker_path(OperationKind::Pull)
        .exists());
    assert_eq!(notifier.notes().len(), 1);
}

#[tokio::test]
async fn test_second_pull_is_a_no_op() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    fx.commit_remote("dot_vimrc", "set number\n");

    let materializer = RecordingMaterializer::new();
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    engine.pull().await.unwrap();
    let after_first = head(&fx.local);

    let report = engine.pull().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::skipped(SkipReason::UpToDate));
    assert_eq!(head(&fx.local), after_first);
    assert_eq!(materializer.count("apply"), 1);
}

#[tokio::test]
async fn test_pull_with_local_edit_stashes_and_restores() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    let remote_head = fx.commit_remote("other.txt", "from the other machine\n");
    write(&fx.local, "file.txt", "line one\nlocal edit\n");

    let materializer = RecordingMaterializer::new();
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    let report = engine.pull().await.expect("pull should succeed");
    assert!(!report.outcome.is_skip());
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);

    assert_eq!(head(&fx.local), remote_head);
    assert_eq!(read(&fx.local, "file.txt"), "line one\nlocal edit\n");
    assert_eq!(read(&fx.local, "other.txt"), "from the other machine\n");
    assert_eq!(git(&fx.local, &["stash", "list"]), "");
}

#[tokio::test]
async fn test_failed_verification_rolls_back_to_initial_commit() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    fx.commit_remote("dot_vimrc", "{{ broken template\n");
    write(&fx.local, "file.txt", "line one\nlocal edit\n");
    let initial = head(&fx.local);

    let materializer = RecordingMaterializer::failing_verify();
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    let err = engine.pull().await.unwrap_err();
    assert!(matches!(err, SyncError::Validation { .. }), "got {err:?}");

    assert_eq!(head(&fx.local), initial);
    assert!(!fx.local.join("dot_vimrc").exists());
    assert_eq!(read(&fx.local, "file.txt"), "line one\nlocal edit\n");
    assert_eq!(materializer.count("apply"), 0);
    assert!(!fx.state.join("last-pull").exists());

    let notes = notifier.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].severity, Severity::Error);
}

#[tokio::test]
async fn test_failed_apply_is_rolled_back_and_reapplied() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    fx.commit_remote("dot_vimrc", "set number\n");
    let initial = head(&fx.local);

    let materializer = RecordingMaterializer::failing_applies(1);
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    let err = engine.pull().await.unwrap_err();
    assert!(matches!(err, SyncError::Apply { .. }), "got {err:?}");
    assert!(!err.is_critical());
    assert_eq!(head(&fx.local), initial);
    assert_eq!(materializer.count("apply"), 2);
}

#[tokio::test]
async fn test_failed_rollback_is_critical() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    fx.commit_remote("dot_vimrc", "set number\n");

    let materializer = RecordingMaterializer::failing_applies(usize::MAX);
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    let err = engine.pull().await.unwrap_err();
    assert!(err.is_critical(), "got {err:?}");
    let message = err.to_string();
    assert!(message.contains("manual intervention required"));
    assert!(message.contains("backup at"));

    let notes = notifier.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].severity, Severity::Critical);
    assert!(notes[0].title.contains("manual intervention required"));
}

#[tokio::test]
async fn test_missing_materializer_is_a_warning() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    let remote_head = fx.commit_remote("dot_vimrc", "set number\n");

    let materializer = RecordingMaterializer::unavailable();
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    let report = engine.pull().await.expect("pull should succeed");
    assert_eq!(head(&fx.local), remote_head);
    assert!(!report.warnings.is_empty());
    assert_eq!(notifier.notes()[0].severity, Severity::Warning);
}

#[tokio::test]
async fn test_pull_without_remote_is_a_skip() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    git(&fx.local, &["remote", "remove", "origin"]);

    let materializer = RecordingMaterializer::new();
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    let report = engine.pull().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::skipped(SkipReason::NoTrackingBranch));
    assert!(materializer.calls().is_empty());
}

#[tokio::test]
async fn test_pull_of_missing_branch_is_a_skip_without_retries() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    write(&fx.local, "file.txt", "dirty\n");

    let mut config = fx.config();
    config.remote.authoritative_branch = "does-not-exist".into();
    config.retry.initial_delay_secs = 3600;

    let materializer = RecordingMaterializer::new();
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(config, &materializer, &notifier);

    let started = std::time::Instant::now();
    let report = engine.pull().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::skipped(SkipReason::NoTrackingBranch));
    assert!(started.elapsed() < std::time::Duration::from_secs(60));
    // The stash taken before fetching was given back.
    assert_eq!(read(&fx.local, "file.txt"), "dirty\n");
}

#[tokio::test]
async fn test_pull_of_missing_source_tree_fails() {
    let fx_dir = tempfile::tempdir().unwrap();
    let mut config = autosync_core::SyncConfig::default();
    config.sync.source_dir = fx_dir.path().join("no-such-tree");
    config.sync.state_dir = Some(fx_dir.path().join("state"));
    config.resolve_paths().unwrap();

    let notifier = RecordingNotifier::new();
    let engine = autosync_core::SyncEngine::new(
        config,
        Box::new(autosync_core::git::GitStore::new(fx_dir.path().join("no-such-tree"))),
        Box::new(RecordingMaterializer::new()),
        Arc::new(CountingLockStore::default()),
        notifier.clone(),
    );

    let err = engine.pull().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidSourceTree { .. }), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_pull_while_locked_is_busy() {
    let fx_dir = tempfile::tempdir().unwrap();
    let mut config = autosync_core::SyncConfig::default();
    config.sync.source_dir = fx_dir.path().join("tree");
    config.sync.state_dir = Some(fx_dir.path().join("state"));
    config.sync.lock_timeout_secs = 2;
    config.resolve_paths().unwrap();

    let locks = Arc::new(CountingLockStore::default());
    use autosync_core::lock::LockStore;
    assert!(locks.try_create(OperationKind::Pull, 1).unwrap());

    let engine = autosync_core::SyncEngine::new(
        config,
        Box::new(autosync_core::git::GitStore::new(fx_dir.path().join("tree"))),
        Box::new(RecordingMaterializer::new()),
        locks.clone(),
        RecordingNotifier::new(),
    );

    let err = engine.pull().await.unwrap_err();
    assert!(matches!(err, SyncError::Busy(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 1);
    // The other holder keeps its lock.
    assert!(locks.is_held(OperationKind::Pull));
    // Ours, then the engine's polls at 0s, 1s and 2s.
    assert_eq!(locks.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_lock_guard_poll_interval_is_honoured() {
    use autosync_core::lock::{LockGuard, LockStore};
    use std::time::Duration;

    let fx_dir = tempfile::tempdir().unwrap();
    let mut config = autosync_core::SyncConfig::default();
    config.sync.source_dir = fx_dir.path().join("tree");
    config.sync.state_dir = Some(fx_dir.path().join("state"));
    config.sync.lock_timeout_secs = 2;
    config.resolve_paths().unwrap();

    let locks = Arc::new(CountingLockStore::default());
    assert!(locks.try_create(OperationKind::Pull, 1).unwrap());

    let engine = autosync_core::SyncEngine::new(
        config,
        Box::new(autosync_core::git::GitStore::new(fx_dir.path().join("tree"))),
        Box::new(RecordingMaterializer::new()),
        locks.clone(),
        RecordingNotifier::new(),
    )
    .with_lock_guard(LockGuard::new(locks.clone()).with_poll_interval(Duration::from_millis(500)));

    let err = engine.pull().await.unwrap_err();
    assert!(matches!(err, SyncError::Busy(_)), "got {err:?}");
    // Ours, then polls every half second from 0s through 2s.
    assert_eq!(locks.attempts(), 6);
}

#[tokio::test]
async fn test_unwritable_timestamp_is_a_warning_after_pull() {
    if !git_available() {
        eprintln!("SKIP: git not installed");
        return;
    }
    let fx = Fixture::new();
    let remote_head = fx.commit_remote("dot_vimrc", "set number\n");
    // A directory where the timestamp file should go.
    std::fs::create_dir_all(fx.state.join("last-pull")).unwrap();

    let materializer = RecordingMaterializer::new();
    let notifier = RecordingNotifier::new();
    let engine = fx.engine(fx.config(), &materializer, &notifier);

    let report = engine.pull().await.expect("pull should still succeed");
    assert!(matches!(report.outcome, SyncOutcome::Synced { .. }));
    assert_eq!(report.warnings.len(), 1, "warnings: {:?}", report.warnings);
    assert!(report.warnings[0].contains("last pull"), "{}", report.warnings[0]);
    assert_eq!(head(&fx.local), remote_head);
    assert_eq!(materializer.calls(), vec!["verify", "dry_run", "apply"]);
}
