//! Shared fixtures for the integration tests: real git repositories (a bare
//! "remote", this machine's clone and a second machine's clone), plus
//! recording fakes for the materializer, notifier and lock store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use autosync_core::config::SyncConfig;
use autosync_core::errors::{LockError, MaterializerError};
use autosync_core::git::GitStore;
use autosync_core::lock::{FileLockStore, LockStore, OperationKind};
use autosync_core::materializer::Materializer;
use autosync_core::notify::{Notification, Notifier};
use autosync_core::signals::ShutdownFlag;
use autosync_core::SyncEngine;

pub const MACHINE_ID: &str = "test-machine";
pub const MACHINE_BRANCH: &str = "auto-sync/test-machine";

// ===========================================================================
// git helpers
// ===========================================================================

/// Returns `true` if `git` is available on `$PATH`.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run git in `dir`, panicking on failure. Returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn configure_identity(dir: &Path, name: &str) {
    git(dir, &["config", "user.name", name]);
    git(dir, &["config", "user.email", &format!("{name}@example.com")]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

pub fn head(dir: &Path) -> String {
    git(dir, &["rev-parse", "HEAD"])
}

pub fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn read(dir: &Path, rel: &str) -> String {
    std::fs::read_to_string(dir.join(rel)).unwrap()
}

// ===========================================================================
// Repository fixture
// ===========================================================================

/// A bare remote with `main` holding `file.txt`, this machine's clone
/// (`local`, the source tree) and another machine's clone (`other`).
pub struct Fixture {
    _tmp: TempDir,
    pub remote: PathBuf,
    pub local: PathBuf,
    pub other: PathBuf,
    pub state: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let remote = root.join("remote.git");
        let seed = root.join("seed");
        let local = root.join("local");
        let other = root.join("other");

        git(&root, &["init", "--bare", "--quiet", remote.to_str().unwrap()]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        git(&root, &["init", "--quiet", seed.to_str().unwrap()]);
        configure_identity(&seed, "seed");
        write(&seed, "file.txt", "line one\n");
        write(&seed, "dot_bashrc", "export EDITOR=vim\n");
        git(&seed, &["add", "-A"]);
        git(&seed, &["commit", "--quiet", "-m", "initial"]);
        git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);
        git(&seed, &["push", "--quiet", "origin", "HEAD:refs/heads/main"]);

        for (dir, name) in [(&local, "local"), (&other, "other")] {
            git(&root, &["clone", "--quiet", remote.to_str().unwrap(), dir.to_str().unwrap()]);
            configure_identity(dir, name);
        }

        Self {
            state: root.join("state"),
            _tmp: tmp,
            remote,
            local,
            other,
        }
    }

    /// Resolved config for `local` with zero retry delays.
    pub fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.sync.source_dir = self.local.clone();
        config.sync.state_dir = Some(self.state.clone());
        config.identity.machine_id = Some(MACHINE_ID.into());
        config.retry.initial_delay_secs = 0;
        config.resolve_paths().unwrap();
        config.validate().unwrap();
        config
    }

    /// Commit `content` to `rel` from the other machine and publish it to main.
    pub fn commit_remote(&self, rel: &str, content: &str) -> String {
        write(&self.other, rel, content);
        git(&self.other, &["add", "-A"]);
        git(&self.other, &["commit", "--quiet", "-m", &format!("update {rel}")]);
        git(&self.other, &["push", "--quiet", "origin", "HEAD:refs/heads/main"]);
        head(&self.other)
    }

    pub fn remote_ref(&self, branch: &str) -> Option<String> {
        let out = git(&self.remote, &["for-each-ref", "--format=%(objectname)", &format!("refs/heads/{branch}")]);
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    pub fn engine(
        &self,
        config: SyncConfig,
        materializer: &RecordingMaterializer,
        notifier: &Arc<RecordingNotifier>,
    ) -> SyncEngine {
        let lock_store = Arc::new(FileLockStore::new(config.lock_dir()));
        SyncEngine::new(
            config,
            Box::new(GitStore::new(&self.local)),
            Box::new(materializer.clone()),
            lock_store,
            notifier.clone(),
        )
    }
}

// ===========================================================================
// Fakes
// ===========================================================================

/// Records every materializer call. Failures are scripted per step.
#[derive(Clone, Default)]
pub struct RecordingMaterializer {
    calls: Arc<Mutex<Vec<&'static str>>>,
    fail_verify: bool,
    /// Number of `apply` calls that fail before applies start succeeding.
    failing_applies: Arc<AtomicUsize>,
    unavailable: bool,
    /// Set during `verify`, as if a signal arrived mid-cycle.
    interrupt: Option<ShutdownFlag>,
}

impl RecordingMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_verify() -> Self {
        Self {
            fail_verify: true,
            ..Self::default()
        }
    }

    pub fn failing_applies(count: usize) -> Self {
        Self {
            failing_applies: Arc::new(AtomicUsize::new(count)),
            ..Self::default()
        }
    }

    pub fn interrupting(shutdown: ShutdownFlag) -> Self {
        Self {
            interrupt: Some(shutdown),
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, step: &str) -> usize {
        self.calls().iter().filter(|c| **c == step).count()
    }

    fn record(&self, step: &'static str) -> Result<(), MaterializerError> {
        if self.unavailable {
            return Err(MaterializerError::Unavailable("fake".into()));
        }
        self.calls.lock().unwrap().push(step);
        Ok(())
    }

    fn failed(step: &str) -> MaterializerError {
        MaterializerError::Failed {
            step: step.into(),
            exit_code: 1,
            detail: format!("scripted {step} failure"),
        }
    }
}

impl Materializer for RecordingMaterializer {
    fn is_available(&self) -> bool {
        !self.unavailable
    }

    fn verify(&self, _source: &Path) -> Result<(), MaterializerError> {
        self.record("verify")?;
        if let Some(shutdown) = &self.interrupt {
            shutdown.trigger();
        }
        if self.fail_verify {
            return Err(Self::failed("verify"));
        }
        Ok(())
    }

    fn apply_dry_run(&self, _source: &Path) -> Result<(), MaterializerError> {
        self.record("dry_run")
    }

    fn apply(&self, _source: &Path) -> Result<(), MaterializerError> {
        self.record("apply")?;
        let remaining = self.failing_applies.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_applies.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::failed("apply"));
        }
        Ok(())
    }
}

/// Keeps every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    notes: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notes(&self) -> Vec<Notification> {
        self.notes.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.notes.lock().unwrap().push(notification.clone());
    }
}

/// In-memory lock store that counts acquisition attempts.
#[derive(Default)]
pub struct CountingLockStore {
    markers: Mutex<HashMap<OperationKind, u32>>,
    attempts: AtomicUsize,
}

impl CountingLockStore {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_held(&self, kind: OperationKind) -> bool {
        self.markers.lock().unwrap().contains_key(&kind)
    }
}

impl LockStore for CountingLockStore {
    fn try_create(&self, kind: OperationKind, pid: u32) -> Result<bool, LockError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut markers = self.markers.lock().unwrap();
        if markers.contains_key(&kind) {
            return Ok(false);
        }
        markers.insert(kind, pid);
        Ok(true)
    }

    fn owner(&self, kind: OperationKind) -> Result<Option<u32>, LockError> {
        Ok(self.markers.lock().unwrap().get(&kind).copied())
    }

    fn remove_if_owner(&self, kind: OperationKind, pid: u32) -> Result<bool, LockError> {
        let mut markers = self.markers.lock().unwrap();
        if markers.get(&kind) == Some(&pid) {
            markers.remove(&kind);
            return Ok(true);
        }
        Ok(false)
    }

    fn is_live(&self, _pid: u32) -> bool {
        true
    }
}
