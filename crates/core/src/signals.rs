//! Signal handling for interruptible sync cycles.
//!
//! [`ShutdownFlag::listen`] installs the SIGINT/SIGTERM handlers before a
//! cycle starts. The engine checks the flag at each safe state transition and
//! stops with [`SyncError::Interrupted`], undoing whatever the cycle had
//! started. [`run_interruptible`] additionally races the cycle against the
//! flag so waits (lock polling, retry backoff) end immediately; dropping the
//! cycle future drops its [`crate::lock::LockHandle`] and removes the marker.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::errors::SyncError;

#[derive(Debug, Default)]
struct FlagState {
    triggered: AtomicBool,
    notify: Notify,
}

/// Set once a shutdown has been requested. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    state: Arc<FlagState>,
}

impl ShutdownFlag {
    /// A flag that is only set through [`ShutdownFlag::trigger`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Install SIGINT and SIGTERM handlers now and return a flag they set.
    ///
    /// Must be called from within a Tokio runtime. The handlers stay
    /// installed for the rest of the process.
    #[cfg(unix)]
    pub fn listen() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let flag = Self::new();
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => info!("received SIGINT"),
                _ = terminate.recv() => info!("received SIGTERM"),
            }
            setter.trigger();
        });
        Ok(flag)
    }

    /// Install a Ctrl+C handler and return a flag it sets.
    #[cfg(not(unix))]
    pub fn listen() -> std::io::Result<Self> {
        let flag = Self::new();
        let setter = flag.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("received Ctrl+C");
                    setter.trigger();
                }
                Err(e) => warn!(error = %e, "failed to install Ctrl+C handler"),
            }
        });
        Ok(flag)
    }

    pub fn trigger(&self) {
        self.state.triggered.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.state.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Run `operation` until it finishes or `shutdown` resolves, whichever is
/// first.
pub async fn run_interruptible<T, F, S>(operation: F, shutdown: S) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
    S: Future<Output = ()>,
{
    tokio::select! {
        result = operation => result,
        _ = shutdown => {
            warn!("cycle interrupted, releasing resources");
            Err(SyncError::Interrupted)
        }
    }
}
