//! autosync core library.
//!
//! This crate keeps a user-edited source tree (a chezmoi source directory,
//! typically) in sync with a remote git repository across machines:
//! cooperative locking, retries, backups, change classification, machine
//! identity, and the push/pull sync engine.

pub mod backup;
pub mod classify;
pub mod config;
pub mod engine;
pub mod errors;
pub mod git;
pub mod identity;
pub mod lock;
pub mod materializer;
pub mod models;
pub mod notify;
pub mod retry;
pub mod signals;
pub mod state;

// Re-exports for convenience.
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use errors::SyncError;
pub use models::{SkipReason, SyncOutcome, SyncReport};
