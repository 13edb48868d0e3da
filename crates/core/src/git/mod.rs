//! Versioned store abstraction and its git implementation.

pub mod client;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::classify::ChangeSet;
use crate::errors::GitError;

pub use client::GitStore;

/// Opaque identifier of a commit (full hex SHA for git).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines and commit messages.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<git2::Oid> for CommitId {
    fn from(oid: git2::Oid) -> Self {
        Self(oid.to_string())
    }
}

/// Which side of the working tree to diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffScope {
    /// Working tree against the index, untracked files included.
    Unstaged,
    /// Index against HEAD.
    Staged,
}

/// Result of re-applying a stash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StashRestore {
    Restored,
    /// The stash did not apply cleanly. It is kept in the stash list.
    Conflicted(String),
}

/// The operations the sync engine needs from a version-controlled source
/// tree and its remote.
///
/// Calls are synchronous; each one either fully happens or returns an error.
pub trait VersionedStore: Send + Sync {
    /// Root of the working tree.
    fn root(&self) -> &Path;

    /// Whether the root exists and is a repository.
    fn is_repository(&self) -> bool;

    /// Commit checked out at HEAD.
    fn current_commit(&self) -> Result<CommitId, GitError>;

    fn has_remote(&self, remote: &str) -> Result<bool, GitError>;

    /// Update the remote tracking ref for `branch` and return its commit.
    /// A branch that does not exist on the remote is [`GitError::RefNotFound`].
    fn fetch(&self, remote: &str, branch: &str) -> Result<CommitId, GitError>;

    /// `(ahead, behind)` of `local` relative to `upstream`.
    fn ahead_behind(&self, local: &CommitId, upstream: &CommitId)
        -> Result<(usize, usize), GitError>;

    fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>, GitError>;

    /// Paths that differ in the working tree.
    fn diff_names(&self, scope: DiffScope) -> Result<ChangeSet, GitError>;

    /// Paths that differ between two commits.
    fn diff_between(&self, from: &CommitId, to: &CommitId) -> Result<ChangeSet, GitError>;

    /// Fetch `branch` and rebase the current branch onto it, stashing and
    /// restoring local edits around the rebase. A conflicting rebase is
    /// aborted before returning.
    fn rebase_pull(&self, remote: &str, branch: &str) -> Result<(), GitError>;

    /// Stash all local edits including untracked files. Returns `false` if
    /// there was nothing to stash.
    fn stash_push(&self, message: &str) -> Result<bool, GitError>;

    /// Re-apply and drop the most recent stash.
    fn stash_pop(&self) -> Result<StashRestore, GitError>;

    /// Move HEAD, index and working tree to `commit`.
    fn reset_hard(&self, commit: &CommitId) -> Result<(), GitError>;

    /// Move HEAD to its parent, keeping the working tree.
    fn undo_last_commit(&self) -> Result<(), GitError>;

    /// Stage every change, deletions and untracked files included.
    fn stage_all(&self) -> Result<(), GitError>;

    /// Commit the index on top of HEAD.
    fn commit(&self, message: &str) -> Result<CommitId, GitError>;

    /// Publish HEAD to `branch` on `remote`, replacing what is there.
    fn push(&self, remote: &str, branch: &str) -> Result<(), GitError>;
}
