//! Outcome types reported by push and pull cycles.

use serde::{Deserialize, Serialize};

use crate::lock::OperationKind;

/// Why a cycle finished without doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The development-mode marker exists.
    DevMode,
    /// The working tree has no staged or unstaged differences.
    NoChanges,
    /// Every changed path matched a trivial pattern.
    TrivialChanges,
    /// Staging produced no difference against HEAD.
    NothingStaged,
    /// Local branch already contains the authoritative tip.
    UpToDate,
    /// The remote or authoritative branch does not exist.
    NoTrackingBranch,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DevMode => write!(f, "development mode is active"),
            Self::NoChanges => write!(f, "no local changes"),
            Self::TrivialChanges => write!(f, "only trivial changes"),
            Self::NothingStaged => write!(f, "nothing to commit after staging"),
            Self::UpToDate => write!(f, "already up to date"),
            Self::NoTrackingBranch => write!(f, "no remote tracking branch"),
        }
    }
}

/// Successful terminal state of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Work was done. `commit` is the new local HEAD.
    Synced {
        commit: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    /// Nothing needed doing.
    Skipped { reason: SkipReason },
}

impl SyncOutcome {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }
}

/// Result of a successful cycle together with the non-fatal problems seen on
/// the way (failed backup, stash conflict, missing materializer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub operation: OperationKind,
    #[serde(flatten)]
    pub outcome: SyncOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub fn new(operation: OperationKind, outcome: SyncOutcome) -> Self {
        Self {
            operation,
            outcome,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            SyncOutcome::Synced {
                commit,
                branch: Some(branch),
            } => format!("{} synced {} to {}", self.operation, short(commit), branch),
            SyncOutcome::Synced { commit, branch: None } => {
                format!("{} synced to {}", self.operation, short(commit))
            }
            SyncOutcome::Skipped { reason } => format!("{} skipped: {}", self.operation, reason),
        }
    }
}

fn short(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
