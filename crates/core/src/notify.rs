//! Notifications for terminal outcomes.
//!
//! The engine only produces the message text and severity. Delivery (desktop
//! popups, mail) belongs to whoever implements [`Notifier`]; the default
//! [`TracingNotifier`] writes them to the log.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::errors::SyncError;
use crate::lock::OperationKind;
use crate::models::SyncReport;

/// How loudly a notification should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// Needs a human before the next cycle can be trusted.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl Notification {
    /// Notification for a successful cycle. Warnings raise the severity.
    pub fn for_report(report: &SyncReport) -> Self {
        let severity = if report.warnings.is_empty() {
            Severity::Info
        } else {
            Severity::Warning
        };
        let mut message = report.summary();
        for warning in &report.warnings {
            message.push_str("\nwarning: ");
            message.push_str(warning);
        }
        Self {
            severity,
            title: format!("autosync {}", report.operation),
            message,
        }
    }

    /// Notification for a failed cycle.
    pub fn for_error(operation: OperationKind, err: &SyncError) -> Self {
        if err.is_critical() {
            Self {
                severity: Severity::Critical,
                title: format!("autosync {operation}: manual intervention required"),
                message: err.to_string(),
            }
        } else {
            Self {
                severity: Severity::Error,
                title: format!("autosync {operation} failed"),
                message: err.to_string(),
            }
        }
    }
}

/// Sink for engine notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications as structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: &Notification) {
        match n.severity {
            Severity::Info => info!(title = %n.title, "{}", n.message),
            Severity::Warning => warn!(title = %n.title, "{}", n.message),
            Severity::Error | Severity::Critical => {
                error!(severity = %n.severity, title = %n.title, "{}", n.message)
            }
        }
    }
}
