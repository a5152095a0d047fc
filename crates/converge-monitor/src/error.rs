//! Error types for the readiness wait

use std::path::PathBuf;
use std::time::Duration;

/// Errors from [`crate::ReadinessMonitor`]
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    /// Neither probe fired before the deadline
    #[error("not ready after {}s; {remediation}", .waited.as_secs())]
    Timeout {
        /// How long the monitor waited
        waited: Duration,
        /// Log the operator should inspect
        log: Option<PathBuf>,
        /// What to do next
        remediation: String,
    },

    /// The operator interrupted the wait
    #[error("readiness wait cancelled")]
    Cancelled,

    /// No health URL and no log file configured
    #[error("readiness wait needs a health url or a log file")]
    NoProbes,

    /// HTTP client could not be built
    #[error("http client: {0}")]
    Client(String),
}

impl ReadinessError {
    /// Timeout with the standard remediation text
    #[must_use]
    pub fn timeout(waited: Duration, log: Option<PathBuf>) -> Self {
        let remediation = match &log {
            Some(path) => format!("inspect {} for startup errors", path.display()),
            None => "inspect the application log for startup errors".to_string(),
        };
        Self::Timeout {
            waited,
            log,
            remediation,
        }
    }

    /// Whether the wait simply ran out of time
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
