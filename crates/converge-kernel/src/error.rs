//! Error types for the stage sequencer

use crate::stage::StageId;
use converge_config::ConfigError;
use converge_schema::ReconcileError;
use std::path::PathBuf;

/// Errors raised while building a [`crate::StagePlan`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Stage added twice
    #[error("stage {0} is defined more than once")]
    DuplicateStage(StageId),

    /// Dependency names a stage that is not in the plan
    #[error("stage {stage} depends on {dependency}, which is not in the plan")]
    UnknownDependency { stage: StageId, dependency: StageId },

    /// Dependency is placed after its dependent
    #[error("stage {stage} depends on {dependency}, which runs later")]
    DependencyOrder { stage: StageId, dependency: StageId },

    /// Resume target is not in the plan
    #[error("cannot resume from {0}: stage is not in the plan")]
    UnknownStage(StageId),

    /// Stage name did not parse
    #[error("unknown stage '{name}' (expected one of: {expected})")]
    UnknownStageName { name: String, expected: String },
}

/// Errors from a single stage; recorded by the sequencer, never swallowed
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Command could not be started
    #[error("failed to start `{command}`: {message}")]
    Spawn { command: String, message: String },

    /// Command exited unsuccessfully
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Operation exceeded its timeout
    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    /// Required tools or files are missing
    #[error("missing: {}", .0.join(", "))]
    Missing(Vec<String>),

    /// A checked condition did not hold
    #[error("{0}")]
    Unsatisfied(String),

    /// Filesystem error
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration convergence failed
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Database convergence failed
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl StageError {
    /// Create IO error with path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the operation ran out of time
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result alias for stage actions
pub type StageResult<T> = Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use converge_schema::{CatalogError, ReconcileStep};

    #[test]
    fn reconcile_errors_keep_their_message() {
        let err: StageError = ReconcileError::Step {
            step: ReconcileStep::NormalizeCollation,
            source: CatalogError::Unreachable("connection refused".into()),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "normalize-collation failed after retry: database unreachable: connection refused"
        );
    }

    #[test]
    fn missing_lists_every_item() {
        let err = StageError::Missing(vec!["git".into(), "mvn".into()]);
        assert_eq!(err.to_string(), "missing: git, mvn");
    }
}
