//! Run results

use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// How a run was invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Stages were executed
    Apply,
    /// Predicates were evaluated, nothing was executed
    Preview,
    /// Only the validation stage ran
    ValidateOnly,
}

/// Result of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Action completed
    Succeeded,
    /// Completion predicate already held
    Skipped {
        /// The predicate that held
        reason: String,
    },
    /// Action failed
    Failed {
        /// Underlying error
        message: String,
        /// Suggested command for the operator
        remediation: String,
    },
    /// Preview: what the stage would do
    WouldRun {
        /// Planned work
        actions: Vec<String>,
    },
}

impl StageOutcome {
    /// Whether the stage failed
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
            Self::Failed { message, .. } => write!(f, "FAILED: {message}"),
            Self::WouldRun { actions } => write!(f, "would {}", actions.join("; ")),
        }
    }
}

/// One stage's entry in the report
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    /// Stage
    pub stage: StageId,
    /// Position in the plan
    pub position: usize,
    /// Result
    pub outcome: StageOutcome,
    /// Wall time, including predicate evaluation
    pub duration_ms: u64,
    /// Non-fatal problems
    pub warnings: Vec<String>,
}

/// Results of a sequencer run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique id of this run
    pub run_id: Uuid,
    /// Invocation mode
    pub mode: RunMode,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
    /// Stage the run started from
    pub resumed_from: Option<StageId>,
    /// Stages in the order they were visited
    pub stages: Vec<StageRecord>,
    /// Set when a failure stopped the run before the last stage
    pub halted_at: Option<StageId>,
}

impl RunReport {
    /// Empty report for a new run
    #[must_use]
    pub fn new(mode: RunMode, resumed_from: Option<StageId>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            finished_at: None,
            resumed_from,
            stages: Vec::new(),
            halted_at: None,
        }
    }

    /// Whether no stage failed
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.stages.iter().any(|s| s.outcome.is_failure())
    }

    /// Failed stages
    pub fn failures(&self) -> impl Iterator<Item = &StageRecord> {
        self.stages.iter().filter(|s| s.outcome.is_failure())
    }

    /// Every warning, prefixed with its stage
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|s| s.warnings.iter().map(move |w| format!("{}: {w}", s.stage)))
            .collect()
    }

    /// Record for a stage
    #[must_use]
    pub fn record(&self, stage: StageId) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Write the report as pretty JSON
    ///
    /// # Errors
    /// IO errors creating or writing the file.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
