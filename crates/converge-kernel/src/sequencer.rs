//! Stage sequencer
//!
//! Runs the plan strictly in order. Before each stage its completion
//! predicate is evaluated; a stage that is already done is skipped. A failed
//! stage halts the run unless `force_continue` is set. Nothing is persisted
//! between runs: the predicates are the only record of progress, which is
//! what makes `--resume-from` and plain re-runs safe.
//!
//! # Example
//!
//! ```rust,ignore
//! let sequencer = Sequencer::new(plan)
//!     .with_config(Arc::new(convergence))
//!     .with_options(SequencerOptions { resume_from: Some(StageId::StartServices), ..Default::default() });
//! let report = sequencer.run().await?;
//! std::process::exit(if report.succeeded() { 0 } else { 1 });
//! ```

use crate::config::ConfigConvergence;
use crate::error::PlanError;
use crate::plan::StagePlan;
use crate::report::{RunMode, RunReport, StageOutcome, StageRecord};
use crate::stage::{Stage, StageId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Run options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequencerOptions {
    /// Evaluate predicates and describe actions without executing them
    pub preview: bool,
    /// Start at this stage instead of the first
    pub resume_from: Option<StageId>,
    /// Keep going after a failed stage
    pub force_continue: bool,
    /// Run only the validation stage
    pub validate_only: bool,
}

/// Executes a [`StagePlan`]
#[derive(Debug)]
pub struct Sequencer {
    plan: StagePlan,
    config: Option<Arc<ConfigConvergence>>,
    options: SequencerOptions,
}

impl Sequencer {
    /// Sequencer with default options and no configuration convergence
    #[must_use]
    pub fn new(plan: StagePlan) -> Self {
        Self {
            plan,
            config: None,
            options: SequencerOptions::default(),
        }
    }

    /// Converge this configuration before stages that need it
    #[must_use]
    pub fn with_config(mut self, config: Arc<ConfigConvergence>) -> Self {
        self.config = Some(config);
        self
    }

    /// Set run options
    #[must_use]
    pub fn with_options(mut self, options: SequencerOptions) -> Self {
        self.options = options;
        self
    }

    /// The plan being run
    #[inline]
    #[must_use]
    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Run the plan with the configured options
    ///
    /// # Errors
    /// [`PlanError::UnknownStage`] when the resume target is not in the plan.
    /// Stage failures are recorded in the report, not returned.
    pub async fn run(&self) -> Result<RunReport, PlanError> {
        self.execute(self.options).await
    }

    /// Evaluate every predicate and describe each action; mutates nothing
    ///
    /// # Errors
    /// [`PlanError::UnknownStage`] when the resume target is not in the plan.
    pub async fn preview(&self) -> Result<RunReport, PlanError> {
        self.execute(SequencerOptions {
            preview: true,
            ..self.options
        })
        .await
    }

    async fn execute(&self, options: SequencerOptions) -> Result<RunReport, PlanError> {
        let mode = if options.validate_only {
            RunMode::ValidateOnly
        } else if options.preview {
            RunMode::Preview
        } else {
            RunMode::Apply
        };
        let start = match options.resume_from {
            Some(id) => self.plan.position(id).ok_or(PlanError::UnknownStage(id))?,
            None => 0,
        };
        let mut report = RunReport::new(mode, options.resume_from);

        if start > 0 {
            self.check_bypassed(start).await;
        }

        let mut failed: HashSet<StageId> = HashSet::new();
        for (position, stage) in self.plan.stages().iter().enumerate().skip(start) {
            if options.validate_only && stage.id() != StageId::Validate {
                continue;
            }
            for dep in stage.deps().iter().filter(|d| failed.contains(d)) {
                tracing::warn!("Running {} although its dependency {} failed", stage.id(), dep);
            }

            let record = self.visit(position, stage, options.preview).await;
            let is_failure = record.outcome.is_failure();
            report.stages.push(record);

            if is_failure {
                failed.insert(stage.id());
                if options.force_continue {
                    tracing::warn!("Continuing past failed stage {}", stage.id());
                } else {
                    report.halted_at = Some(stage.id());
                    break;
                }
            }
        }

        report.finished_at = Some(chrono::Utc::now());
        Ok(report)
    }

    async fn check_bypassed(&self, start: usize) {
        let later = &self.plan.stages()[start..];
        for stage in &self.plan.stages()[..start] {
            let needed = later.iter().any(|s| s.deps().contains(&stage.id()));
            let Some(predicate) = stage.predicate() else {
                continue;
            };
            if needed && !predicate.is_satisfied().await {
                tracing::warn!(
                    "Resuming past {} but it does not look complete ({})",
                    stage.id(),
                    predicate.describe()
                );
            }
        }
    }

    async fn visit(&self, position: usize, stage: &Stage, preview: bool) -> StageRecord {
        let started = Instant::now();
        let mut warnings = Vec::new();
        let outcome = self.outcome(stage, preview, &mut warnings).await;

        match &outcome {
            StageOutcome::Succeeded => tracing::info!("Stage {} succeeded", stage.id()),
            StageOutcome::Skipped { reason } => {
                tracing::info!("Stage {} already complete ({}), skipping", stage.id(), reason);
            }
            StageOutcome::Failed { message, remediation } => {
                tracing::error!("Stage {} failed: {}", stage.id(), message);
                tracing::error!("To retry: {}", remediation);
            }
            StageOutcome::WouldRun { actions } => {
                for action in actions {
                    tracing::info!("[preview] {}: would {}", stage.id(), action);
                }
            }
        }

        StageRecord {
            stage: stage.id(),
            position,
            outcome,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            warnings,
        }
    }

    async fn outcome(&self, stage: &Stage, preview: bool, warnings: &mut Vec<String>) -> StageOutcome {
        // Configuration converges even when the stage itself is complete.
        let mut actions = Vec::new();
        if let Some(config) = self.config.as_ref().filter(|_| stage.requires_config()) {
            if preview {
                match config.preview() {
                    Ok(lines) => actions.extend(lines),
                    Err(err) => return self.failed(stage, &err),
                }
            } else {
                match config.converge().await {
                    Ok(report) => warnings.extend(report.warnings),
                    Err(err) => return self.failed(stage, &err),
                }
            }
        }

        if let Some(predicate) = stage.predicate() {
            tracing::debug!("Checking {}: {}", stage.id(), predicate.describe());
            if predicate.is_satisfied().await {
                if preview && !actions.is_empty() {
                    return StageOutcome::WouldRun { actions };
                }
                return StageOutcome::Skipped {
                    reason: predicate.describe(),
                };
            }
        }

        if preview {
            actions.push(stage.action().describe());
            return StageOutcome::WouldRun { actions };
        }

        tracing::info!("Running stage {}: {}", stage.id(), stage.action().describe());
        match stage.action().run().await {
            Ok(output) => {
                warnings.extend(output.warnings);
                StageOutcome::Succeeded
            }
            Err(err) => self.failed(stage, &err),
        }
    }

    #[allow(clippy::unused_self)]
    fn failed(&self, stage: &Stage, err: &dyn std::fmt::Display) -> StageOutcome {
        StageOutcome::Failed {
            message: err.to_string(),
            remediation: stage.remediation_hint(),
        }
    }
}
