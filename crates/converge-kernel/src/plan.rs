//! Validated, ordered stage plans

use crate::error::PlanError;
use crate::stage::{Stage, StageId};

/// Ordered list of stages whose dependencies all come earlier
#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    /// Start building a plan
    #[must_use]
    pub fn builder() -> StagePlanBuilder {
        StagePlanBuilder::default()
    }

    /// Stages in run order
    #[inline]
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Position of a stage
    #[must_use]
    pub fn position(&self, id: StageId) -> Option<usize> {
        self.stages.iter().position(|s| s.id() == id)
    }

    /// Stage by id
    #[must_use]
    pub fn get(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id() == id)
    }

    /// Number of stages
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the plan has no stages
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Builder for [`StagePlan`]
///
/// ```rust,ignore
/// let plan = StagePlan::builder()
///     .stage(Stage::new(StageId::Validate, validate))
///     .stage(Stage::new(StageId::StartServices, services).depends_on([StageId::Validate]))
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct StagePlanBuilder {
    stages: Vec<Stage>,
}

impl StagePlanBuilder {
    /// Append a stage
    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Validate and produce the plan
    ///
    /// # Errors
    /// [`PlanError`] for duplicate stages, unknown dependencies, or a
    /// dependency placed after its dependent.
    pub fn build(self) -> Result<StagePlan, PlanError> {
        for (index, stage) in self.stages.iter().enumerate() {
            if self.stages[..index].iter().any(|s| s.id() == stage.id()) {
                return Err(PlanError::DuplicateStage(stage.id()));
            }
            for &dependency in stage.deps() {
                match self.stages.iter().position(|s| s.id() == dependency) {
                    None => {
                        return Err(PlanError::UnknownDependency {
                            stage: stage.id(),
                            dependency,
                        })
                    }
                    Some(at) if at >= index => {
                        return Err(PlanError::DependencyOrder {
                            stage: stage.id(),
                            dependency,
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(StagePlan {
            stages: self.stages,
        })
    }
}
