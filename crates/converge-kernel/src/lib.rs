//! Converge Kernel
//!
//! Orders the provisioning stages (validate → install prerequisites →
//! acquire repositories → start services → converge database → build →
//! verify) and runs them so that the whole sequence can be repeated safely:
//!
//! 1. **Predicates** detect stages that are already done by looking at the
//!    machine, never at a progress file.
//! 2. **Actions** do the work and report non-fatal warnings.
//! 3. **The sequencer** records one result per stage, halts on failure
//!    unless told to continue, and can resume from any stage or preview a
//!    run without touching anything.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use converge_kernel::prelude::*;
//!
//! let plan = StagePlan::builder()
//!     .stage(Stage::new(StageId::Validate, Arc::new(ValidateEnvironment::new())))
//!     .stage(
//!         Stage::new(StageId::StartServices, Arc::new(StartServices::new(services)))
//!             .depends_on([StageId::Validate])
//!             .completed_when(Arc::new(TcpReachable::new("localhost", 9200))),
//!     )
//!     .build()?;
//!
//! let report = Sequencer::new(plan).run().await?;
//! ```

pub mod actions;
pub mod config;
pub mod error;
pub mod plan;
pub mod predicate;
pub mod process;
pub mod report;
pub mod sequencer;
pub mod stage;

pub use actions::{ActionOutput, StageAction};
pub use config::{CommandRender, ConfigConvergence, ConfigReport, RenderStep};
pub use error::{PlanError, StageError, StageResult};
pub use plan::{StagePlan, StagePlanBuilder};
pub use predicate::CompletionPredicate;
pub use report::{RunMode, RunReport, StageOutcome, StageRecord};
pub use sequencer::{Sequencer, SequencerOptions};
pub use stage::{Stage, StageId};

/// Re-exports for building and running plans
pub mod prelude {
    pub use crate::actions::{
        ActionOutput, BuildArtifacts, CloneRepositories, CommandAction, ConvergeDatabase,
        InstallPrerequisites, StageAction, StartServices, ValidateEnvironment, VerifyEnvironment,
    };
    pub use crate::config::{CommandRender, ConfigConvergence};
    pub use crate::error::{PlanError, StageError};
    pub use crate::predicate::{
        AllOf, CommandsAvailable, CompletionPredicate, DatabaseConverged, DatabaseReachable,
        HttpReachable, PathExists, TcpReachable,
    };
    pub use crate::report::{RunReport, StageOutcome};
    pub use crate::sequencer::{Sequencer, SequencerOptions};
    pub use crate::stage::{Stage, StageId};
    pub use crate::plan::StagePlan;
    pub use std::sync::Arc;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
