//! Stage actions
//!
//! An action does the work of one stage. Actions shell out or talk to the
//! database; the sequencer only sees this trait.

mod build;
mod database;
mod environment;
mod repositories;
mod services;

pub use build::{BuildArtifacts, CommandAction, CommandStep};
pub use database::ConvergeDatabase;
pub use environment::{InstallPrerequisites, Prerequisite, ValidateEnvironment, VerifyEnvironment};
pub use repositories::{CloneRepositories, Repository};
pub use services::{Service, StartServices};

use crate::error::StageResult;
use async_trait::async_trait;

/// Side notes produced by a successful action
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// Problems that did not fail the stage but must be shown to the operator
    pub warnings: Vec<String>,
}

impl ActionOutput {
    /// Output with no warnings
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Add a warning
    pub fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }
}

/// The work of one stage
#[async_trait]
pub trait StageAction: Send + Sync {
    /// Perform the stage
    async fn run(&self) -> StageResult<ActionOutput>;

    /// What [`StageAction::run`] would do, for preview output
    fn describe(&self) -> String;
}
