//! Stage definitions

use crate::actions::StageAction;
use crate::error::PlanError;
use crate::predicate::CompletionPredicate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Coarse provisioning stages, in run order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    /// Check the machine can be provisioned at all
    Validate,
    /// Install missing tools
    InstallPrerequisites,
    /// Clone source repositories
    AcquireRepositories,
    /// Start auxiliary services
    StartServices,
    /// Bring the database to a converged state
    ConvergeDatabase,
    /// Build the applications
    BuildArtifacts,
    /// Check everything is reachable
    Verify,
}

impl StageId {
    /// All stages in run order
    pub const ALL: [StageId; 7] = [
        Self::Validate,
        Self::InstallPrerequisites,
        Self::AcquireRepositories,
        Self::StartServices,
        Self::ConvergeDatabase,
        Self::BuildArtifacts,
        Self::Verify,
    ];

    /// Name accepted by `--resume-from`
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::InstallPrerequisites => "install-prerequisites",
            Self::AcquireRepositories => "acquire-repositories",
            Self::StartServices => "start-services",
            Self::ConvergeDatabase => "converge-database",
            Self::BuildArtifacts => "build-artifacts",
            Self::Verify => "verify",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageId {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|id| id.name() == wanted)
            .ok_or_else(|| PlanError::UnknownStageName {
                name: s.to_string(),
                expected: Self::ALL.map(StageId::name).join(", "),
            })
    }
}

/// An immutable stage definition
#[derive(Clone)]
pub struct Stage {
    id: StageId,
    deps: Vec<StageId>,
    predicate: Option<Arc<dyn CompletionPredicate>>,
    action: Arc<dyn StageAction>,
    remediation: Option<String>,
    needs_config: bool,
}

impl Stage {
    /// Stage with no dependencies and no completion predicate
    #[must_use]
    pub fn new(id: StageId, action: Arc<dyn StageAction>) -> Self {
        Self {
            id,
            deps: Vec::new(),
            predicate: None,
            action,
            remediation: None,
            needs_config: false,
        }
    }

    /// Stages that must have completed first
    #[must_use]
    pub fn depends_on(mut self, deps: impl IntoIterator<Item = StageId>) -> Self {
        self.deps.extend(deps);
        self
    }

    /// Predicate that detects the stage is already done
    #[must_use]
    pub fn completed_when(mut self, predicate: Arc<dyn CompletionPredicate>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Command suggested to the operator when the stage fails
    #[must_use]
    pub fn remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation = Some(hint.into());
        self
    }

    /// Converge configuration before this stage runs
    #[must_use]
    pub fn needs_config(mut self) -> Self {
        self.needs_config = true;
        self
    }

    /// Stage identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Dependencies
    #[inline]
    #[must_use]
    pub fn deps(&self) -> &[StageId] {
        &self.deps
    }

    /// Completion predicate
    #[inline]
    #[must_use]
    pub fn predicate(&self) -> Option<&Arc<dyn CompletionPredicate>> {
        self.predicate.as_ref()
    }

    /// Action
    #[inline]
    #[must_use]
    pub fn action(&self) -> &Arc<dyn StageAction> {
        &self.action
    }

    /// Remediation hint
    #[must_use]
    pub fn remediation_hint(&self) -> String {
        self.remediation
            .clone()
            .unwrap_or_else(|| format!("converge --resume-from {}", self.id))
    }

    /// Whether configuration is converged before this stage
    #[inline]
    #[must_use]
    pub fn requires_config(&self) -> bool {
        self.needs_config
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("deps", &self.deps)
            .field("predicate", &self.predicate.as_ref().map(|p| p.describe()))
            .field("action", &self.action.describe())
            .field("needs_config", &self.needs_config)
            .finish()
    }
}
