//! Configuration convergence before configuration-dependent stages
//!
//! Loads the template, applies every patch (saving after each mutation),
//! then asks the regeneration gate whether the derived artifact is stale
//! and, if so, runs the render step and checks that it refreshed the
//! artifact. A missing template is a warning because it may not have been
//! generated yet; a hand-edited value is a warning and the patch is skipped.

use crate::error::{StageError, StageResult};
use crate::process::run_command;
use async_trait::async_trait;
use converge_config::{
    BackupStore, ConfigDocument, ConfigError, Patch, PatchOutcome, PatchPreview, Patcher,
    RegenerationGate, RegenerationReason, CommandSpec,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

/// Produces the derived artifact from the template
#[async_trait]
pub trait RenderStep: Send + Sync {
    /// Regenerate the artifact
    async fn render(&self) -> StageResult<()>;

    /// Human readable description
    fn describe(&self) -> String;
}

/// Render by running an external command
#[derive(Debug, Clone)]
pub struct CommandRender {
    command: CommandSpec,
}

impl CommandRender {
    /// Render step running `command`
    #[must_use]
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl RenderStep for CommandRender {
    async fn render(&self) -> StageResult<()> {
        run_command(&self.command).await.map(|_| ())
    }

    fn describe(&self) -> String {
        format!("`{}`", self.command)
    }
}

/// What a convergence pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigReport {
    /// Tags of patches that mutated the template
    pub mutated: Vec<String>,
    /// Why the artifact was regenerated, if it was
    pub regenerated: Option<String>,
    /// Skipped patches and a missing template
    pub warnings: Vec<String>,
}

/// Patches the template and keeps the derived artifact current
pub struct ConfigConvergence {
    template: PathBuf,
    artifact: PathBuf,
    patches: Vec<Patch>,
    render: Option<Arc<dyn RenderStep>>,
    patcher: Mutex<Patcher>,
    gate: Mutex<RegenerationGate>,
}

impl std::fmt::Debug for ConfigConvergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigConvergence")
            .field("template", &self.template)
            .field("artifact", &self.artifact)
            .field("patches", &self.patches.len())
            .finish_non_exhaustive()
    }
}

impl ConfigConvergence {
    /// Convergence for one template and its artifact
    #[must_use]
    pub fn new(
        template: impl Into<PathBuf>,
        artifact: impl Into<PathBuf>,
        patches: Vec<Patch>,
        backups: BackupStore,
    ) -> Self {
        Self {
            template: template.into(),
            artifact: artifact.into(),
            patches,
            render: None,
            patcher: Mutex::new(Patcher::new(backups)),
            gate: Mutex::new(RegenerationGate::new()),
        }
    }

    /// Step that regenerates the artifact
    #[must_use]
    pub fn with_render(mut self, render: Arc<dyn RenderStep>) -> Self {
        self.render = Some(render);
        self
    }

    /// Apply patches and regenerate the artifact when it is stale
    ///
    /// # Errors
    /// Malformed or unreadable template, a backup or save failure, a failed
    /// render, or a render that left the artifact stale.
    pub async fn converge(&self) -> StageResult<ConfigReport> {
        let mut report = ConfigReport::default();
        let mut doc = match ConfigDocument::load(&self.template) {
            Ok(doc) => doc,
            Err(err @ ConfigError::SourceNotFound(_)) => {
                let warning = format!("{err}; configuration patches skipped");
                tracing::warn!("{}", warning);
                report.warnings.push(warning);
                return Ok(report);
            }
            Err(err) => return Err(err.into()),
        };

        for patch in &self.patches {
            let outcome = self.patcher.lock().apply_and_save(&mut doc, patch);
            match outcome {
                Ok(outcome) => {
                    if let PatchOutcome::Mutated { .. } = &outcome {
                        report.mutated.push(patch.tag().to_string());
                    }
                    self.gate.lock().record(&outcome);
                }
                Err(err @ (ConfigError::MutationConflict { .. } | ConfigError::UnsupportedLayout { .. })) => {
                    let warning = format!("{err}; patch {} skipped", patch.tag());
                    tracing::warn!("{}", warning);
                    report.warnings.push(warning);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let stale = self.gate.lock().check(&self.template, &self.artifact)?;
        let Some(reason) = stale else {
            return Ok(report);
        };
        let Some(render) = &self.render else {
            return Err(StageError::Unsatisfied(format!(
                "{} needs regeneration ({reason}) but no render step is configured",
                self.artifact.display()
            )));
        };

        tracing::info!("Regenerating {} ({})", self.artifact.display(), reason);
        render.render().await?;
        self.gate.lock().mark_rendered();

        let after = self.gate.lock().check(&self.template, &self.artifact)?;
        if let Some(still) = after {
            return Err(StageError::Unsatisfied(format!(
                "render step {} did not refresh {} ({still})",
                render.describe(),
                self.artifact.display()
            )));
        }
        report.regenerated = Some(reason.to_string());
        Ok(report)
    }

    /// Describe what [`ConfigConvergence::converge`] would change; writes nothing
    ///
    /// Patches that are already applied produce no line.
    ///
    /// # Errors
    /// Malformed or unreadable template.
    pub fn preview(&self) -> StageResult<Vec<String>> {
        let doc = match ConfigDocument::load(&self.template) {
            Ok(doc) => doc,
            Err(ConfigError::SourceNotFound(path)) => {
                return Ok(vec![format!("template {} not found; patches would be skipped", path.display())])
            }
            Err(err) => return Err(err.into()),
        };

        let patcher = self.patcher.lock();
        let mut lines = Vec::new();
        let mut would_mutate = false;
        for patch in &self.patches {
            let line = match patcher.preview(&doc, patch) {
                PatchPreview::AlreadyApplied => {
                    tracing::debug!("{}: already applied", patch.tag());
                    continue;
                }
                PatchPreview::WouldMutate { from: Some(from) } => {
                    would_mutate = true;
                    format!("{}: would change {} from {}", patch.tag(), patch.key(), yaml_inline(&from))
                }
                PatchPreview::WouldMutate { from: None } => {
                    would_mutate = true;
                    format!("{}: would insert {}", patch.tag(), patch.key())
                }
                PatchPreview::Conflict { found } => {
                    format!("{}: would skip, {} was edited by hand ({})", patch.tag(), patch.key(), yaml_inline(&found))
                }
                PatchPreview::Unsupported => {
                    format!("{}: would skip, {} cannot be edited in place", patch.tag(), patch.key())
                }
            };
            lines.push(line);
        }

        let stale = self.gate.lock().check(&self.template, &self.artifact)?;
        let reason = stale.or(would_mutate.then_some(RegenerationReason::PendingMutation));
        if let Some(reason) = reason {
            lines.push(format!("would regenerate {} ({reason})", self.artifact.display()));
        }
        Ok(lines)
    }
}

fn yaml_inline(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().replace('\n', " "))
            .unwrap_or_default(),
    }
}
