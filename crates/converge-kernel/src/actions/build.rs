use super::{ActionOutput, StageAction};
use crate::error::StageResult;
use crate::process::run_command;
use async_trait::async_trait;
use converge_config::CommandSpec;

/// Run one external command
#[derive(Debug, Clone)]
pub struct CommandAction {
    command: CommandSpec,
}

impl CommandAction {
    /// Action running `command`
    #[must_use]
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl StageAction for CommandAction {
    async fn run(&self) -> StageResult<ActionOutput> {
        run_command(&self.command).await?;
        Ok(ActionOutput::done())
    }

    fn describe(&self) -> String {
        format!("run `{}`", self.command)
    }
}

/// One named build command
#[derive(Debug, Clone)]
pub struct CommandStep {
    /// Display name
    pub name: String,
    /// Command to run
    pub command: CommandSpec,
    /// Failure becomes a warning
    pub optional: bool,
}

/// Run build commands in order
///
/// A failing required step fails the stage immediately. A failing optional
/// step is reported as a warning and the remaining steps still run.
#[derive(Debug, Clone, Default)]
pub struct BuildArtifacts {
    steps: Vec<CommandStep>,
}

impl BuildArtifacts {
    /// Action over the given steps
    #[must_use]
    pub fn new(steps: Vec<CommandStep>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl StageAction for BuildArtifacts {
    async fn run(&self) -> StageResult<ActionOutput> {
        let mut output = ActionOutput::done();
        for step in &self.steps {
            tracing::info!("Building {}", step.name);
            match run_command(&step.command).await {
                Ok(_) => tracing::info!("Built {}", step.name),
                Err(err) if step.optional => {
                    output.warn(format!("optional build step {} failed: {err}", step.name));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        if self.steps.is_empty() {
            return "no build steps configured".to_string();
        }
        let names: Vec<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        format!("build {}", names.join(", "))
    }
}
