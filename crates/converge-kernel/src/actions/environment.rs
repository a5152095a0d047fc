use super::{ActionOutput, StageAction};
use crate::error::{StageError, StageResult};
use crate::predicate::{tcp_reachable, CompletionPredicate, DEFAULT_PROBE_TIMEOUT};
use crate::process::{find_in_path, run_command};
use async_trait::async_trait;
use converge_config::CommandSpec;
use std::path::PathBuf;
use std::sync::Arc;

/// A tool that must be on `PATH`
#[derive(Debug, Clone)]
pub struct Prerequisite {
    /// Display name
    pub name: String,
    /// Executable looked up on `PATH`
    pub command: String,
    /// Installs the tool when it is missing
    pub install: Option<CommandSpec>,
}

impl Prerequisite {
    fn is_present(&self) -> bool {
        find_in_path(&self.command).is_some()
    }
}

/// Check the machine can be provisioned and lay out the workspace
///
/// Missing tools with an install command are left to the install stage;
/// only tools nobody can install fail validation.
#[derive(Debug, Clone, Default)]
pub struct ValidateEnvironment {
    directories: Vec<PathBuf>,
    prerequisites: Vec<Prerequisite>,
    ports: Vec<(String, String, u16)>,
}

impl ValidateEnvironment {
    /// Validation with nothing to check
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directories that must exist and be writable; created when missing
    #[must_use]
    pub fn directories(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.directories.extend(dirs);
        self
    }

    /// Tools to look for
    #[must_use]
    pub fn prerequisites(mut self, prerequisites: Vec<Prerequisite>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    /// Service port reported when something already listens on it
    #[must_use]
    pub fn port(mut self, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        self.ports.push((name.into(), host.into(), port));
        self
    }
}

#[async_trait]
impl StageAction for ValidateEnvironment {
    async fn run(&self) -> StageResult<ActionOutput> {
        let mut output = ActionOutput::done();

        for dir in &self.directories {
            std::fs::create_dir_all(dir).map_err(|e| StageError::io(dir, e))?;
            tempfile::NamedTempFile::new_in(dir).map_err(|e| StageError::io(dir, e))?;
        }

        let mut uninstallable = Vec::new();
        for tool in &self.prerequisites {
            if tool.is_present() {
                tracing::debug!("Found {}", tool.command);
            } else if tool.install.is_some() {
                tracing::info!("{} is missing and will be installed", tool.name);
            } else {
                uninstallable.push(tool.name.clone());
            }
        }
        if !uninstallable.is_empty() {
            return Err(StageError::Missing(uninstallable));
        }

        for (name, host, port) in &self.ports {
            if tcp_reachable(host, *port, DEFAULT_PROBE_TIMEOUT).await {
                output.warn(format!(
                    "port {port} on {host} is already in use; assuming it is {name}"
                ));
            }
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        format!(
            "create {} directories, check {} tools and {} ports",
            self.directories.len(),
            self.prerequisites.len(),
            self.ports.len()
        )
    }
}

/// Install tools missing from `PATH`
#[derive(Debug, Clone, Default)]
pub struct InstallPrerequisites {
    prerequisites: Vec<Prerequisite>,
}

impl InstallPrerequisites {
    /// Action over the given tools
    #[must_use]
    pub fn new(prerequisites: Vec<Prerequisite>) -> Self {
        Self { prerequisites }
    }
}

#[async_trait]
impl StageAction for InstallPrerequisites {
    async fn run(&self) -> StageResult<ActionOutput> {
        let mut still_missing = Vec::new();
        for tool in self.prerequisites.iter().filter(|t| !t.is_present()) {
            let Some(install) = &tool.install else {
                still_missing.push(tool.name.clone());
                continue;
            };
            tracing::info!("Installing {}", tool.name);
            run_command(install).await?;
            if !tool.is_present() {
                still_missing.push(format!("{} (install ran but `{}` is not on PATH)", tool.name, tool.command));
            }
        }
        if still_missing.is_empty() {
            Ok(ActionOutput::done())
        } else {
            Err(StageError::Missing(still_missing))
        }
    }

    fn describe(&self) -> String {
        let missing: Vec<&str> = self
            .prerequisites
            .iter()
            .filter(|t| !t.is_present())
            .map(|t| t.name.as_str())
            .collect();
        if missing.is_empty() {
            "nothing to install".to_string()
        } else {
            format!("install {}", missing.join(", "))
        }
    }
}

/// Evaluate every check concurrently; fail listing the ones that do not hold
pub struct VerifyEnvironment {
    checks: Vec<Arc<dyn CompletionPredicate>>,
}

impl VerifyEnvironment {
    /// Action over the given checks
    #[must_use]
    pub fn new(checks: Vec<Arc<dyn CompletionPredicate>>) -> Self {
        Self { checks }
    }
}

#[async_trait]
impl StageAction for VerifyEnvironment {
    async fn run(&self) -> StageResult<ActionOutput> {
        let results = futures::future::join_all(self.checks.iter().map(|c| c.is_satisfied())).await;
        let failed: Vec<String> = self
            .checks
            .iter()
            .zip(results)
            .filter(|(_, ok)| !ok)
            .map(|(check, _)| check.describe())
            .collect();
        if failed.is_empty() {
            Ok(ActionOutput::done())
        } else {
            Err(StageError::Unsatisfied(format!("verification failed: {}", failed.join("; "))))
        }
    }

    fn describe(&self) -> String {
        format!("verify {} checks", self.checks.len())
    }
}
