use super::{ActionOutput, StageAction};
use crate::error::{StageError, StageResult};
use crate::process::run_command_with_timeout;
use async_trait::async_trait;
use converge_config::CommandSpec;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A repository to clone
#[derive(Debug, Clone)]
pub struct Repository {
    /// Display name
    pub name: String,
    /// Clone URL
    pub url: String,
    /// Checkout location
    pub path: PathBuf,
    /// Branch to check out
    pub branch: Option<String>,
    /// Clone timeout
    pub timeout: Duration,
    /// Initialize submodules after cloning
    pub submodules: bool,
}

impl Repository {
    fn is_cloned(&self) -> bool {
        self.path.join(".git").exists()
    }
}

/// Clone repositories that are not checked out yet
///
/// Each clone goes into a temporary sibling directory and is renamed into
/// place only when it completed, so a timeout or interrupt never leaves a
/// half-cloned checkout at the final path.
#[derive(Debug, Clone, Default)]
pub struct CloneRepositories {
    git: String,
    repositories: Vec<Repository>,
}

impl CloneRepositories {
    /// Action over the given repositories using `git` from `PATH`
    #[must_use]
    pub fn new(repositories: Vec<Repository>) -> Self {
        Self {
            git: "git".to_string(),
            repositories,
        }
    }

    /// Use another git executable
    #[must_use]
    pub fn with_git(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    async fn clone_one(&self, repo: &Repository, output: &mut ActionOutput) -> StageResult<()> {
        if repo.path.exists() && !is_empty_dir(&repo.path) {
            return Err(StageError::Unsatisfied(format!(
                "{} exists but is not a git checkout; move it aside and retry",
                repo.path.display()
            )));
        }
        let parent = repo
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| StageError::io(parent, e))?;

        let staging = tempfile::Builder::new()
            .prefix(".converge-clone-")
            .tempdir_in(parent)
            .map_err(|e| StageError::io(parent, e))?;
        let staged = staging.path().join(&repo.name);

        let mut clone = CommandSpec::new(&self.git).args(["clone", "--progress"]);
        if let Some(branch) = &repo.branch {
            clone = clone.args(["--branch", branch.as_str()]);
        }
        clone = clone.args([repo.url.clone(), staged.display().to_string()]);

        tracing::info!("Cloning {} into {}", repo.name, repo.path.display());
        run_command_with_timeout(&clone, Some(repo.timeout))
            .await
            .map_err(|err| match err {
                StageError::Timeout { secs, .. } => StageError::Timeout {
                    what: format!("clone of {}", repo.name),
                    secs,
                },
                other => other,
            })?;

        if repo.path.exists() {
            std::fs::remove_dir(&repo.path).map_err(|e| StageError::io(&repo.path, e))?;
        }
        std::fs::rename(&staged, &repo.path).map_err(|e| StageError::io(&repo.path, e))?;

        if repo.submodules {
            let update = CommandSpec::new(&self.git)
                .args(["submodule", "update", "--init", "--recursive"])
                .cwd(&repo.path);
            if let Err(err) = run_command_with_timeout(&update, Some(repo.timeout)).await {
                output.warn(format!("submodules of {} were not initialized: {err}", repo.name));
            }
        }
        Ok(())
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}

#[async_trait]
impl StageAction for CloneRepositories {
    async fn run(&self) -> StageResult<ActionOutput> {
        let mut output = ActionOutput::done();
        for repo in &self.repositories {
            if repo.is_cloned() {
                tracing::debug!("{} already cloned at {}", repo.name, repo.path.display());
                continue;
            }
            self.clone_one(repo, &mut output).await?;
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        let pending: Vec<&str> = self
            .repositories
            .iter()
            .filter(|r| !r.is_cloned())
            .map(|r| r.name.as_str())
            .collect();
        if pending.is_empty() {
            "all repositories present".to_string()
        } else {
            format!("clone {}", pending.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(dir: &Path, name: &str, url: &str) -> Repository {
        Repository {
            name: name.to_string(),
            url: url.to_string(),
            path: dir.join(name),
            branch: None,
            timeout: Duration::from_secs(30),
            submodules: false,
        }
    }

    #[tokio::test]
    async fn existing_checkouts_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let r = repo(dir.path(), "enterprise", "https://invalid.example/enterprise.git");
        std::fs::create_dir_all(r.path.join(".git")).unwrap();
        let action = CloneRepositories::new(vec![r]).with_git("false");
        assert!(action.run().await.is_ok());
        assert_eq!(action.describe(), "all repositories present");
    }

    #[tokio::test]
    async fn failed_clone_leaves_no_partial_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let r = repo(dir.path(), "console-ui", "https://invalid.example/console-ui.git");
        let action = CloneRepositories::new(vec![r.clone()]).with_git("false");
        assert!(action.run().await.is_err());
        assert!(!r.path.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn non_git_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let r = repo(dir.path(), "enterprise", "https://invalid.example/enterprise.git");
        std::fs::create_dir_all(&r.path).unwrap();
        std::fs::write(r.path.join("README"), "hand made").unwrap();
        let err = CloneRepositories::new(vec![r]).run().await.unwrap_err();
        assert!(err.to_string().contains("not a git checkout"));
    }

    #[tokio::test]
    async fn clones_from_local_repository() {
        if crate::process::find_in_path("git").is_none() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        let init = CommandSpec::new("git").args(["init", "--quiet"]).cwd(&origin);
        crate::process::run_command(&init).await.unwrap();

        let r = repo(&dir.path().join("work"), "enterprise", &origin.display().to_string());
        CloneRepositories::new(vec![r.clone()]).run().await.unwrap();
        assert!(r.path.join(".git").exists());
    }
}
