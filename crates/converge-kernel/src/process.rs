//! Child process helpers
//!
//! Every command is spawned with `kill_on_drop`, so cancelling the future
//! that awaits it (operator interrupt, timeout) also kills the process.

use crate::error::{StageError, StageResult};
use converge_config::CommandSpec;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured output of a successful command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
}

/// Run a command to completion, honouring its own timeout
///
/// # Errors
/// [`StageError::Spawn`], [`StageError::Timeout`] or [`StageError::CommandFailed`].
pub async fn run_command(spec: &CommandSpec) -> StageResult<CommandOutput> {
    run_command_with_timeout(spec, spec.timeout_duration()).await
}

/// Run a command, killing it after `timeout`
///
/// # Errors
/// [`StageError::Spawn`], [`StageError::Timeout`] or [`StageError::CommandFailed`].
pub async fn run_command_with_timeout(
    spec: &CommandSpec,
    timeout: Option<Duration>,
) -> StageResult<CommandOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    tracing::debug!("Running: {}", spec);
    let child = cmd.spawn().map_err(|e| StageError::Spawn {
        command: spec.to_string(),
        message: e.to_string(),
    })?;

    let waited = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| StageError::Timeout {
                what: format!("`{spec}`"),
                secs: limit.as_secs(),
            })?,
        None => child.wait_with_output().await,
    };
    let output = waited.map_err(|e| StageError::Spawn {
        command: spec.to_string(),
        message: e.to_string(),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if output.status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(StageError::CommandFailed {
            command: spec.to_string(),
            status: output.status.to_string(),
            stderr: tail_lines(&stderr, 20),
        })
    }
}

/// Locate an executable on `PATH`
#[must_use]
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|p| p.is_file())
}

fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    lines[lines.len().saturating_sub(max)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let spec = CommandSpec::new("sh").args(["-c", "echo converged"]);
        let output = run_command(&spec).await.unwrap();
        assert_eq!(output.stdout.trim(), "converged");
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_stderr() {
        let spec = CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = run_command(&spec).await.unwrap_err();
        match err {
            StageError::CommandFailed { stderr, .. } => assert_eq!(stderr, "broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_command() {
        let spec = CommandSpec::new("sleep").args(["5"]);
        let err = run_command_with_timeout(&spec, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let spec = CommandSpec::new("converge-no-such-program");
        assert!(matches!(run_command(&spec).await, Err(StageError::Spawn { .. })));
    }

    #[test]
    fn finds_shell_on_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("converge-no-such-program").is_none());
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
    }
}
