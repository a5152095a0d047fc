//! Artifact regeneration gate
//!
//! Decides whether the derived artifact (rendered from the template by an
//! external step) is stale. The gate never renders anything itself.

use crate::error::{ConfigError, ConfigResult};
use crate::patch::PatchOutcome;
use std::fmt;
use std::path::Path;
use std::time::SystemTime;

/// Why the derived artifact must be regenerated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerationReason {
    /// Artifact does not exist
    ArtifactMissing,
    /// Template was modified after the artifact was rendered
    SourceNewer,
    /// A patch mutated the template since the last render
    PendingMutation,
}

impl fmt::Display for RegenerationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ArtifactMissing => "artifact missing",
            Self::SourceNewer => "template newer than artifact",
            Self::PendingMutation => "template patched since last render",
        };
        f.write_str(text)
    }
}

/// Tracks patch outcomes and compares modification times
#[derive(Debug, Clone, Default)]
pub struct RegenerationGate {
    pending_mutation: bool,
}

impl RegenerationGate {
    /// Create a gate with no recorded mutation
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a patch
    pub fn record(&mut self, outcome: &PatchOutcome) {
        if outcome.is_mutated() {
            self.pending_mutation = true;
        }
    }

    /// Clear the pending mutation after the render step succeeded
    pub fn mark_rendered(&mut self) {
        self.pending_mutation = false;
    }

    /// Whether a mutation is waiting for a render
    #[inline]
    #[must_use]
    pub fn has_pending_mutation(&self) -> bool {
        self.pending_mutation
    }

    /// Reason the artifact is stale, or `None` when it is current
    ///
    /// # Errors
    /// [`ConfigError::SourceNotFound`] when the template is missing,
    /// [`ConfigError::Io`] when metadata cannot be read.
    pub fn check(&self, source: &Path, artifact: &Path) -> ConfigResult<Option<RegenerationReason>> {
        let source_mtime = match modified(source)? {
            Some(mtime) => mtime,
            None => return Err(ConfigError::SourceNotFound(source.to_path_buf())),
        };
        let Some(artifact_mtime) = modified(artifact)? else {
            return Ok(Some(RegenerationReason::ArtifactMissing));
        };
        if source_mtime > artifact_mtime {
            return Ok(Some(RegenerationReason::SourceNewer));
        }
        if self.pending_mutation {
            return Ok(Some(RegenerationReason::PendingMutation));
        }
        Ok(None)
    }

    /// Whether the artifact must be regenerated
    ///
    /// # Errors
    /// See [`RegenerationGate::check`].
    pub fn needs_regeneration(&self, source: &Path, artifact: &Path) -> ConfigResult<bool> {
        Ok(self.check(source, artifact)?.is_some())
    }
}

fn modified(path: &Path) -> ConfigResult<Option<SystemTime>> {
    match std::fs::metadata(path) {
        Ok(meta) => meta.modified().map(Some).map_err(|e| ConfigError::io(path, e)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ConfigError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn touch(path: &Path, at: SystemTime) {
        std::fs::write(path, "x: 1\n").unwrap();
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(at)
            .unwrap();
    }

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("local.values.yml");
        let artifact = dir.path().join("application.yml");
        (dir, source, artifact)
    }

    #[test]
    fn missing_artifact_needs_regeneration() {
        let (_dir, source, artifact) = fixture();
        touch(&source, SystemTime::now());
        let gate = RegenerationGate::new();
        assert_eq!(
            gate.check(&source, &artifact).unwrap(),
            Some(RegenerationReason::ArtifactMissing)
        );
    }

    #[test]
    fn newer_source_needs_regeneration() {
        let (_dir, source, artifact) = fixture();
        let now = SystemTime::now();
        touch(&artifact, now - Duration::from_secs(60));
        touch(&source, now);
        assert!(RegenerationGate::new().needs_regeneration(&source, &artifact).unwrap());
    }

    #[test]
    fn current_artifact_is_left_alone() {
        let (_dir, source, artifact) = fixture();
        let now = SystemTime::now();
        touch(&source, now - Duration::from_secs(60));
        touch(&artifact, now);
        assert!(!RegenerationGate::new().needs_regeneration(&source, &artifact).unwrap());
    }

    #[test]
    fn mutation_forces_regeneration_until_rendered() {
        let (_dir, source, artifact) = fixture();
        let now = SystemTime::now();
        touch(&source, now - Duration::from_secs(60));
        touch(&artifact, now);

        let mut gate = RegenerationGate::new();
        gate.record(&PatchOutcome::Mutated {
            backup: PathBuf::from("local.values.yml.fix.bak"),
        });
        assert_eq!(
            gate.check(&source, &artifact).unwrap(),
            Some(RegenerationReason::PendingMutation)
        );
        gate.mark_rendered();
        assert!(!gate.needs_regeneration(&source, &artifact).unwrap());

        gate.record(&PatchOutcome::AlreadyApplied);
        assert!(!gate.needs_regeneration(&source, &artifact).unwrap());
    }

    #[test]
    fn missing_source_is_an_error() {
        let (_dir, source, artifact) = fixture();
        let err = RegenerationGate::new().check(&source, &artifact).unwrap_err();
        assert!(matches!(err, ConfigError::SourceNotFound(_)));
    }
}
