//! Error types for configuration convergence
//!
//! Covers:
//! - Reading and parsing the templated document (ingress)
//! - Applying managed patches (mutation)
//! - Writing backups and the patched document (egress)
//! - Loading operator settings

use std::path::PathBuf;

/// Errors raised while reading, patching or writing a configuration document
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Template file does not exist; callers treat this as a skippable warning
    #[error("configuration source not found: {0}")]
    SourceNotFound(PathBuf),

    /// Document could not be parsed; never swallowed
    #[error("malformed document {path}: {message}")]
    MalformedDocument { path: PathBuf, message: String },

    /// IO error while reading or writing
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The key currently holds a hand-edited value that the patch must not overwrite
    #[error("refusing to overwrite {key} in {path}: found {found}, patch wants {desired}")]
    MutationConflict {
        path: PathBuf,
        key: String,
        found: String,
        desired: String,
    },

    /// Patch targets a key outside the managed set
    #[error("key is not managed: {0}")]
    UnmanagedKey(String),

    /// Key path text is empty or has an empty segment
    #[error("invalid key path: '{0}'")]
    InvalidKeyPath(String),

    /// An ancestor of the target key holds a scalar or sequence
    #[error("cannot set {key}: ancestor {ancestor} is not a mapping")]
    PathBlocked { key: String, ancestor: String },

    /// The key sits in a layout that cannot be edited without rewriting the file
    #[error("cannot edit {key} in {path} in place (flow collection, anchor or block scalar)")]
    UnsupportedLayout { path: PathBuf, key: String },

    /// Value could not be rendered back to YAML
    #[error("serialization failed: {0}")]
    Serialize(String),
}

impl ConfigError {
    /// Create IO error for path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create malformed document error for path
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MalformedDocument {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may log this error and continue with the next stage
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::SourceNotFound(_) | Self::MutationConflict { .. } | Self::UnsupportedLayout { .. }
        )
    }
}

/// Errors raised while loading operator settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Settings file could not be read
    #[error("io error reading settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Settings file is not valid YAML or does not match the expected shape
    #[error("invalid settings: {0}")]
    Parse(String),

    /// A `${...}` reference names a key that does not exist
    #[error("unresolved reference ${{{0}}}")]
    UnresolvedReference(String),

    /// References did not reach a fixed point within the pass limit
    #[error("reference resolution did not settle after {0} passes")]
    ReferenceCycle(usize),

    /// A required value is missing or inconsistent
    #[error("settings validation failed: {0}")]
    Validation(String),
}

/// Result alias for document operations
pub type ConfigResult<T> = Result<T, ConfigError>;
