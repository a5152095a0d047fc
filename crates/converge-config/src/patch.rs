//! Managed patches over a [`ConfigDocument`]
//!
//! A [`Patch`] names one managed key, the value it should hold and how to
//! tell that it already does. [`Patcher::apply`] checks that first and only
//! touches the filesystem for a real mutation, writing the backup before the
//! document changes.

use crate::backup::BackupStore;
use crate::document::{ConfigDocument, KeyPath};
use crate::error::{ConfigError, ConfigResult};
use regex::Regex;
use serde_yaml::Value;
use std::path::PathBuf;

/// Key prefixes the patcher may mutate unless settings extend them
pub const DEFAULT_MANAGED_KEYS: &[&str] = &[
    "datasource.pool",
    "cache.timeout",
    "management.health.enabled",
    "elasticsearch_index_modifier",
    "elasticsearch_host",
    "redis",
];

/// Documented set of keys that patches are allowed to touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedKeys(Vec<KeyPath>);

impl ManagedKeys {
    /// Build from explicit prefixes
    #[must_use]
    pub fn new(prefixes: impl IntoIterator<Item = KeyPath>) -> Self {
        Self(prefixes.into_iter().collect())
    }

    /// Add more prefixes
    #[must_use]
    pub fn with(mut self, prefixes: impl IntoIterator<Item = KeyPath>) -> Self {
        self.0.extend(prefixes);
        self
    }

    /// Whether `key` is one of the managed prefixes or lies beneath one
    #[must_use]
    pub fn permits(&self, key: &KeyPath) -> bool {
        self.0.iter().any(|prefix| key.starts_with(prefix))
    }
}

impl Default for ManagedKeys {
    fn default() -> Self {
        Self::new(DEFAULT_MANAGED_KEYS.iter().filter_map(|k| KeyPath::parse(k).ok()))
    }
}

/// One named mutation of a managed key
#[derive(Debug, Clone)]
pub struct Patch {
    tag: String,
    key: KeyPath,
    value: Value,
    marker: Option<Regex>,
    template_defaults: Vec<Value>,
}

impl Patch {
    /// Create a patch setting `key` to `value`
    ///
    /// # Errors
    /// [`ConfigError::InvalidKeyPath`] for a bad path, [`ConfigError::UnmanagedKey`]
    /// when the key is outside `managed`.
    pub fn new(
        tag: impl Into<String>,
        key: &str,
        value: impl Into<Value>,
        managed: &ManagedKeys,
    ) -> ConfigResult<Self> {
        let key = KeyPath::parse(key)?;
        if !managed.permits(&key) {
            return Err(ConfigError::UnmanagedKey(key.to_string()));
        }
        Ok(Self {
            tag: tag.into(),
            key,
            value: value.into(),
            marker: None,
            template_defaults: Vec::new(),
        })
    }

    /// Also treat the patch as applied when `pattern` matches the document text
    ///
    /// # Errors
    /// [`ConfigError::Serialize`] if the pattern is not a valid regex.
    pub fn with_marker(mut self, pattern: &str) -> ConfigResult<Self> {
        let marker = Regex::new(pattern)
            .map_err(|e| ConfigError::Serialize(format!("invalid marker for {}: {e}", self.tag)))?;
        self.marker = Some(marker);
        Ok(self)
    }

    /// Values the template ships with; any other existing value is a hand edit
    #[must_use]
    pub fn with_template_defaults(mut self, defaults: Vec<Value>) -> Self {
        self.template_defaults = defaults;
        self
    }

    /// Fix tag used in backup names and logs
    #[inline]
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Target key
    #[inline]
    #[must_use]
    pub fn key(&self) -> &KeyPath {
        &self.key
    }

    /// Desired value
    #[inline]
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Idempotency predicate: the key already holds the desired value, or the marker matches
    #[must_use]
    pub fn is_applied(&self, doc: &ConfigDocument) -> bool {
        doc.get(&self.key) == Some(&self.value)
            || self.marker.as_ref().is_some_and(|m| m.is_match(doc.text()))
    }

    fn conflict(&self, doc: &ConfigDocument) -> Option<ConfigError> {
        if self.template_defaults.is_empty() {
            return None;
        }
        let found = doc.get(&self.key)?;
        if self.template_defaults.contains(found) {
            return None;
        }
        Some(ConfigError::MutationConflict {
            path: doc.path().to_path_buf(),
            key: self.key.to_string(),
            found: display_value(found),
            desired: display_value(&self.value),
        })
    }
}

/// Result of applying a patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Document changed; the pre-mutation bytes are in `backup`
    Mutated {
        /// Backup written before the change
        backup: PathBuf,
    },
    /// Predicate already held; nothing was read or written
    AlreadyApplied,
}

impl PatchOutcome {
    /// Whether the document changed
    #[inline]
    #[must_use]
    pub fn is_mutated(&self) -> bool {
        matches!(self, Self::Mutated { .. })
    }
}

/// What [`Patcher::apply`] would do, without doing it
#[derive(Debug, Clone, PartialEq)]
pub enum PatchPreview {
    /// Would set the key, replacing `from` when it exists
    WouldMutate {
        /// Current value, if any
        from: Option<Value>,
    },
    /// Nothing to do
    AlreadyApplied,
    /// Would warn and skip over a hand-edited value
    Conflict {
        /// Current hand-edited value
        found: Value,
    },
    /// Would warn and skip because the key cannot be edited in place
    Unsupported,
}

/// Applies patches, writing a backup before every mutation
#[derive(Debug, Clone, Default)]
pub struct Patcher {
    backups: BackupStore,
}

impl Patcher {
    /// Create a patcher writing backups through `backups`
    #[inline]
    #[must_use]
    pub fn new(backups: BackupStore) -> Self {
        Self { backups }
    }

    /// Backup store used by this patcher
    #[inline]
    #[must_use]
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Apply `patch` to the in-memory document
    ///
    /// The caller saves the document. The backup holds the document text as
    /// it was immediately before this mutation.
    ///
    /// # Errors
    /// [`ConfigError::MutationConflict`] when the key was edited by hand,
    /// [`ConfigError::PathBlocked`] when the key cannot exist in this document,
    /// [`ConfigError::UnsupportedLayout`] when the key cannot be edited in place,
    /// [`ConfigError::Io`] when the backup cannot be written.
    pub fn apply(&mut self, doc: &mut ConfigDocument, patch: &Patch) -> ConfigResult<PatchOutcome> {
        if patch.is_applied(doc) {
            tracing::debug!(tag = %patch.tag, key = %patch.key, "patch already applied");
            return Ok(PatchOutcome::AlreadyApplied);
        }
        if let Some(conflict) = patch.conflict(doc) {
            return Err(conflict);
        }

        let mut next = doc.clone();
        next.set(&patch.key, patch.value.clone())?;
        let backup = self.backups.write(doc.path(), &patch.tag, doc.text().as_bytes())?;
        *doc = next;

        tracing::info!(
            tag = %patch.tag,
            key = %patch.key,
            value = %display_value(&patch.value),
            backup = %backup.display(),
            "patched configuration"
        );
        Ok(PatchOutcome::Mutated { backup })
    }

    /// Apply `patch` and save the document when it changed
    ///
    /// # Errors
    /// Same as [`Patcher::apply`], plus [`ConfigError::Io`] from the save.
    pub fn apply_and_save(
        &mut self,
        doc: &mut ConfigDocument,
        patch: &Patch,
    ) -> ConfigResult<PatchOutcome> {
        let outcome = self.apply(doc, patch)?;
        if outcome.is_mutated() {
            doc.save()?;
        }
        Ok(outcome)
    }

    /// Predict the outcome of [`Patcher::apply`] without writing anything
    #[must_use]
    pub fn preview(&self, doc: &ConfigDocument, patch: &Patch) -> PatchPreview {
        if patch.is_applied(doc) {
            return PatchPreview::AlreadyApplied;
        }
        if patch.conflict(doc).is_some() {
            if let Some(found) = doc.get(&patch.key) {
                return PatchPreview::Conflict {
                    found: found.clone(),
                };
            }
        }
        let mut trial = doc.clone();
        if let Err(ConfigError::UnsupportedLayout { .. }) = trial.set(&patch.key, patch.value.clone()) {
            return PatchPreview::Unsupported;
        }
        PatchPreview::WouldMutate {
            from: doc.get(&patch.key).cloned(),
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(dir: &tempfile::TempDir, text: &str) -> ConfigDocument {
        let path = dir.path().join("local.values.yml");
        std::fs::write(&path, text).unwrap();
        ConfigDocument::load(&path).unwrap()
    }

    #[test]
    fn unmanaged_key_is_rejected() {
        let err = Patch::new("port", "server.port", 9090, &ManagedKeys::default()).unwrap_err();
        assert!(matches!(err, ConfigError::UnmanagedKey(_)));
    }

    #[test]
    fn nested_managed_key_is_accepted() {
        let patch = Patch::new("pool", "datasource.pool.max_size", 20, &ManagedKeys::default());
        assert!(patch.is_ok());
    }

    #[test]
    fn second_apply_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = load(&dir, "cache:\n  timeout: 30\n");
        let patch = Patch::new("cache-timeout", "cache.timeout", 60, &ManagedKeys::default()).unwrap();
        let mut patcher = Patcher::new(BackupStore::in_dir(dir.path().join("backups")));

        assert!(patcher.apply_and_save(&mut doc, &patch).unwrap().is_mutated());
        let after_first = std::fs::read_to_string(doc.path()).unwrap();
        assert_eq!(
            patcher.apply_and_save(&mut doc, &patch).unwrap(),
            PatchOutcome::AlreadyApplied
        );
        assert_eq!(std::fs::read_to_string(doc.path()).unwrap(), after_first);
        assert_eq!(patcher.backups().list(doc.path()).unwrap().len(), 1);
    }

    #[test]
    fn backup_holds_pre_mutation_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = load(&dir, "cache:\n  timeout: 30 # seconds\n");
        let patch = Patch::new("cache-timeout", "cache.timeout", 60, &ManagedKeys::default()).unwrap();
        let mut patcher = Patcher::default();
        let PatchOutcome::Mutated { backup } = patcher.apply(&mut doc, &patch).unwrap() else {
            panic!("expected mutation");
        };
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "cache:\n  timeout: 30 # seconds\n");
        assert_eq!(doc.text(), "cache:\n  timeout: 60 # seconds\n");
    }

    #[test]
    fn hand_edited_value_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = load(&dir, "cache:\n  timeout: 45\n");
        let patch = Patch::new("cache-timeout", "cache.timeout", 60, &ManagedKeys::default())
            .unwrap()
            .with_template_defaults(vec![Value::from(30)]);
        let mut patcher = Patcher::new(BackupStore::in_dir(dir.path().join("backups")));

        let err = patcher.apply(&mut doc, &patch).unwrap_err();
        assert!(err.is_skippable());
        assert!(matches!(err, ConfigError::MutationConflict { .. }));
        assert_eq!(doc.text(), "cache:\n  timeout: 45\n");
        assert!(patcher.backups().list(doc.path()).unwrap().is_empty());
    }

    #[test]
    fn flow_layout_is_skipped_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let original = "# local overrides\ncache: {size: 1}\nother: 'x'\n";
        let mut doc = load(&dir, original);
        let patch = Patch::new("cache-timeout", "cache.timeout", 60, &ManagedKeys::default()).unwrap();
        let mut patcher = Patcher::new(BackupStore::in_dir(dir.path().join("backups")));

        assert_eq!(patcher.preview(&doc, &patch), PatchPreview::Unsupported);
        let err = patcher.apply_and_save(&mut doc, &patch).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedLayout { .. }));
        assert_eq!(doc.text(), original);
        assert_eq!(std::fs::read_to_string(doc.path()).unwrap(), original);
        assert!(patcher.backups().list(doc.path()).unwrap().is_empty());
    }

    #[test]
    fn template_default_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = load(&dir, "cache:\n  timeout: 30\n");
        let patch = Patch::new("cache-timeout", "cache.timeout", 60, &ManagedKeys::default())
            .unwrap()
            .with_template_defaults(vec![Value::from(30)]);
        assert!(Patcher::default().apply(&mut doc, &patch).unwrap().is_mutated());
    }

    #[test]
    fn marker_counts_as_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut doc = load(&dir, "redis:\n  master:\n    host: localhost\n");
        let patch = Patch::new("redis", "redis.master.port", 6379, &ManagedKeys::default())
            .unwrap()
            .with_marker(r"(?m)^\s+host: localhost$")
            .unwrap();
        assert_eq!(
            Patcher::default().apply(&mut doc, &patch).unwrap(),
            PatchOutcome::AlreadyApplied
        );
    }

    #[test]
    fn preview_reports_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let doc = load(&dir, "cache:\n  timeout: 30\n");
        let patch = Patch::new("cache-timeout", "cache.timeout", 60, &ManagedKeys::default()).unwrap();
        let patcher = Patcher::new(BackupStore::in_dir(dir.path().join("backups")));
        assert_eq!(
            patcher.preview(&doc, &patch),
            PatchPreview::WouldMutate {
                from: Some(Value::from(30))
            }
        );
        assert!(!dir.path().join("backups").exists());
    }
}
