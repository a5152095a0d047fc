//! Timestamped backups of pre-mutation documents
//!
//! Backup names follow `<file name>.<fix tag>.<timestamp>.bak`. Timestamps are
//! fixed-width UTC with microsecond precision and strictly increase for one
//! store, so sorting by timestamp recovers mutation order.

use crate::document::write_atomic;
use crate::error::{ConfigError, ConfigResult};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";
const SUFFIX: &str = "bak";

/// Writes and lists backups for patched documents
#[derive(Debug, Clone, Default)]
pub struct BackupStore {
    dir: Option<PathBuf>,
    last_stamp: Option<DateTime<Utc>>,
}

impl BackupStore {
    /// Keep backups next to the document they protect
    #[inline]
    #[must_use]
    pub fn alongside() -> Self {
        Self::default()
    }

    /// Keep backups in a dedicated directory
    #[inline]
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            last_stamp: None,
        }
    }

    /// Write `bytes` as a new backup of `source` tagged with `tag`
    ///
    /// # Errors
    /// [`ConfigError::Io`] when the backup directory or file cannot be written.
    pub fn write(&mut self, source: &Path, tag: &str, bytes: &[u8]) -> ConfigResult<PathBuf> {
        let dir = self.dir_for(source);
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::io(&dir, e))?;

        let file_name = file_name(source);
        let tag = sanitize_tag(tag);
        let mut stamp = self.next_stamp();
        let mut target = dir.join(backup_name(&file_name, &tag, stamp));
        while target.exists() {
            stamp += Duration::microseconds(1);
            target = dir.join(backup_name(&file_name, &tag, stamp));
        }

        write_atomic(&target, bytes)?;
        self.last_stamp = Some(stamp);
        tracing::debug!(backup = %target.display(), "wrote backup");
        Ok(target)
    }

    /// All backups of `source`, oldest first
    ///
    /// # Errors
    /// [`ConfigError::Io`] when the backup directory exists but cannot be read.
    pub fn list(&self, source: &Path) -> ConfigResult<Vec<PathBuf>> {
        let dir = self.dir_for(source);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(ConfigError::io(&dir, err)),
        };

        let prefix = format!("{}.", file_name(source));
        let mut found: Vec<(NaiveDateTime, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let rest = name.strip_prefix(&prefix)?;
                let rest = rest.strip_suffix(&format!(".{SUFFIX}"))?;
                let (_, stamp) = rest.rsplit_once('.')?;
                let stamp = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
                Some((stamp, entry.path()))
            })
            .collect();
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    fn dir_for(&self, source: &Path) -> PathBuf {
        match (&self.dir, source.parent()) {
            (Some(dir), _) => dir.clone(),
            (None, Some(parent)) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn next_stamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        }
    }
}

fn file_name(source: &Path) -> String {
    source
        .file_name()
        .map_or_else(|| "document".to_string(), |n| n.to_string_lossy().into_owned())
}

fn backup_name(file_name: &str, tag: &str, stamp: DateTime<Utc>) -> String {
    format!("{file_name}.{tag}.{}.{SUFFIX}", stamp.format(STAMP_FORMAT))
}

fn sanitize_tag(tag: &str) -> String {
    let cleaned: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "patch".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_holds_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("local.values.yml");
        let mut store = BackupStore::alongside();
        let backup = store.write(&source, "cache-timeout", b"cache:\n  timeout: 30\n").unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), b"cache:\n  timeout: 30\n");
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("local.values.yml.cache-timeout."));
        assert!(name.ends_with(".bak"));
    }

    #[test]
    fn rapid_backups_are_strictly_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("local.values.yml");
        let mut store = BackupStore::in_dir(dir.path().join("backups"));
        let written: Vec<PathBuf> = (0..5)
            .map(|i| store.write(&source, "pool", format!("v{i}").as_bytes()).unwrap())
            .collect();
        assert_eq!(store.list(&source).unwrap(), written);
    }

    #[test]
    fn list_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("local.values.yml");
        std::fs::write(dir.path().join("local.values.yml"), "a: 1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let store = BackupStore::alongside();
        assert!(store.list(&source).unwrap().is_empty());
    }

    #[test]
    fn tags_are_sanitized() {
        assert_eq!(sanitize_tag("cache timeout/60"), "cache-timeout-60");
        assert_eq!(sanitize_tag(""), "patch");
    }
}
