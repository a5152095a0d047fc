//! Migration ledger repair policy and script lookup

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What to do with a failed ledger entry whose script cannot be re-applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerPolicy {
    /// Stop reconciliation with an error
    FailFast,
    /// Mark the entry successful anyway and emit a [`LedgerRepairWarning`]
    #[default]
    Unblock,
}

/// A ledger entry was marked successful without its script being applied
///
/// The schema may not match what the ledger now claims. These warnings are
/// always logged and carried into the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRepairWarning {
    /// Ledger table
    pub ledger: String,
    /// Rank of the repaired entry
    pub installed_rank: i64,
    /// Script identifier
    pub script: String,
    /// Why re-execution was not possible
    pub reason: String,
}

impl fmt::Display for LedgerRepairWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: entry {} (rank {}) marked successful without re-applying: {}",
            self.ledger, self.script, self.installed_rank, self.reason
        )
    }
}

/// Finds migration scripts on disk by their ledger identifier
#[derive(Debug, Clone, Default)]
pub struct ScriptLocator {
    dirs: Vec<PathBuf>,
}

impl ScriptLocator {
    /// Search the given directories, in order
    #[must_use]
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            dirs: dirs.into_iter().collect(),
        }
    }

    /// Directories searched
    #[inline]
    #[must_use]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// First file whose name equals the script identifier
    ///
    /// Ledger identifiers are file names, sometimes with a relative prefix,
    /// so both the full identifier and its final component are tried.
    #[must_use]
    pub fn locate(&self, script: &str) -> Option<PathBuf> {
        let file_name = Path::new(script).file_name()?;
        for dir in &self.dirs {
            let direct = dir.join(script);
            if direct.is_file() {
                return Some(direct);
            }
            if let Some(found) = find_file(dir, file_name) {
                return Some(found);
            }
        }
        debug!(script, "migration script not found");
        None
    }
}

fn find_file(dir: &Path, name: &std::ffi::OsStr) -> Option<PathBuf> {
    let mut entries: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);
    let mut subdirs = Vec::new();
    for entry in entries {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => subdirs.push(path),
            Ok(t) if t.is_file() && entry.file_name() == name => return Some(path),
            _ => {}
        }
    }
    subdirs.iter().find_map(|sub| find_file(sub, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_nested_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("db/migration/v2");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("V2__add_index.sql"), "SELECT 1;").unwrap();

        let locator = ScriptLocator::new([dir.path().to_path_buf()]);
        assert_eq!(locator.locate("V2__add_index.sql"), Some(nested.join("V2__add_index.sql")));
        assert_eq!(locator.locate("V3__missing.sql"), None);
    }

    #[test]
    fn earlier_directories_win() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join("V1__init.sql"), "a").unwrap();
        std::fs::write(second.path().join("V1__init.sql"), "b").unwrap();

        let locator = ScriptLocator::new([first.path().to_path_buf(), second.path().to_path_buf()]);
        assert_eq!(locator.locate("V1__init.sql"), Some(first.path().join("V1__init.sql")));
    }

    #[test]
    fn unblock_is_default_policy() {
        assert_eq!(LedgerPolicy::default(), LedgerPolicy::Unblock);
    }

    #[test]
    fn warning_names_script() {
        let warning = LedgerRepairWarning {
            ledger: "legiondb.flyway_schema_history".into(),
            installed_rank: 42,
            script: "V42__drop.sql".into(),
            reason: "script not found".into(),
        };
        assert!(warning.to_string().contains("V42__drop.sql (rank 42)"));
    }
}
