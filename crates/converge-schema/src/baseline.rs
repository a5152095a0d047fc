//! Bulk snapshot restore for empty schemas

use crate::error::ReconcileError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

/// Default limit for one snapshot restore
pub const DEFAULT_IMPORT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Snapshot file for one schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineSnapshot {
    /// Target schema
    pub schema: String,
    /// SQL dump to restore
    pub path: PathBuf,
}

impl BaselineSnapshot {
    /// Create a snapshot reference
    #[must_use]
    pub fn new(schema: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            schema: schema.into(),
            path: path.into(),
        }
    }
}

/// Restores a snapshot into a schema
#[async_trait]
pub trait BaselineImport: Send + Sync {
    /// Load `snapshot` into `schema`
    async fn import(&self, schema: &str, snapshot: &Path) -> Result<(), ReconcileError>;
}

/// Pipes a dump file through the `mysql` command line client
#[derive(Debug, Clone)]
pub struct MysqlClientImport {
    client: String,
    host: String,
    port: u16,
    user: String,
    password: String,
    timeout: Duration,
}

impl MysqlClientImport {
    /// Importer using the given client binary and credentials
    #[must_use]
    pub fn new(
        client: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client: client.into(),
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            timeout: DEFAULT_IMPORT_TIMEOUT,
        }
    }

    /// Override the restore timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, schema: &str) -> Command {
        let mut cmd = Command::new(&self.client);
        cmd.arg(format!("--host={}", self.host))
            .arg(format!("--port={}", self.port))
            .arg(format!("--user={}", self.user))
            .arg("--default-character-set=utf8mb4")
            .arg(schema)
            .env("MYSQL_PWD", &self.password)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl BaselineImport for MysqlClientImport {
    async fn import(&self, schema: &str, snapshot: &Path) -> Result<(), ReconcileError> {
        let fail = |message: String| ReconcileError::Baseline {
            schema: schema.to_string(),
            message,
        };
        let file = std::fs::File::open(snapshot)
            .map_err(|e| fail(format!("cannot open {}: {e}", snapshot.display())))?;

        info!(schema, snapshot = %snapshot.display(), "restoring baseline snapshot");
        let child = self
            .command(schema)
            .stdin(Stdio::from(file))
            .spawn()
            .map_err(|e| fail(format!("cannot start {}: {e}", self.client)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| fail(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| fail(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(fail(format!("{}: {}", output.status, stderr.trim())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_snapshot_is_an_error() {
        let importer = MysqlClientImport::new("mysql", "localhost", 3306, "root", "");
        let err = importer
            .import("legiondb", Path::new("/nonexistent/legiondb.sql"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Baseline { ref schema, .. } if schema == "legiondb"));
    }

    #[tokio::test]
    async fn missing_client_is_an_error() {
        let dump = tempfile::NamedTempFile::new().unwrap();
        let importer = MysqlClientImport::new("converge-no-such-client", "localhost", 3306, "root", "");
        let err = importer.import("legiondb", dump.path()).await.unwrap_err();
        assert!(err.to_string().contains("cannot start"));
    }
}
