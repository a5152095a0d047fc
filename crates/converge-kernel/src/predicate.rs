//! Completion predicates
//!
//! A predicate answers "is this stage already done?" by looking at the
//! machine itself: files, listening ports, the database. There is no stage
//! completion database. Predicates never fail; anything that goes wrong
//! while checking counts as "not done".

use crate::process::find_in_path;
use async_trait::async_trait;
use converge_schema::{Reconciler, SchemaCatalog};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Default connect timeout for network predicates
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Externally checkable completion condition
#[async_trait]
pub trait CompletionPredicate: Send + Sync {
    /// Whether the condition holds now
    async fn is_satisfied(&self) -> bool;

    /// Human readable description
    fn describe(&self) -> String;
}

/// Every path exists
#[derive(Debug, Clone)]
pub struct PathExists {
    paths: Vec<PathBuf>,
}

impl PathExists {
    /// Predicate over the given paths
    #[must_use]
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CompletionPredicate for PathExists {
    async fn is_satisfied(&self) -> bool {
        !self.paths.is_empty() && self.paths.iter().all(|p| p.exists())
    }

    fn describe(&self) -> String {
        let paths: Vec<String> = self.paths.iter().map(|p| p.display().to_string()).collect();
        format!("exists: {}", paths.join(", "))
    }
}

/// Every command resolves on `PATH`
#[derive(Debug, Clone)]
pub struct CommandsAvailable {
    commands: Vec<String>,
}

impl CommandsAvailable {
    /// Predicate over the given executables
    #[must_use]
    pub fn new(commands: impl IntoIterator<Item = String>) -> Self {
        Self {
            commands: commands.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CompletionPredicate for CommandsAvailable {
    async fn is_satisfied(&self) -> bool {
        self.commands.iter().all(|c| find_in_path(c).is_some())
    }

    fn describe(&self) -> String {
        format!("on PATH: {}", self.commands.join(", "))
    }
}

/// A TCP connection to `host:port` succeeds
#[derive(Debug, Clone)]
pub struct TcpReachable {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpReachable {
    /// Predicate for one endpoint
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Override the connect timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Whether a TCP connection to `host:port` succeeds within `timeout`
pub async fn tcp_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[async_trait]
impl CompletionPredicate for TcpReachable {
    async fn is_satisfied(&self) -> bool {
        tcp_reachable(&self.host, self.port, self.timeout).await
    }

    fn describe(&self) -> String {
        format!("tcp {}:{} reachable", self.host, self.port)
    }
}

/// An HTTP GET gets any response
///
/// The status code is ignored: an endpoint that answers at all is up, even
/// when it reports itself degraded.
#[derive(Debug, Clone)]
pub struct HttpReachable {
    url: String,
    client: reqwest::Client,
}

impl HttpReachable {
    /// Predicate for one URL
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_PROBE_TIMEOUT)
    }

    /// Predicate with a request timeout
    #[must_use]
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl CompletionPredicate for HttpReachable {
    async fn is_satisfied(&self) -> bool {
        self.client.get(&self.url).send().await.is_ok()
    }

    fn describe(&self) -> String {
        format!("http {} responds", self.url)
    }
}

/// The database answers a trivial query
pub struct DatabaseReachable {
    catalog: Arc<dyn SchemaCatalog>,
    label: String,
}

impl DatabaseReachable {
    /// Predicate over a catalog; `label` names the server in output
    #[must_use]
    pub fn new(catalog: Arc<dyn SchemaCatalog>, label: impl Into<String>) -> Self {
        Self {
            catalog,
            label: label.into(),
        }
    }
}

#[async_trait]
impl CompletionPredicate for DatabaseReachable {
    async fn is_satisfied(&self) -> bool {
        self.catalog.ping().await.is_ok()
    }

    fn describe(&self) -> String {
        format!("database {} reachable", self.label)
    }
}

/// Every reconciliation step would be a no-op
pub struct DatabaseConverged {
    reconciler: Arc<Reconciler>,
}

impl DatabaseConverged {
    /// Predicate over a reconciler's read-only probe
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl CompletionPredicate for DatabaseConverged {
    async fn is_satisfied(&self) -> bool {
        match self.reconciler.is_converged().await {
            Ok(converged) => converged,
            Err(err) => {
                tracing::debug!("Convergence probe failed: {}", err);
                false
            }
        }
    }

    fn describe(&self) -> String {
        "database converged".to_string()
    }
}

/// Every inner predicate holds; an empty set never holds
pub struct AllOf {
    predicates: Vec<Arc<dyn CompletionPredicate>>,
}

impl AllOf {
    /// Conjunction of predicates
    #[must_use]
    pub fn new(predicates: Vec<Arc<dyn CompletionPredicate>>) -> Self {
        Self { predicates }
    }
}

#[async_trait]
impl CompletionPredicate for AllOf {
    async fn is_satisfied(&self) -> bool {
        if self.predicates.is_empty() {
            return false;
        }
        for predicate in &self.predicates {
            if !predicate.is_satisfied().await {
                return false;
            }
        }
        true
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.predicates.iter().map(|p| p.describe()).collect();
        parts.join(" and ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn path_exists_needs_every_path() {
        let dir = tempfile::tempdir().unwrap();
        let present = PathExists::new([dir.path().to_path_buf()]);
        assert!(present.is_satisfied().await);

        let partial = PathExists::new([dir.path().to_path_buf(), dir.path().join("missing")]);
        assert!(!partial.is_satisfied().await);

        assert!(!PathExists::new(Vec::<PathBuf>::new()).is_satisfied().await);
    }

    #[tokio::test]
    async fn tcp_reachable_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(TcpReachable::new("127.0.0.1", port).is_satisfied().await);
        drop(listener);
        let closed = TcpReachable::new("127.0.0.1", port).with_timeout(Duration::from_millis(200));
        assert!(!closed.is_satisfied().await);
    }

    #[tokio::test]
    async fn http_unreachable_is_not_satisfied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = HttpReachable::with_timeout(format!("http://127.0.0.1:{port}/health"), Duration::from_millis(300));
        assert!(!probe.is_satisfied().await);
    }

    #[tokio::test]
    async fn all_of_requires_every_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let yes: Arc<dyn CompletionPredicate> = Arc::new(PathExists::new([dir.path().to_path_buf()]));
        let no: Arc<dyn CompletionPredicate> = Arc::new(PathExists::new([dir.path().join("nope")]));
        assert!(AllOf::new(vec![yes.clone()]).is_satisfied().await);
        assert!(!AllOf::new(vec![yes, no]).is_satisfied().await);
        assert!(!AllOf::new(vec![]).is_satisfied().await);
    }

    #[tokio::test]
    async fn commands_available_checks_path() {
        assert!(CommandsAvailable::new(["sh".to_string()]).is_satisfied().await);
        assert!(!CommandsAvailable::new(["converge-no-such-tool".to_string()]).is_satisfied().await);
    }
}
