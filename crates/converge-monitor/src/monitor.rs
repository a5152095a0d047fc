//! Readiness race
//!
//! Two probes run side by side on the current task: a health poll that
//! succeeds on any HTTP response, and a log tail that succeeds on the first
//! startup marker. Whichever fires first wins and the other is dropped
//! before it can report anything. The wait is bounded by `max_wait` and can
//! be cancelled through a watch channel.

use crate::error::ReadinessError;
use crate::tail::LogTail;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Log tail poll period
pub const TAIL_INTERVAL: Duration = Duration::from_millis(500);

/// Shortest accepted health poll period
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for a single health request
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// What to watch and for how long
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Health endpoint polled with GET
    pub health_url: Option<String>,
    /// Application log to tail
    pub log_file: Option<PathBuf>,
    /// Substrings that mean startup completed
    pub markers: Vec<String>,
    /// Time between health polls
    pub poll_interval: Duration,
    /// Give up after this long
    pub max_wait: Duration,
    /// Time between progress reports
    pub progress_interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            health_url: None,
            log_file: None,
            markers: Vec::new(),
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(600),
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Which probe fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    /// The health endpoint answered
    Health {
        /// Endpoint
        url: String,
        /// HTTP status, whatever it was
        status: u16,
    },
    /// A startup marker appeared in the log
    LogMarker {
        /// Matching line
        line: String,
    },
}

impl fmt::Display for ReadySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Health { url, status } => write!(f, "{url} answered with {status}"),
            Self::LogMarker { line } => write!(f, "log reported \"{line}\""),
        }
    }
}

/// Waits until the application looks ready
#[derive(Debug, Clone)]
pub struct ReadinessMonitor {
    config: ReadinessConfig,
    client: reqwest::Client,
}

impl ReadinessMonitor {
    /// Monitor for `config`; poll intervals below [`MIN_POLL_INTERVAL`] are raised to it
    ///
    /// # Errors
    /// [`ReadinessError::Client`] when the HTTP client cannot be built.
    pub fn new(mut config: ReadinessConfig) -> Result<Self, ReadinessError> {
        config.poll_interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        let client = reqwest::Client::builder()
            .timeout(config.poll_interval.min(MAX_REQUEST_TIMEOUT))
            .build()
            .map_err(|e| ReadinessError::Client(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Settings in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// Wait without an external cancel signal
    ///
    /// # Errors
    /// See [`ReadinessMonitor::wait_with_cancel`].
    pub async fn wait(&self) -> Result<ReadySignal, ReadinessError> {
        let (_keep, cancel) = watch::channel(false);
        self.wait_with_cancel(cancel).await
    }

    /// Wait until a probe fires, the deadline passes, or `cancel` turns true
    ///
    /// # Errors
    /// [`ReadinessError::Timeout`] after `max_wait`, [`ReadinessError::Cancelled`]
    /// on cancel, [`ReadinessError::NoProbes`] with nothing to watch.
    pub async fn wait_with_cancel(
        &self,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ReadySignal, ReadinessError> {
        if self.config.health_url.is_none() && self.config.log_file.is_none() {
            return Err(ReadinessError::NoProbes);
        }
        if *cancel.borrow() {
            return Err(ReadinessError::Cancelled);
        }

        let started = Instant::now();
        tracing::info!(
            "Waiting up to {}s for readiness ({})",
            self.config.max_wait.as_secs(),
            self.describe()
        );

        let health = self.poll_health();
        let log = self.follow_log();
        let deadline = tokio::time::sleep(self.config.max_wait);
        tokio::pin!(health, log, deadline);

        let period = self.config.progress_interval.max(Duration::from_secs(1));
        let mut progress = tokio::time::interval_at(started + period, period);
        let mut cancel_open = true;

        loop {
            tokio::select! {
                signal = &mut health => return Ok(self.ready(signal, started)),
                signal = &mut log => return Ok(self.ready(signal, started)),
                () = &mut deadline => {
                    let err = ReadinessError::timeout(started.elapsed(), self.config.log_file.clone());
                    tracing::warn!("{}", err);
                    return Err(err);
                }
                _ = progress.tick() => {
                    tracing::info!("Still waiting for readiness ({}s elapsed)", started.elapsed().as_secs());
                }
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel.borrow() => {
                        tracing::warn!("Readiness wait cancelled");
                        return Err(ReadinessError::Cancelled);
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },
            }
        }
    }

    #[allow(clippy::unused_self)]
    fn ready(&self, signal: ReadySignal, started: Instant) -> ReadySignal {
        tracing::info!("Ready after {}s: {}", started.elapsed().as_secs(), signal);
        signal
    }

    fn describe(&self) -> String {
        let mut probes = Vec::new();
        if let Some(url) = &self.config.health_url {
            probes.push(format!("GET {url}"));
        }
        if let Some(log) = &self.config.log_file {
            probes.push(format!("tail {}", log.display()));
        }
        probes.join(", ")
    }

    async fn poll_health(&self) -> ReadySignal {
        let Some(url) = self.config.health_url.clone() else {
            return std::future::pending().await;
        };
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.client.get(&url).send().await {
                Ok(response) => {
                    return ReadySignal::Health {
                        url,
                        status: response.status().as_u16(),
                    }
                }
                Err(err) => tracing::debug!("Health check {} not answering: {}", url, err),
            }
        }
    }

    async fn follow_log(&self) -> ReadySignal {
        let Some(path) = &self.config.log_file else {
            return std::future::pending().await;
        };
        let mut tail = LogTail::new(path, self.config.markers.clone());
        let mut ticker = tokio::time::interval(TAIL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match tail.poll_markers().await {
                Ok(Some(line)) => return ReadySignal::LogMarker { line },
                Ok(None) => {}
                Err(err) => tracing::debug!("Cannot read {}: {}", path.display(), err),
            }
        }
    }
}
