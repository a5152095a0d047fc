use super::{ActionOutput, StageAction};
use crate::error::{StageError, StageResult};
use crate::predicate::tcp_reachable;
use crate::process::run_command;
use async_trait::async_trait;
use converge_config::CommandSpec;
use std::time::Duration;
use tokio::time::Instant;

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// An auxiliary service that listens on a TCP port
#[derive(Debug, Clone)]
pub struct Service {
    /// Display name
    pub name: String,
    /// Host to probe
    pub host: String,
    /// Port to probe
    pub port: u16,
    /// Command that starts the service
    pub start: Option<CommandSpec>,
    /// Failure becomes a warning
    pub optional: bool,
    /// How long to wait for the port after starting
    pub wait: Duration,
}

/// Start services that are not listening yet and wait for their ports
#[derive(Debug, Clone, Default)]
pub struct StartServices {
    services: Vec<Service>,
}

impl StartServices {
    /// Action over the given services
    #[must_use]
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    async fn start(service: &Service) -> StageResult<()> {
        let Some(start) = &service.start else {
            return Err(StageError::Unsatisfied(format!(
                "{} is not listening on {}:{} and has no start command",
                service.name, service.host, service.port
            )));
        };
        tracing::info!("Starting {}", service.name);
        run_command(start).await?;

        let deadline = Instant::now() + service.wait;
        loop {
            if tcp_reachable(&service.host, service.port, PORT_PROBE_TIMEOUT).await {
                tracing::info!("{} is listening on {}:{}", service.name, service.host, service.port);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StageError::Timeout {
                    what: format!("waiting for {} on port {}", service.name, service.port),
                    secs: service.wait.as_secs(),
                });
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl StageAction for StartServices {
    async fn run(&self) -> StageResult<ActionOutput> {
        let mut output = ActionOutput::done();
        for service in &self.services {
            if tcp_reachable(&service.host, service.port, PORT_PROBE_TIMEOUT).await {
                tracing::debug!("{} already running", service.name);
                continue;
            }
            match Self::start(service).await {
                Ok(()) => {}
                Err(err) if service.optional => {
                    output.warn(format!("optional service {} did not start: {err}", service.name));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self
            .services
            .iter()
            .map(|s| format!("{} (:{})", s.name, s.port))
            .collect();
        format!("start {}", names.join(", "))
    }
}
