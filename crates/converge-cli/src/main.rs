//! converge - idempotent local environment setup
//!
//! Loads `converge.yaml`, wires the stage plan and runs it. Every stage is
//! checked before it runs, so re-running after a failure or on an already
//! converged machine is safe.

mod args;
mod exit_codes;
mod logging;
mod wiring;

use anyhow::Context;
use args::CliArgs;
use converge_config::Settings;
use converge_kernel::{RunReport, Sequencer, SequencerOptions, StageId, StageOutcome};
use converge_monitor::{ReadinessError, ReadinessMonitor};
use std::path::Path;
use std::process::ExitCode;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    match run(&args).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_codes::FAILURE)
        }
    }
}

async fn run(args: &CliArgs) -> anyhow::Result<u8> {
    let settings = Settings::load(&args.config)
        .with_context(|| format!("loading settings from {}", args.config.display()));
    let log_dir = match &settings {
        Ok(settings) if !args.dry_run => Some(settings.workspace.log_dir()),
        _ => None,
    };
    let log_file = logging::init(args.verbose, log_dir.as_deref())?;

    let settings = match settings {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!("{:#}", err);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let wiring = match wiring::build(&settings) {
        Ok(wiring) => wiring,
        Err(err) => {
            tracing::error!("Invalid settings: {:#}", err);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let mut sequencer = Sequencer::new(wiring.plan).with_options(SequencerOptions {
        preview: args.dry_run,
        resume_from: args.resume_from,
        force_continue: args.force_continue,
        validate_only: args.validate_only,
    });
    if let Some(config) = wiring.config {
        sequencer = sequencer.with_config(config);
    }

    tracing::info!("converge {} using {}", env!("CARGO_PKG_VERSION"), args.config.display());
    let report = tokio::select! {
        report = sequencer.run() => report?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted; completed stages will be detected on the next run");
            return Ok(exit_codes::INTERRUPTED);
        }
    };

    print_summary(&report, log_file.as_deref());
    if let Some(path) = &args.report {
        report
            .write_json(path)
            .with_context(|| format!("writing report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    if !report.succeeded() {
        return Ok(exit_codes::FAILURE);
    }
    if args.wait_ready && !args.dry_run && !args.validate_only {
        return wait_ready(&settings).await;
    }
    Ok(exit_codes::SUCCESS)
}

async fn wait_ready(settings: &Settings) -> anyhow::Result<u8> {
    let Some(readiness) = &settings.readiness else {
        tracing::warn!("--wait-ready given but settings have no readiness section");
        return Ok(exit_codes::SUCCESS);
    };
    let monitor = ReadinessMonitor::new(wiring::readiness(readiness))?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });
    let outcome = monitor.wait_with_cancel(cancel_rx).await;
    interrupt.abort();

    match outcome {
        Ok(signal) => {
            println!("Application ready: {signal}");
            Ok(exit_codes::SUCCESS)
        }
        Err(ReadinessError::Cancelled) => Ok(exit_codes::INTERRUPTED),
        Err(err @ ReadinessError::Timeout { .. }) => {
            println!("Readiness: {err}");
            Ok(exit_codes::SUCCESS)
        }
        Err(err) => Err(err.into()),
    }
}

fn print_summary(report: &RunReport, log_file: Option<&Path>) {
    println!();
    println!("Convergence summary ({:?}, run {})", report.mode, report.run_id);
    println!("{}", "=".repeat(60));
    for record in &report.stages {
        let seconds = std::time::Duration::from_millis(record.duration_ms).as_secs_f64();
        println!("  {:<24} {:>7.1}s  {}", record.stage.name(), seconds, record.outcome);
    }
    if let Some(stage) = report.halted_at {
        println!("  stopped at {stage}; later stages were not run");
    }

    let warnings = report.warnings();
    if !warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &warnings {
            println!("  - {warning}");
        }
    }

    let hints: Vec<String> = report
        .failures()
        .filter_map(|record| match &record.outcome {
            StageOutcome::Failed { remediation, .. } => Some(format!(
                "{}: {}. To retry: {remediation}",
                record.stage,
                troubleshooting(record.stage)
            )),
            _ => None,
        })
        .chain(
            warnings
                .iter()
                .any(|w| w.contains("marked successful without re-applying"))
                .then(|| {
                    "ledger: some migrations were marked successful without running; review them before relying on that schema"
                        .to_string()
                }),
        )
        .collect();
    if !hints.is_empty() {
        println!();
        println!("Troubleshooting:");
        for hint in hints {
            println!("  - {hint}");
        }
    }

    if let Some(path) = log_file {
        println!();
        println!("Full log: {}", path.display());
    }
}

fn troubleshooting(stage: StageId) -> &'static str {
    match stage {
        StageId::Validate => "fix the missing tools or unwritable directories listed above",
        StageId::InstallPrerequisites => "install the missing tools by hand and check they are on PATH",
        StageId::AcquireRepositories => "check network access and repository credentials",
        StageId::StartServices => "check nothing else is listening on the service ports and that the start commands work",
        StageId::ConvergeDatabase => "check the database is running and the credentials in the settings file",
        StageId::BuildArtifacts => "see the build output above; optional steps only warn",
        StageId::Verify => "the listed checks did not hold; re-run the stage they belong to",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stage_has_a_hint() {
        for stage in StageId::ALL {
            assert!(!troubleshooting(stage).is_empty());
        }
    }
}
