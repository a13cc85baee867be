//! spire-testbed
//!
//! Command line entry point. Configuration comes from `TESTBED_*`
//! environment variables; the flags below override the common ones.

use clap::{Parser, Subcommand};
use common::config::{ObservabilityConfig, DEFAULT_LOG_FILTER};
use spire_testbed::layout::Service;
use spire_testbed::orchestrator::status;
use spire_testbed::runner::TestReport;
use spire_testbed::{Components, Config, Layout, Orchestrator, TestbedError};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "spire-testbed", version, about = "SPIRE integration test environment")]
struct Cli {
    /// Working directory for child processes, logs and the test command.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Root for markers, sockets and private state.
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    /// Abort when a readiness wait times out instead of proceeding.
    #[arg(long, global = true)]
    abort_on_timeout: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Bring the environment up and leave it running.
    Up,
    /// Tear down whatever an earlier `up` left behind.
    Down,
    /// Bring up, run the test command, tear down.
    Run,
    /// Show recorded processes and whether they are alive.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&ObservabilityConfig::from_vars(&env::vars().collect()));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(work_dir) = cli.work_dir {
        config.work_dir = work_dir;
    }
    if let Some(temp_dir) = cli.temp_dir {
        config.temp_dir = temp_dir;
    }
    config.abort_on_timeout |= cli.abort_on_timeout;

    info!(
        command = ?cli.command,
        trust_domain = %config.trust_domain,
        workload_id = %config.workload_id,
        temp_dir = %config.temp_dir.display(),
        stage_timeout_secs = config.stage_timeout.as_secs(),
        abort_on_timeout = config.abort_on_timeout,
        "Configuration loaded"
    );

    match execute(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(stage = ?e.stage(), error = %e, "spire-testbed failed");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, config: Config) -> Result<ExitCode, TestbedError> {
    let layout = Layout::new(config.work_dir.clone(), config.temp_dir.clone());
    if let Command::Status = command {
        print_status(&layout);
        return Ok(ExitCode::SUCCESS);
    }

    let components = Components::spire(&config, &layout)?;
    let mut orchestrator = Orchestrator::new(config, components);

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received, cancelling run");
        cancel.cancel();
    });

    match command {
        Command::Up => {
            orchestrator.up().await?;
            info!(
                socket = %orchestrator.layout().socket_path(Service::Agent).display(),
                "Environment is up; run `spire-testbed down` to remove it"
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Down => {
            let report = orchestrator.down();
            if report.is_clean() {
                return Ok(ExitCode::SUCCESS);
            }
            warn!(failures = ?report.failures, "Teardown left something behind");
            Ok(ExitCode::FAILURE)
        }
        Command::Run => {
            let report = orchestrator.run().await?;
            Ok(exit_code(report))
        }
        Command::Status => Ok(ExitCode::SUCCESS),
    }
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_new(&observability.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout belongs to `status` and the test command.
    if observability.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_status(layout: &Layout) {
    let recorded = status(layout);
    if recorded.is_empty() {
        println!("no testbed processes recorded under {}", layout.state_dir().display());
        return;
    }
    for entry in recorded {
        println!(
            "{:<14} pid {:<8} {:<8} started {} log {}",
            entry.handle.service.to_string(),
            entry.handle.pid,
            if entry.alive { "running" } else { "gone" },
            entry.handle.started_at.to_rfc3339(),
            entry.handle.log_path.display(),
        );
    }
}

/// The test command's own exit code, or 1 when it has none.
fn exit_code(report: TestReport) -> ExitCode {
    if report.success {
        return ExitCode::SUCCESS;
    }
    report
        .exit_code
        .and_then(|code| u8::try_from(code).ok())
        .filter(|code| *code != 0)
        .map_or(ExitCode::FAILURE, ExitCode::from)
}

/// Wait for Ctrl+C or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them a run could
/// not be cancelled at all.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
