//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the CarSim feeder daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use carsim_broker::GrpcConnector;
use carsim_common::config::FeederConfig;
use carsim_common::logging::{init_tracing, LogFormat};
use carsim_core::ConnectionSupervisor;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "CarSim data broker feeder", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", help = "Data broker address, overrides config and VDB_ADDRESS")]
    address: Option<String>,

    #[arg(long, value_enum, help = "Override log output format")]
    log_format: Option<CliLogFormat>,

    #[arg(long, value_name = "SECONDS", help = "Exit after running this long")]
    run_for: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    StructuredJson,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::StructuredJson => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("carsim.toml"));
    candidates.push(PathBuf::from("/etc/carsim/carsim.toml"));

    let loaded = FeederConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(address) = cli.address {
        config.broker.address = address;
        config.validate()?;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing("carsimd", &config.logging)?;

    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; running with defaults"),
    }
    info!(
        address = %config.broker.address,
        datapoints = config.datapoints.len(),
        "starting feeder"
    );

    // The supervisor and its channel live outside the signal runtime; the
    // channel drives its own runtime from plain threads.
    let connector = GrpcConnector::new(&config.broker);
    let supervisor = ConnectionSupervisor::start(&connector, &config)
        .context("failed to start connection supervisor")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime.block_on(wait_for_stop(cli.run_for.map(Duration::from_secs)));

    supervisor.shutdown();
    let metrics = supervisor.metrics();
    info!(
        registration_attempts = metrics.registration_attempts,
        registrations = metrics.registrations,
        registration_failures = metrics.registration_failures,
        publishes = metrics.publishes,
        publish_failures = metrics.publish_failures,
        disconnects = metrics.disconnects,
        "feeder stopped"
    );
    Ok(())
}

async fn wait_for_stop(run_for: Option<Duration>) {
    match run_for {
        Some(limit) => {
            tokio::select! {
                _ = shutdown_signal() => info!("shutdown signal received"),
                _ = tokio::time::sleep(limit) => info!(run_for_secs = limit.as_secs(), "run time elapsed"),
            }
        }
        None => {
            shutdown_signal().await;
            info!("shutdown signal received");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
