use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::Level;
use waterparty_server::{InMemoryBackend, ServerConfig, ShutdownCoordinator};
use waterparty_telemetry::{LogFormat, TelemetryConfig};

/// Real-time hub for WaterParty clients.
#[derive(Debug, Parser)]
#[command(name = "waterparty", version)]
struct Args {
    /// Address to bind. Overrides HOST.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind. Overrides PORT.
    #[arg(long, short)]
    port: Option<u16>,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// `json` or `pretty`.
    #[arg(long, default_value = "json")]
    log_format: LogFormat,

    /// Disable the in-memory metrics recorder.
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = waterparty_telemetry::init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        format: args.log_format,
        metrics_enabled: !args.no_metrics,
        ..TelemetryConfig::default()
    })?;

    let mut config = ServerConfig::from_env().context("invalid environment configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);
    let backend = Arc::new(InMemoryBackend::with_retention(config.history_retention));

    tracing::info!(addr = %config.addr(), "starting waterparty");

    let coordinator = ShutdownCoordinator::new();
    let handle = waterparty_server::start(
        config,
        backend,
        telemetry.metrics(),
        coordinator.token(),
    )
    .await
    .context("failed to start server")?;

    tracing::info!(port = handle.port(), "waterparty ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    coordinator
        .graceful_shutdown(handle.into_tasks(), Some(shutdown_timeout))
        .await;
    Ok(())
}
