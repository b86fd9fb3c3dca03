use std::sync::Arc;

use anyhow::{Context, Result};
use beach_bonfire_server::{
    serve, telemetry::Telemetry, AppState, Cli, RoomRegistry, ServerConfig, SignalingRelay,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        heartbeat_interval_secs = config.liveness.heartbeat_interval.as_secs(),
        heartbeat_timeout_secs = config.liveness.timeout().as_secs(),
        room_capacity = config.registry.room_capacity,
        "starting beach-bonfire relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let registry = RoomRegistry::new(config.registry.clone());
    let relay = SignalingRelay::new(registry, config.liveness.clone());
    let sweeper = relay.spawn_liveness_sweeper();
    let state = Arc::new(AppState::new(relay, Some(metrics)));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-bonfire listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    sweeper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
