use std::sync::Arc;

use anyhow::{Context, Result};
use beach_relay::telemetry::Telemetry;
use beach_relay::{serve, Cli, RelayConfig, RelayState};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        max_missed_pongs = config.max_missed_pongs,
        "starting beach-relay"
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let grace = config.shutdown_grace;
    let state = Arc::new(RelayState::new(config).with_metrics(telemetry.metrics_handle()));

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
