use anyhow::{Context, Result};
use clap::Parser;
use tidewatch_server::{serve, telemetry::Telemetry, AppState, Cli, ServerConfig};
use tokio::{net::TcpListener, signal};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        root = %config.root.display(),
        camera = %config.camera,
        max_stream_bytes = config.max_stream_bytes,
        "starting tidewatch server"
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let state = AppState::new(config, Some(telemetry.metrics_handle()))?;
    serve(listener, state, shutdown_signal()).await?;

    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
