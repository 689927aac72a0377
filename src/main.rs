//! screencast-server: streams the primary display as length-prefixed
//! H.264 packets to every TCP client that connects.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use screencast_core::{ServerConfig, StreamServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("screencast-server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load().context("Failed to load configuration")?;
    let server = StreamServer::new(config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        on_signal.cancel();
    });

    server.run(cancel).await.context("Streaming server failed")?;

    info!("Stopped");
    Ok(())
}
