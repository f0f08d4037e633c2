#![forbid(unsafe_code)]

use anyhow::Result;
use sfu_signaling::config::ServerConfig;
use sfu_signaling::media::engine::MediasoupEngine;
use sfu_signaling::media::MediaServer;
use sfu_signaling::metrics::ServerMetrics;
use sfu_signaling::session::SessionRegistry;
use sfu_signaling::signaling::SignalingServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_signaling=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("SFU signaling - Starting server");

    let config = ServerConfig::from_env()?;

    let engine = MediasoupEngine::new();
    let media_server = Arc::new(MediaServer::new(&engine, config.media.clone()).await?);
    let worker_manager = media_server.worker_manager();

    let metrics = ServerMetrics::new();
    let registry = Arc::new(SessionRegistry::new(media_server, metrics.clone()));

    info!("Session registry and media server initialized");

    let signaling_server = SignalingServer::new(registry.clone(), metrics, config.max_connections)
        .with_metrics_token(config.metrics_token.clone());

    info!("Starting signaling server on port {}", config.port);

    // Run server until it fails, Ctrl+C, or the media worker dies
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.shutdown().await;
        }
        Some(reason) = worker_manager.wait_for_death() => {
            error!("Media worker died ({}), exiting in {:?}", reason, config.worker_death_grace);
            tokio::time::sleep(config.worker_death_grace).await;
            std::process::exit(1);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
