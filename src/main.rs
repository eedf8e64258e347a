#![forbid(unsafe_code)]

mod bitrate;
mod config;
mod coordinator;
mod error;
mod media;
mod metrics;
mod peer;
mod room;
mod signaling;

use anyhow::Result;
use config::HostConfig;
use coordinator::RoomCoordinator;
use media::{LoopbackEngine, MediaEngine};
use room::{QualityProfile, QualityTier};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lancast=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Lancast - Starting host");

    let config = HostConfig::from_env();
    config.validate()?;

    // The loopback engine stands in until a platform capture backend is wired up
    let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::new());
    let coordinator = RoomCoordinator::new(config, engine);

    // Pick the source: LANCAST_SOURCE if set, otherwise the first capturable one
    let source = match std::env::var("LANCAST_SOURCE") {
        Ok(id) if !id.is_empty() => id,
        _ => {
            let sources = coordinator.list_sources().await?;
            sources
                .first()
                .map(|s| s.id.clone())
                .ok_or_else(|| anyhow::anyhow!("no capturable sources"))?
        }
    };
    let tier = std::env::var("LANCAST_QUALITY")
        .ok()
        .and_then(|v| v.parse::<QualityTier>().ok())
        .unwrap_or(QualityTier::Medium);

    let room = coordinator
        .create_room(&source, QualityProfile::preset(tier))
        .await?;
    info!("Sharing {} as room {}", source, room.code);
    info!("Viewers join at {}", coordinator.join_url().await?);

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    coordinator.shutdown().await;

    info!("Host shutdown complete");
    Ok(())
}
