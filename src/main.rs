use anyhow::Context;
use tracing::{error, info};

use hybrid_eventbus::event_bus::{EventBusManager, EventKind, SubscribeOptions};
use hybrid_eventbus::{Event, Settings};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting hybrid event bus");

    let settings = Settings::new().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let manager = EventBusManager::from_settings(&settings).context("invalid event bus settings")?;

    manager
        .subscribe(
            EventKind::SYSTEM_ERROR,
            |event: Event| async move {
                error!(
                    correlation_id = %event.correlation_id,
                    payload = ?event.metadata.payload,
                    "event handler failure reported"
                );
                Ok::<_, anyhow::Error>(())
            },
            SubscribeOptions::default(),
        )
        .await?;

    let health = manager.health_check().await;
    info!(status = ?health.status, details = %health.details, "event bus ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    manager.shutdown().await;
    Ok(())
}
