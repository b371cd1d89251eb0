//! selflow-agent - personal activity capture daemon
//!
//! Watches the filesystem, running applications and host activity, and
//! persists the resulting event stream into a local DuckDB store.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use selflow_agent::{CaptureConfig, CaptureCoordinator};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = CaptureConfig::from_env().context("Failed to load configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("selflow_agent={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting selflow-agent");
    tracing::info!("Platform: {}", std::env::consts::OS);
    if let Some(path) = &config.db_path {
        tracing::info!("Event store: {}", path.display());
    }

    let shutdown_timeout = config.shutdown_timeout();
    let coordinator =
        CaptureCoordinator::new(config).context("Failed to open event store")?;

    coordinator
        .register_default_sources()
        .context("Failed to set up event sources")?;
    coordinator
        .start()
        .context("Failed to start capture")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    let report = coordinator.stop(shutdown_timeout).await;
    let stats = coordinator.snapshot_stats().await;
    tracing::info!(
        "Captured {}, persisted {}, deduped {}, dropped {} ({} lost on shutdown)",
        stats.total_captured,
        stats.total_persisted,
        stats.total_deduped,
        stats.total_dropped,
        report.lost
    );

    Ok(())
}
