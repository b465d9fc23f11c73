//! WorkerBridge Coordinator - Main Entry Point
//!
//! Hosts the dispatcher: loads configuration, runs the periodic worker and
//! request sweeps, and drains in-flight requests on shutdown. Transport and
//! API layers embed the library and feed it events.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workerbridge_common::BridgeConfig;
use workerbridge_coordinator::Dispatcher;

fn init_logging(config: &BridgeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "workerbridge_coordinator={level},workerbridge_common={level}",
            level = config.observability.log_level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::var("WORKERBRIDGE_CONFIG")
        .unwrap_or_else(|_| "configs/bridge-config.yaml".to_string());

    let config = if Path::new(&config_path).exists() {
        BridgeConfig::from_file(&config_path)
            .with_context(|| format!("loading configuration from {}", config_path))?
    } else {
        BridgeConfig::from_env().context("building configuration from environment")?
    };

    init_logging(&config);
    info!("Starting WorkerBridge Coordinator");
    if !Path::new(&config_path).exists() {
        warn!("Config file {} not found, using defaults and environment", config_path);
    }

    info!(
        "Coordinator configuration loaded: max_workers={}, worker_timeout={}s, max_wait={}s",
        config.worker_settings.max_workers,
        config.worker_settings.worker_timeout_seconds,
        config.queue_settings.max_wait_seconds
    );

    let dispatcher = Arc::new(Dispatcher::from_config(&config));
    let maintenance = Arc::clone(&dispatcher).spawn_maintenance();

    info!("WorkerBridge Coordinator running");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    let drained = dispatcher.shutdown("Server is shutting down").await;
    maintenance.await.context("maintenance task panicked")?;

    if config.observability.enable_metrics {
        let stats = dispatcher.stats();
        info!(
            "Final stats: {} request(s) accepted, {} completed, {} timed out, {} drained",
            stats.requests.total_requests,
            stats.requests.total_completed,
            stats.requests.total_timeouts,
            drained
        );
    }

    info!("WorkerBridge Coordinator shutdown complete");
    Ok(())
}
