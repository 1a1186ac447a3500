//! saas-billing service - subscription billing over HTTP.
//!
//! This is the main entry point for the saas-billing service.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use saas_billing_service::{create_router, AppState, Engine, ServiceConfig};
use saas_billing_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,saas_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting saas-billing service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        gateway_configured = %config.gateway_secret_key.is_some(),
        webhook_verification = %config.gateway_webhook_secret.is_some(),
        sweep_interval_seconds = config.sweep_interval_seconds,
        retention_purge = config.retention_purge,
        "Service configuration loaded"
    );

    let store = open_store(&config)?;
    let state = AppState::new(store, config.clone())?;

    if config.sweep_interval_seconds > 0 {
        spawn_sweep(
            Arc::clone(&state.engine),
            Duration::from_secs(config.sweep_interval_seconds),
        );
    } else {
        tracing::warn!("Sweep timer disabled - run POST /v1/admin/sweep from a scheduler");
    }

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(feature = "rocksdb-backend")]
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(saas_billing_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store(_config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::warn!("Built without rocksdb-backend - using in-memory store, data will not persist");
    Ok(Arc::new(saas_billing_store::MemoryStore::new()))
}

/// Run the sweep on a fixed interval. Each run is idempotent within a day.
fn spawn_sweep(engine: Arc<Engine>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.run_daily_sweep(Utc::now()).await {
                tracing::error!(error = %e, "Scheduled sweep failed");
            }
        }
    });
}
