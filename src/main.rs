// =============================================================================
// pattern-realtime — Main Entry Point
// =============================================================================
//
// Wires together persistence, the scan engine, the two background workers,
// and the HTTP/WS facade, then serves until Ctrl+C.
// =============================================================================

mod api;
mod app_state;
mod error;
mod hub;
mod matcher;
mod price_source;
mod price_tracker;
mod runtime_config;
mod scan_engine;
mod store;
mod types;
mod verification_worker;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::ServiceConfig;
use crate::store::PredictionStore;

const CONFIG_PATH: &str = "pattern_realtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("pattern-realtime starting up");

    let mut config = ServiceConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load service config, using defaults");
        ServiceConfig::default()
    });

    if let Ok(bind_addr) = std::env::var("PATTERN_REALTIME_BIND_ADDR") {
        config.bind_addr = bind_addr;
    }
    if let Ok(token) = std::env::var("PATTERN_REALTIME_ADMIN_TOKEN") {
        if !token.is_empty() {
            config.admin_token = Some(token);
        }
    }
    if let Ok(db_path) = std::env::var("PATTERN_REALTIME_DB_PATH") {
        config.db_path = db_path;
    }
    if let Ok(url) = std::env::var("PATTERN_REALTIME_MATCHER_URL") {
        config.matcher_base_url = url;
    }
    if let Ok(key) = std::env::var("POLYGON_API_KEY") {
        config.price_api_key = key;
    }

    info!(bind_addr = %config.bind_addr, db_path = %config.db_path, "configuration resolved");

    let store = PredictionStore::connect(&config.db_path).await?;
    let state = Arc::new(AppState::new(config, store));

    state.start_workers();
    info!("verification worker and price tracker started");

    let retention_days = state.config.retention_days;
    let retention_store = state.store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(86_400));
        loop {
            interval.tick().await;
            match retention_store.cleanup_old_data(retention_days).await {
                Ok(deleted) => info!(deleted, retention_days, "retention sweep completed"),
                Err(e) => error!(error = %e, "retention sweep failed"),
            }
        }
    });

    let bind_addr = state.config.bind_addr.clone();
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "http/ws facade listening");

    let serve_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "http server failed");
        }
        let _ = &serve_state;
    });

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    state.stop_workers().await;
    if let Err(e) = state.config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save service config on shutdown");
    }

    info!("pattern-realtime shut down complete");
    Ok(())
}
