// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth wiring every subsystem together: persistence,
// the WebSocket hub, the external matcher/price adapters, the scan engine,
// and the two background workers. All subsystems hold `Arc` references of
// their own; `AppState` just ties them together and is itself wrapped in a
// single `Arc` shared across every async task and Axum handler.
//
// =============================================================================

use std::sync::Arc;

use crate::hub::SubscriptionHub;
use crate::matcher::{HttpPatternMatcher, PatternMatcher};
use crate::price_source::{HttpPriceSource, PriceSource};
use crate::price_tracker::{PriceTracker, PriceTrackerConfig};
use crate::runtime_config::ServiceConfig;
use crate::scan_engine::ScanEngine;
use crate::store::PredictionStore;
use crate::verification_worker::{VerificationWorker, VerificationWorkerConfig};

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: ServiceConfig,
    pub store: Arc<PredictionStore>,
    pub hub: Arc<SubscriptionHub>,
    pub matcher: Arc<dyn PatternMatcher>,
    pub price_source: Arc<dyn PriceSource>,
    pub scan_engine: Arc<ScanEngine>,
    pub verification_worker: Arc<VerificationWorker>,
    pub price_tracker: Arc<PriceTracker>,
}

impl AppState {
    /// Construct the full application state from a connected store and the
    /// given configuration. Production adapters (`HttpPatternMatcher`,
    /// `HttpPriceSource`) are wired by default; tests build `AppState`'s
    /// pieces directly instead of going through this constructor.
    pub fn new(config: ServiceConfig, store: PredictionStore) -> Self {
        let store = Arc::new(store);
        let hub = Arc::new(SubscriptionHub::new());

        let matcher: Arc<dyn PatternMatcher> =
            Arc::new(HttpPatternMatcher::new(config.matcher_base_url.clone()));
        let price_source: Arc<dyn PriceSource> = Arc::new(HttpPriceSource::new(
            config.price_snapshot_base_url.clone(),
            config.price_aggs_base_url.clone(),
            config.price_api_key.clone(),
        ));

        let scan_engine = Arc::new(ScanEngine::new(store.clone(), hub.clone(), matcher.clone()));

        let verification_worker = Arc::new(VerificationWorker::new(
            store.clone(),
            hub.clone(),
            price_source.clone(),
            VerificationWorkerConfig {
                check_interval: tokio::time::Duration::from_secs(config.verification_check_interval_secs),
                batch_size: 50,
            },
        ));

        let price_tracker = Arc::new(PriceTracker::new(
            store.clone(),
            hub.clone(),
            price_source.clone(),
            PriceTrackerConfig {
                poll_interval: tokio::time::Duration::from_secs(config.price_poll_interval_secs),
            },
        ));

        Self {
            config,
            store,
            hub,
            matcher,
            price_source,
            scan_engine,
            verification_worker,
            price_tracker,
        }
    }

    /// Start the two background workers. Idempotent.
    pub fn start_workers(&self) {
        self.verification_worker.start();
        self.price_tracker.start();
    }

    /// Stop the two background workers, waiting for the in-flight pass of
    /// each to finish.
    pub async fn stop_workers(&self) {
        self.verification_worker.stop().await;
        self.price_tracker.stop().await;
    }
}
