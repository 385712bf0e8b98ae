// =============================================================================
// PriceTracker — continuous unrealized PnL broadcast for live predictions
// =============================================================================
//
// Grounded on `original_source/price_tracker.py::_polling_fallback` /
// `_broadcast_price_update`: no streaming price subscription, just a fixed
// poll interval over the currently-active (unverified, unmatured) prediction
// set, batched per distinct symbol.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::hub::{Envelope, OutboundKind, PriceUpdateWire, SubscriptionHub};
use crate::price_source::PriceSource;
use crate::store::{Prediction, PredictionStore};
use crate::types::{round4, Direction};

#[derive(Debug, Clone, Copy)]
pub struct PriceTrackerConfig {
    pub poll_interval: Duration,
}

impl Default for PriceTrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
        }
    }
}

/// Background worker that broadcasts live unrealized PnL for every
/// still-pending, still-maturing prediction.
pub struct PriceTracker {
    store: Arc<PredictionStore>,
    hub: Arc<SubscriptionHub>,
    price_source: Arc<dyn PriceSource>,
    config: PriceTrackerConfig,
    stop: Arc<Notify>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PriceTracker {
    pub fn new(
        store: Arc<PredictionStore>,
        hub: Arc<SubscriptionHub>,
        price_source: Arc<dyn PriceSource>,
        config: PriceTrackerConfig,
    ) -> Self {
        Self {
            store,
            hub,
            price_source,
            config,
            stop: Arc::new(Notify::new()),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            warn!("price tracker already running");
            return;
        }

        let tracker = Arc::clone(self);
        let stop = Arc::clone(&self.stop);
        let interval_duration = self.config.poll_interval;

        let join = tokio::spawn(async move {
            info!(interval_secs = interval_duration.as_secs(), "price tracker started");
            let mut ticker = interval(interval_duration);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.broadcast_live_pnl().await {
                            error!(error = %e, "price tracker pass failed");
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
            info!("price tracker stopped");
        });

        *guard = Some(join);
    }

    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.stop.notify_one();
            let _ = handle.await;
        }
    }

    /// One polling pass: fetch all active predictions, batch-fetch current
    /// prices for their distinct symbols, broadcast a `price_update` for
    /// every prediction a price was found for. Returns the number broadcast.
    pub async fn broadcast_live_pnl(&self) -> Result<usize, StoreError> {
        let active = self.store.get_active_predictions().await?;
        if active.is_empty() {
            debug!("no active predictions to track");
            return Ok(0);
        }

        let symbols: Vec<String> = {
            let mut set: Vec<String> = active.iter().map(|p| p.symbol.clone()).collect();
            set.sort();
            set.dedup();
            set
        };

        let prices = self.price_source.get_prices(&symbols).await;
        if prices.is_empty() {
            debug!(symbols = symbols.len(), "no live prices available this pass");
            return Ok(0);
        }

        let mut sent = 0;
        for prediction in &active {
            if let Some(&price) = prices.get(&prediction.symbol) {
                self.broadcast_one(prediction, price);
                sent += 1;
            }
        }
        debug!(sent, tracked = active.len(), "price tracker pass complete");
        Ok(sent)
    }

    fn broadcast_one(&self, prediction: &Prediction, current_price: f64) {
        let unrealized_return =
            (current_price - prediction.price_at_scan) / prediction.price_at_scan * 100.0;
        let (is_currently_correct, unrealized_pnl) = match prediction.direction {
            Direction::UP => (unrealized_return > 0.0, unrealized_return),
            Direction::DOWN => (unrealized_return < 0.0, -unrealized_return),
        };

        let minutes_remaining = {
            let secs = (prediction.matures_at() - Utc::now()).num_seconds().max(0) as f64;
            (secs / 60.0 * 100.0).round() / 100.0
        };

        self.hub.broadcast_all(Envelope {
            job_id: Some(prediction.job_id.clone()),
            kind: OutboundKind::PriceUpdate {
                price_update: PriceUpdateWire {
                    prediction_id: prediction.id.clone(),
                    job_id: prediction.job_id.clone(),
                    symbol: prediction.symbol.clone(),
                    current_price,
                    price_at_scan: prediction.price_at_scan,
                    unrealized_return: round4(unrealized_return),
                    unrealized_pnl: round4(unrealized_pnl),
                    direction: prediction.direction.to_string(),
                    is_currently_correct,
                    minutes_remaining,
                    timestamp: Utc::now(),
                },
            },
        });
    }
}
