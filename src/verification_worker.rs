// =============================================================================
// VerificationWorker — closes the loop on every prediction exactly once
// =============================================================================
//
// Grounded on `original_source/verification_worker.py`. Start/Stop lifecycle
// uses a `tokio::sync::Notify` stop signal plus a `JoinHandle`, following the
// teacher's exit-monitor loop shape (`run_exit_monitor`) rather than a raw
// `while true`.
//
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::hub::{Envelope, OutboundKind, SubscriptionHub};
use crate::price_source::PriceSource;
use crate::store::{Prediction, PredictionStore};
use crate::types::round4;

#[derive(Debug, Clone, Copy)]
pub struct VerificationWorkerConfig {
    pub check_interval: Duration,
    pub batch_size: i64,
}

impl Default for VerificationWorkerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            batch_size: 50,
        }
    }
}

#[derive(Debug, Default)]
pub struct VerificationStats {
    pub total_verified: AtomicU64,
    pub total_correct: AtomicU64,
}

/// Background worker that verifies matured predictions.
pub struct VerificationWorker {
    store: Arc<PredictionStore>,
    hub: Arc<SubscriptionHub>,
    price_source: Arc<dyn PriceSource>,
    config: VerificationWorkerConfig,
    stats: Arc<VerificationStats>,
    stop: Arc<Notify>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl VerificationWorker {
    pub fn new(
        store: Arc<PredictionStore>,
        hub: Arc<SubscriptionHub>,
        price_source: Arc<dyn PriceSource>,
        config: VerificationWorkerConfig,
    ) -> Self {
        Self {
            store,
            hub,
            price_source,
            config,
            stats: Arc::new(VerificationStats::default()),
            stop: Arc::new(Notify::new()),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.total_verified.load(Ordering::Relaxed),
            self.stats.total_correct.load(Ordering::Relaxed),
        )
    }

    /// Start the background loop. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            warn!("verification worker already running");
            return;
        }

        let worker = Arc::clone(self);
        let stop = Arc::clone(&self.stop);
        let interval_duration = self.config.check_interval;

        let join = tokio::spawn(async move {
            info!(interval_secs = interval_duration.as_secs(), "verification worker started");
            let mut ticker = interval(interval_duration);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = worker.verify_pending().await {
                            error!(error = %e, "verification pass failed");
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
            info!("verification worker stopped");
        });

        *guard = Some(join);
    }

    /// Signal the loop to stop and wait for the in-flight pass to finish.
    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            self.stop.notify_one();
            let _ = handle.await;
        }
    }

    /// Run one verification pass; returns the number of predictions
    /// successfully verified.
    pub async fn verify_pending(&self) -> Result<usize, StoreError> {
        let pending = self.store.get_pending_predictions(self.config.batch_size).await?;
        if pending.is_empty() {
            debug!("no pending predictions to verify");
            return Ok(0);
        }

        info!(count = pending.len(), "verifying predictions");
        let mut verified = 0;
        for prediction in &pending {
            match self.verify_single(prediction).await {
                Ok(true) => verified += 1,
                Ok(false) => {}
                Err(e) => warn!(prediction_id = %prediction.id, error = %e, "failed to verify prediction"),
            }
        }
        info!(verified, total = pending.len(), "verification pass complete");
        Ok(verified)
    }

    async fn verify_single(&self, prediction: &Prediction) -> Result<bool, StoreError> {
        let current_price = match self.price_source.get_price(&prediction.symbol).await {
            Some(p) => p,
            None => {
                debug!(symbol = %prediction.symbol, "no price available yet, deferring to next pass");
                return Ok(false);
            }
        };

        let actual_return = (current_price - prediction.price_at_scan) / prediction.price_at_scan * 100.0;
        let (was_correct, pnl) = match prediction.direction {
            crate::types::Direction::UP => (actual_return > 0.0, actual_return),
            crate::types::Direction::DOWN => (actual_return < 0.0, -actual_return),
        };

        let actual_return = round4(actual_return);
        let pnl = round4(pnl);

        match self
            .store
            .verify_prediction(&prediction.id, current_price, actual_return, was_correct, pnl)
            .await
        {
            Ok(()) => {}
            Err(StoreError::AlreadyVerified(_)) => {
                debug!(prediction_id = %prediction.id, "already verified by another worker");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.stats.total_verified.fetch_add(1, Ordering::Relaxed);
        if was_correct {
            self.stats.total_correct.fetch_add(1, Ordering::Relaxed);
        }

        self.hub.broadcast_all(Envelope {
            job_id: None,
            kind: OutboundKind::Verification {
                prediction_id: prediction.id.clone(),
                symbol: prediction.symbol.clone(),
                actual_return,
                was_correct,
                pnl,
                verified_at: chrono::Utc::now(),
            },
        });

        info!(
            symbol = %prediction.symbol,
            direction = %prediction.direction,
            actual_return,
            was_correct,
            pnl,
            "prediction verified"
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_source::SimulatedPriceSource;
    use crate::store::{JobParams, Prediction};
    use crate::types::Direction;

    fn sample_prediction(id: &str, job_id: &str, direction: Direction, scan_time: chrono::DateTime<chrono::Utc>) -> Prediction {
        Prediction {
            id: id.to_string(),
            job_id: job_id.to_string(),
            symbol: "AAA".into(),
            scan_time,
            horizon: 10,
            prob_up: 0.7,
            prob_down: 0.3,
            mean_return: 0.8,
            edge: 0.56,
            direction,
            n_neighbors: 50,
            dist1: Some(0.1),
            p10: Some(-0.5),
            p90: Some(1.4),
            price_at_scan: 100.0,
            price_at_horizon: None,
            actual_return: None,
            was_correct: None,
            pnl: None,
            verified_at: None,
        }
    }

    #[tokio::test]
    async fn verifies_matured_prediction_with_expected_return() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let prices = SimulatedPriceSource::new();
        prices.set_price("AAA", 101.0);

        let params = JobParams {
            symbols: vec!["AAA".into()],
            k: 50,
            horizon: 10,
            alpha: 0.05,
            min_edge: 0.0,
            cross_asset: false,
        };
        store.create_job("job-1", &params, 1).await.unwrap();
        let matured = chrono::Utc::now() - chrono::Duration::minutes(11);
        let p = sample_prediction("pred-1", "job-1", Direction::UP, matured);
        store.insert_prediction(&p).await.unwrap();

        let worker = VerificationWorker::new(
            store.clone(),
            hub,
            Arc::new(prices),
            VerificationWorkerConfig::default(),
        );

        let verified = worker.verify_pending().await.unwrap();
        assert_eq!(verified, 1);

        let status = store
            .get_job_status("job-1", crate::types::SortBy::Edge, None, 10)
            .await
            .unwrap()
            .unwrap();
        let pred = &status.results[0];
        assert!(pred.verified_at.is_some());
        assert!((pred.actual_return.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(pred.was_correct, Some(true));
        assert!((pred.pnl.unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_price_defers_without_error() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let prices = SimulatedPriceSource::new();

        let params = JobParams {
            symbols: vec!["AAA".into()],
            k: 50,
            horizon: 10,
            alpha: 0.05,
            min_edge: 0.0,
            cross_asset: false,
        };
        store.create_job("job-1", &params, 1).await.unwrap();
        let matured = chrono::Utc::now() - chrono::Duration::minutes(11);
        let p = sample_prediction("pred-1", "job-1", Direction::UP, matured);
        store.insert_prediction(&p).await.unwrap();

        let worker = VerificationWorker::new(store.clone(), hub, Arc::new(prices), VerificationWorkerConfig::default());
        let verified = worker.verify_pending().await.unwrap();
        assert_eq!(verified, 0);

        let pending = store.get_pending_predictions(10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn second_concurrent_verify_reports_already_verified() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let prices = SimulatedPriceSource::new();
        prices.set_price("AAA", 101.0);

        let params = JobParams {
            symbols: vec!["AAA".into()],
            k: 50,
            horizon: 10,
            alpha: 0.05,
            min_edge: 0.0,
            cross_asset: false,
        };
        store.create_job("job-1", &params, 1).await.unwrap();
        let matured = chrono::Utc::now() - chrono::Duration::minutes(11);
        let p = sample_prediction("pred-1", "job-1", Direction::UP, matured);
        store.insert_prediction(&p).await.unwrap();

        let worker_a = VerificationWorker::new(
            store.clone(),
            hub.clone(),
            Arc::new(prices.clone()),
            VerificationWorkerConfig::default(),
        );
        let worker_b = VerificationWorker::new(store.clone(), hub, Arc::new(prices), VerificationWorkerConfig::default());

        let (a, b) = tokio::join!(worker_a.verify_pending(), worker_b.verify_pending());
        let total_verified = a.unwrap() + b.unwrap();
        assert_eq!(total_verified, 1);
    }
}
