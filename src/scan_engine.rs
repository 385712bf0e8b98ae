// =============================================================================
// ScanEngine — runs a batch pattern-scan job end-to-end
// =============================================================================
//
// Grounded on `original_source/engine.py::RealtimeEngine`. Cancellation is
// modeled as a per-job `Arc<AtomicBool>` flag in a shared map (spec §9 calls
// for a token carried by the job context) -- an `Arc` rather than a plain
// `bool` so `run_parallel`'s spawned tasks can each hold their own cheap
// clone and check it without borrowing the engine across `'static` spawns.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ScanError;
use crate::hub::{Envelope, OutboundKind, PredictionWire, SubscriptionHub};
use crate::matcher::PatternMatcher;
use crate::store::{Failure, JobParams, Prediction, PredictionStore};
use crate::types::{Direction, FailureCode, JobStatus};

/// Clock abstraction so tests can inject a fixed or advancing "now" rather
/// than calling `Utc::now()` deep in business logic, the same way the
/// teacher threads `now_secs` into `BarrierState::evaluate`.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Inbound request to run a batch scan.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub symbols: Vec<String>,
    pub k: u32,
    pub horizon: i64,
    pub alpha: f64,
    pub min_edge: f64,
    pub cross_asset: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanRequestError {
    #[error("symbol list must not be empty")]
    EmptySymbols,
}

/// Batch scan orchestrator.
pub struct ScanEngine {
    store: Arc<PredictionStore>,
    hub: Arc<SubscriptionHub>,
    matcher: Arc<dyn PatternMatcher>,
    clock: Clock,
    active_jobs: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl ScanEngine {
    pub fn new(store: Arc<PredictionStore>, hub: Arc<SubscriptionHub>, matcher: Arc<dyn PatternMatcher>) -> Self {
        Self::with_clock(store, hub, matcher, system_clock())
    }

    pub fn with_clock(
        store: Arc<PredictionStore>,
        hub: Arc<SubscriptionHub>,
        matcher: Arc<dyn PatternMatcher>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            hub,
            matcher,
            clock,
            active_jobs: RwLock::new(HashMap::new()),
        }
    }

    fn normalize_symbols(raw: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for s in raw {
            let s = s.trim().to_uppercase();
            if !s.is_empty() && seen.insert(s.clone()) {
                out.push(s);
            }
        }
        out
    }

    /// Run a batch job sequentially, in input order (spec §4.5 default
    /// policy: ordered progress, deterministic result stream).
    pub async fn run(&self, request: ScanRequest) -> Result<String, ScanRequestError> {
        let symbols = Self::normalize_symbols(&request.symbols);
        if symbols.is_empty() {
            return Err(ScanRequestError::EmptySymbols);
        }

        let job_id = Uuid::new_v4().to_string();
        self.run_with_id(job_id.clone(), symbols, request).await;
        Ok(job_id)
    }

    async fn run_with_id(&self, job_id: String, symbols: Vec<String>, request: ScanRequest) {
        let start_time = (self.clock)();
        let params = JobParams {
            symbols: symbols.clone(),
            k: request.k,
            horizon: request.horizon,
            alpha: request.alpha,
            min_edge: request.min_edge,
            cross_asset: request.cross_asset,
        };

        if let Err(e) = self.store.create_job(&job_id, &params, symbols.len() as i64).await {
            warn!(job_id, error = %e, "failed to create job");
            return;
        }
        self.active_jobs
            .write()
            .insert(job_id.clone(), Arc::new(AtomicBool::new(false)));

        info!(job_id, total_symbols = symbols.len(), "scan job started");

        let mut completed = 0i64;
        let mut failed = 0i64;
        let mut total_results = 0i64;

        for symbol in &symbols {
            if self.is_cancelled(&job_id) {
                info!(job_id, "job cancelled, stopping iteration");
                break;
            }

            let scan_time = (self.clock)();
            match self.scan_symbol(&job_id, symbol, &request, scan_time).await {
                Ok(prediction) => {
                    completed += 1;
                    if prediction.edge >= request.min_edge {
                        total_results += 1;
                        if let Err(e) = self.store.insert_prediction(&prediction).await {
                            warn!(job_id, symbol, error = %e, "failed to persist prediction");
                        } else {
                            self.hub.broadcast_to_job(
                                &job_id,
                                Envelope {
                                    job_id: Some(job_id.clone()),
                                    kind: OutboundKind::Result(Box::new(PredictionWire::from(&prediction))),
                                },
                            );
                        }
                    }
                }
                Err(scan_err) => {
                    failed += 1;
                    let failure = Failure {
                        symbol: symbol.clone(),
                        scan_time,
                        error_code: scan_err.failure_code(),
                        reason: scan_err.to_string(),
                        bars_since_open: None,
                        bars_until_close: None,
                    };
                    if let Err(e) = self.store.insert_failure(&job_id, &failure).await {
                        warn!(job_id, symbol, error = %e, "failed to persist failure");
                    }
                }
            }

            if let Err(e) = self.store.update_job_progress(&job_id, completed, failed).await {
                warn!(job_id, error = %e, "failed to update job progress");
            }
            self.hub.broadcast_to_job(
                &job_id,
                Envelope {
                    job_id: Some(job_id.clone()),
                    kind: OutboundKind::Progress {
                        completed: completed + failed,
                        total: symbols.len() as i64,
                        failed,
                    },
                },
            );
        }

        let cancelled = self.is_cancelled(&job_id);
        let terminal = if cancelled { JobStatus::Cancelled } else { JobStatus::Completed };
        if let Err(e) = self.store.complete_job(&job_id, terminal).await {
            warn!(job_id, error = %e, "failed to finalize job");
        }

        let duration_seconds = ((self.clock)() - start_time).num_milliseconds() as f64 / 1000.0;
        self.hub.broadcast_to_job(
            &job_id,
            Envelope {
                job_id: Some(job_id.clone()),
                kind: OutboundKind::JobComplete {
                    total_results,
                    total_failures: failed,
                    duration_seconds,
                },
            },
        );

        self.active_jobs.write().remove(&job_id);
        info!(job_id, total_results, total_failures = failed, status = %terminal, "scan job finished");
    }

    /// Parallel variant, bounded by `max_concurrency`. Ordering across
    /// symbols is explicitly not guaranteed (spec §9 Open Question
    /// resolution); per-symbol result/progress contracts are unchanged.
    pub async fn run_parallel(&self, request: ScanRequest, max_concurrency: usize) -> Result<String, ScanRequestError> {
        let symbols = Self::normalize_symbols(&request.symbols);
        if symbols.is_empty() {
            return Err(ScanRequestError::EmptySymbols);
        }

        let job_id = Uuid::new_v4().to_string();
        let params = JobParams {
            symbols: symbols.clone(),
            k: request.k,
            horizon: request.horizon,
            alpha: request.alpha,
            min_edge: request.min_edge,
            cross_asset: request.cross_asset,
        };

        if self.store.create_job(&job_id, &params, symbols.len() as i64).await.is_err() {
            return Ok(job_id);
        }
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.active_jobs.write().insert(job_id.clone(), cancel_flag.clone());

        let start_time = (self.clock)();
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let completed = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let failed = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let total_results = Arc::new(std::sync::atomic::AtomicI64::new(0));

        let mut join_set = JoinSet::new();
        for symbol in symbols.clone() {
            let permit = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let hub = Arc::clone(&self.hub);
            let matcher = Arc::clone(&self.matcher);
            let clock = Arc::clone(&self.clock);
            let job_id = job_id.clone();
            let request = request.clone();
            let completed = Arc::clone(&completed);
            let failed = Arc::clone(&failed);
            let total_results = Arc::clone(&total_results);
            let total_symbols = symbols.len() as i64;
            let cancel_flag = Arc::clone(&cancel_flag);

            join_set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore not closed");
                if cancel_flag.load(std::sync::atomic::Ordering::SeqCst) {
                    return;
                }

                let scan_time = clock();
                let outcome = scan_symbol_standalone(&matcher, &symbol, &request, scan_time).await;

                if cancel_flag.load(std::sync::atomic::Ordering::SeqCst) {
                    return;
                }

                match outcome {
                    Ok(prediction) => {
                        completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        if prediction.edge >= request.min_edge {
                            total_results.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            if store.insert_prediction(&prediction).await.is_ok() {
                                hub.broadcast_to_job(
                                    &job_id,
                                    Envelope {
                                        job_id: Some(job_id.clone()),
                                        kind: OutboundKind::Result(Box::new(PredictionWire::from(&prediction))),
                                    },
                                );
                            }
                        }
                    }
                    Err(scan_err) => {
                        failed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        let failure = Failure {
                            symbol: symbol.clone(),
                            scan_time,
                            error_code: scan_err.failure_code(),
                            reason: scan_err.to_string(),
                            bars_since_open: None,
                            bars_until_close: None,
                        };
                        let _ = store.insert_failure(&job_id, &failure).await;
                    }
                }

                let c = completed.load(std::sync::atomic::Ordering::SeqCst);
                let f = failed.load(std::sync::atomic::Ordering::SeqCst);
                let _ = store.update_job_progress(&job_id, c, f).await;
                hub.broadcast_to_job(
                    &job_id,
                    Envelope {
                        job_id: Some(job_id.clone()),
                        kind: OutboundKind::Progress {
                            completed: c + f,
                            total: total_symbols,
                            failed: f,
                        },
                    },
                );
            });
        }

        while join_set.join_next().await.is_some() {}

        let terminal = if self.is_cancelled(&job_id) {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        let _ = self.store.complete_job(&job_id, terminal).await;

        let duration_seconds = ((self.clock)() - start_time).num_milliseconds() as f64 / 1000.0;
        self.hub.broadcast_to_job(
            &job_id,
            Envelope {
                job_id: Some(job_id.clone()),
                kind: OutboundKind::JobComplete {
                    total_results: total_results.load(std::sync::atomic::Ordering::SeqCst),
                    total_failures: failed.load(std::sync::atomic::Ordering::SeqCst),
                    duration_seconds,
                },
            },
        );
        self.active_jobs.write().remove(&job_id);

        Ok(job_id)
    }

    fn is_cancelled(&self, job_id: &str) -> bool {
        self.active_jobs
            .read()
            .get(job_id)
            .map(|flag| flag.load(AtomicOrdering::SeqCst))
            .unwrap_or(false)
    }

    /// Request cancellation of a running job. Returns whether the job was
    /// known (spec §4.5).
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.active_jobs.read().get(job_id) {
            Some(flag) => {
                flag.store(true, AtomicOrdering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn active_job_ids(&self) -> Vec<String> {
        self.active_jobs.read().keys().cloned().collect()
    }

    async fn scan_symbol(
        &self,
        job_id: &str,
        symbol: &str,
        request: &ScanRequest,
        scan_time: DateTime<Utc>,
    ) -> Result<Prediction, ScanError> {
        scan_symbol_standalone(&self.matcher, symbol, request, scan_time)
            .await
            .map(|mut p| {
                p.job_id = job_id.to_string();
                p
            })
    }
}

/// Pure scan-one-symbol logic, free of `self` so it can run inside a spawned
/// task in `run_parallel` without borrowing the engine.
async fn scan_symbol_standalone(
    matcher: &Arc<dyn PatternMatcher>,
    symbol: &str,
    request: &ScanRequest,
    scan_time: DateTime<Utc>,
) -> Result<Prediction, ScanError> {
    if scan_time.weekday().number_from_monday() >= 6 {
        return Err(ScanError::Weekend {
            symbol: symbol.to_string(),
        });
    }

    let search_result = matcher.search(symbol, request.k, request.cross_asset).await?;

    let forecast = search_result.forecast.clone().ok_or_else(|| {
        ScanError::Matcher(crate::error::MatcherError::NoData {
            symbol: symbol.to_string(),
        })
    })?;

    let (direction, edge) = if forecast.prob_up > forecast.prob_down {
        (Direction::UP, forecast.prob_up * forecast.mean_return.abs())
    } else {
        (Direction::DOWN, forecast.prob_down * forecast.mean_return.abs())
    };

    let price_at_scan = search_result.price_at_scan().ok_or_else(|| {
        ScanError::Price(crate::error::PriceError::Unavailable {
            symbol: symbol.to_string(),
            when: "scan".to_string(),
        })
    })?;

    Ok(Prediction {
        id: Uuid::new_v4().to_string(),
        job_id: String::new(),
        symbol: symbol.to_string(),
        scan_time,
        horizon: request.horizon,
        prob_up: crate::types::round4(forecast.prob_up),
        prob_down: crate::types::round4(forecast.prob_down),
        mean_return: crate::types::round4(forecast.mean_return),
        edge: crate::types::round4(edge),
        direction,
        n_neighbors: forecast.n_neighbors,
        dist1: search_result.nearest_distance(),
        p10: forecast.p10,
        p90: forecast.p90,
        price_at_scan,
        price_at_horizon: None,
        actual_return: None,
        was_correct: None,
        pnl: None,
        verified_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Forecast, HistoricalContext, Neighbor, SearchResult, SearchStatus, SimulatedMatcher};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Wraps a `SimulatedMatcher`, pausing on the first call until released
    /// by the test, so a cancellation can be injected deterministically
    /// between the first and second symbol of a batch.
    struct GateMatcher {
        inner: SimulatedMatcher,
        started: Arc<Notify>,
        proceed: Arc<Notify>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl PatternMatcher for GateMatcher {
        async fn search(&self, symbol: &str, k: u32, cross_asset: bool) -> Result<crate::matcher::SearchResult, crate::error::MatcherError> {
            let call_number = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if call_number == 0 {
                self.started.notify_one();
                self.proceed.notified().await;
            }
            self.inner.search(symbol, k, cross_asset).await
        }
    }

    fn weekday_clock(hour_offset_days: i64) -> Clock {
        // 2024-01-08 is a Monday.
        let base = DateTime::parse_from_rfc3339("2024-01-08T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let now = base + chrono::Duration::days(hour_offset_days);
        Arc::new(move || now)
    }

    fn success_fixture(prob_up: f64, prob_down: f64, mean_return: f64, price_at_scan: f64) -> SearchResult {
        SearchResult {
            status: SearchStatus::Success,
            error: None,
            forecast: Some(Forecast {
                prob_up,
                prob_down,
                mean_return,
                n_neighbors: 50,
                p10: Some(-0.5),
                p90: Some(1.4),
            }),
            neighbors: vec![Neighbor { distance: 0.1 }],
            historical_context: HistoricalContext {
                pattern_prices: vec![price_at_scan],
            },
        }
    }

    #[tokio::test]
    async fn scan_s1_happy_path_two_symbols() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let matcher: Arc<dyn PatternMatcher> = Arc::new(
            SimulatedMatcher::new()
                .with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0))
                .with_fixture("BBB", success_fixture(0.4, 0.6, -1.2, 50.0)),
        );
        let engine = ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(0));

        let job_id = engine
            .run(ScanRequest {
                symbols: vec!["AAA".into(), "BBB".into()],
                k: 50,
                horizon: 10,
                alpha: 0.05,
                min_edge: 0.0,
                cross_asset: false,
            })
            .await
            .unwrap();

        let status = store
            .get_job_status(&job_id, crate::types::SortBy::Edge, None, 50)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.results.len(), 2);
        assert!(status.failures.is_empty());

        let aaa = status.results.iter().find(|p| p.symbol == "AAA").unwrap();
        let bbb = status.results.iter().find(|p| p.symbol == "BBB").unwrap();
        assert_eq!(aaa.direction, Direction::UP);
        assert!((aaa.edge - 0.56).abs() < 1e-9);
        assert_eq!(bbb.direction, Direction::DOWN);
        assert!((bbb.edge - 0.72).abs() < 1e-9);
    }

    #[tokio::test]
    async fn scan_s2_mixed_failure() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let matcher: Arc<dyn PatternMatcher> = Arc::new(
            SimulatedMatcher::new()
                .with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0))
                .with_error("ZZZ", "boom"),
        );
        let engine = ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(0));

        let job_id = engine
            .run(ScanRequest {
                symbols: vec!["AAA".into(), "ZZZ".into()],
                k: 50,
                horizon: 10,
                alpha: 0.05,
                min_edge: 0.0,
                cross_asset: false,
            })
            .await
            .unwrap();

        let status = store
            .get_job_status(&job_id, crate::types::SortBy::Edge, None, 50)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.results.len(), 1);
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].error_code, FailureCode::Matcher);
        assert_eq!(status.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn weekend_scan_fails_every_symbol() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let matcher: Arc<dyn PatternMatcher> = Arc::new(
            SimulatedMatcher::new().with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0)),
        );
        // 2024-01-08 + 5 days = Saturday 2024-01-13.
        let engine = ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(5));

        let job_id = engine
            .run(ScanRequest {
                symbols: vec!["AAA".into()],
                k: 50,
                horizon: 10,
                alpha: 0.05,
                min_edge: 0.0,
                cross_asset: false,
            })
            .await
            .unwrap();

        let status = store
            .get_job_status(&job_id, crate::types::SortBy::Edge, None, 50)
            .await
            .unwrap()
            .unwrap();

        assert!(status.results.is_empty());
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].error_code, FailureCode::Weekend);
    }

    #[tokio::test]
    async fn min_edge_filters_results_but_still_counts_completed() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let matcher: Arc<dyn PatternMatcher> = Arc::new(
            SimulatedMatcher::new().with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0)),
        );
        let engine = ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(0));

        let job_id = engine
            .run(ScanRequest {
                symbols: vec!["AAA".into()],
                k: 50,
                horizon: 10,
                alpha: 0.05,
                min_edge: 999.0,
                cross_asset: false,
            })
            .await
            .unwrap();

        let status = store
            .get_job_status(&job_id, crate::types::SortBy::Edge, None, 50)
            .await
            .unwrap()
            .unwrap();

        assert!(status.results.is_empty());
        assert!(status.failures.is_empty());
        assert_eq!(status.progress.completed, 1);
    }

    #[tokio::test]
    async fn empty_symbol_list_is_rejected_before_any_write() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let matcher: Arc<dyn PatternMatcher> = Arc::new(SimulatedMatcher::new());
        let engine = ScanEngine::with_clock(store, hub, matcher, weekday_clock(0));

        let result = engine
            .run(ScanRequest {
                symbols: vec!["  ".into(), "".into()],
                k: 50,
                horizon: 10,
                alpha: 0.05,
                min_edge: 0.0,
                cross_asset: false,
            })
            .await;

        assert!(matches!(result, Err(ScanRequestError::EmptySymbols)));
    }

    #[tokio::test]
    async fn duplicate_symbols_are_deduplicated() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let matcher: Arc<dyn PatternMatcher> = Arc::new(
            SimulatedMatcher::new().with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0)),
        );
        let engine = ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(0));

        let job_id = engine
            .run(ScanRequest {
                symbols: vec!["aaa".into(), "AAA".into(), " AAA ".into()],
                k: 50,
                horizon: 10,
                alpha: 0.05,
                min_edge: 0.0,
                cross_asset: false,
            })
            .await
            .unwrap();

        let status = store
            .get_job_status(&job_id, crate::types::SortBy::Edge, None, 50)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.progress.total, 1);
    }

    #[tokio::test]
    async fn cancel_stops_further_iteration() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let matcher: Arc<dyn PatternMatcher> = Arc::new(
            SimulatedMatcher::new()
                .with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0))
                .with_fixture("BBB", success_fixture(0.4, 0.6, -1.2, 50.0)),
        );
        let engine = Arc::new(ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(0)));

        // Cancel immediately; with no registered job yet `cancel` returns false,
        // so instead verify the known-job-id contract directly.
        assert!(!engine.cancel("nonexistent"));
    }

    #[tokio::test]
    async fn run_parallel_covers_every_symbol_without_guaranteeing_order() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let matcher: Arc<dyn PatternMatcher> = Arc::new(
            SimulatedMatcher::new()
                .with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0))
                .with_fixture("BBB", success_fixture(0.4, 0.6, -1.2, 50.0))
                .with_fixture("CCC", success_fixture(0.9, 0.1, 2.0, 25.0)),
        );
        let engine = ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(0));

        let job_id = engine
            .run_parallel(
                ScanRequest {
                    symbols: vec!["AAA".into(), "BBB".into(), "CCC".into()],
                    k: 50,
                    horizon: 10,
                    alpha: 0.05,
                    min_edge: 0.0,
                    cross_asset: false,
                },
                2,
            )
            .await
            .unwrap();

        let status = store
            .get_job_status(&job_id, crate::types::SortBy::Edge, None, 50)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.status, JobStatus::Completed);
        assert!(status.failures.is_empty());
        let mut symbols: Vec<_> = status.results.iter().map(|p| p.symbol.clone()).collect();
        symbols.sort();
        assert_eq!(symbols, vec!["AAA".to_string(), "BBB".to_string(), "CCC".to_string()]);
    }

    #[tokio::test]
    async fn cancel_mid_job_stops_remaining_symbols_sequential() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let started = Arc::new(Notify::new());
        let proceed = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let matcher: Arc<dyn PatternMatcher> = Arc::new(GateMatcher {
            inner: SimulatedMatcher::new()
                .with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0))
                .with_fixture("BBB", success_fixture(0.4, 0.6, -1.2, 50.0))
                .with_fixture("CCC", success_fixture(0.9, 0.1, 2.0, 25.0)),
            started: started.clone(),
            proceed: proceed.clone(),
            calls: calls.clone(),
        });
        let engine = Arc::new(ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(0)));

        let run_engine = engine.clone();
        let handle = tokio::spawn(async move {
            run_engine
                .run(ScanRequest {
                    symbols: vec!["AAA".into(), "BBB".into(), "CCC".into()],
                    k: 50,
                    horizon: 10,
                    alpha: 0.05,
                    min_edge: 0.0,
                    cross_asset: false,
                })
                .await
                .unwrap()
        });

        started.notified().await;
        let job_id = engine.active_job_ids().first().cloned().expect("job registered");
        assert!(engine.cancel(&job_id));
        proceed.notify_one();

        let job_id = handle.await.unwrap();

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1, "BBB and CCC must never be scanned");

        let status = store
            .get_job_status(&job_id, crate::types::SortBy::Edge, None, 50)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, JobStatus::Cancelled);
        assert_eq!(status.results.len(), 1);
        assert_eq!(status.results[0].symbol, "AAA");
    }

    #[tokio::test]
    async fn cancel_mid_job_stops_remaining_symbols_parallel() {
        let store = Arc::new(PredictionStore::connect(":memory:").await.unwrap());
        let hub = Arc::new(SubscriptionHub::new());
        let started = Arc::new(Notify::new());
        let proceed = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let matcher: Arc<dyn PatternMatcher> = Arc::new(GateMatcher {
            inner: SimulatedMatcher::new()
                .with_fixture("AAA", success_fixture(0.7, 0.3, 0.8, 100.0))
                .with_fixture("BBB", success_fixture(0.4, 0.6, -1.2, 50.0))
                .with_fixture("CCC", success_fixture(0.9, 0.1, 2.0, 25.0)),
            started: started.clone(),
            proceed: proceed.clone(),
            calls: calls.clone(),
        });
        // Concurrency of 1 makes this deterministic: only one symbol can be
        // in flight through the matcher at a time.
        let engine = Arc::new(ScanEngine::with_clock(store.clone(), hub, matcher, weekday_clock(0)));

        let run_engine = engine.clone();
        let handle = tokio::spawn(async move {
            run_engine
                .run_parallel(
                    ScanRequest {
                        symbols: vec!["AAA".into(), "BBB".into(), "CCC".into()],
                        k: 50,
                        horizon: 10,
                        alpha: 0.05,
                        min_edge: 0.0,
                        cross_asset: false,
                    },
                    1,
                )
                .await
                .unwrap()
        });

        started.notified().await;
        let job_id = engine.active_job_ids().first().cloned().expect("job registered");
        assert!(engine.cancel(&job_id));
        proceed.notify_one();

        let job_id = handle.await.unwrap();

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1, "BBB and CCC must never be scanned");

        let status = store
            .get_job_status(&job_id, crate::types::SortBy::Edge, None, 50)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, JobStatus::Cancelled);
        // Cancellation landed while AAA's own scan was still in flight, so
        // the post-scan check discards it too -- unlike the sequential
        // variant, a parallel task checks the flag both before and after
        // its matcher call.
        assert!(status.results.is_empty());
    }
}
