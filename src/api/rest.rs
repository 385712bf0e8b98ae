// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/pattern-realtime/`. `health` is public; `run`
// and `cancel` are guarded by the optional admin token (see `api::auth`);
// everything else is read-only and left open, matching the original
// service's router.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::scan_engine::{ScanRequest, ScanRequestError};
use crate::types::{Direction, SortBy};

#[derive(Serialize)]
struct ScanRequestErrorResponse {
    error: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/pattern-realtime/health", get(health))
        .route("/pattern-realtime/history", get(history))
        .route("/pattern-realtime/performance", get(performance))
        .route("/pattern-realtime/run", post(run_scan))
        .route("/pattern-realtime/job/:id", get(job_status))
        .route("/pattern-realtime/job/:id/cancel", post(cancel_job))
        .route("/ws/pattern-realtime", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    total_jobs: i64,
    pending_predictions: i64,
    active_connections: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.health_counts().await {
        Ok((total_jobs, pending_predictions)) => Json(HealthResponse {
            status: "ok",
            total_jobs,
            pending_predictions,
            active_connections: state.hub.active_connections(),
            server_time: chrono::Utc::now().timestamp_millis(),
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Run a scan job
// =============================================================================

#[derive(Deserialize)]
struct RunScanRequest {
    symbols: Vec<String>,
    #[serde(default)]
    k: Option<u32>,
    #[serde(default)]
    horizon: Option<i64>,
    #[serde(default)]
    alpha: Option<f64>,
    #[serde(default)]
    min_edge: Option<f64>,
    #[serde(default)]
    cross_asset: bool,
    #[serde(default)]
    parallel: bool,
}

#[derive(Serialize)]
struct RunScanResponse {
    job_id: String,
}

async fn run_scan(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunScanRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ScanRequestErrorResponse>)> {
    let request = ScanRequest {
        symbols: req.symbols,
        k: req.k.unwrap_or(state.config.default_k),
        horizon: req.horizon.unwrap_or(state.config.default_horizon),
        alpha: req.alpha.unwrap_or(state.config.default_alpha),
        min_edge: req.min_edge.unwrap_or(state.config.default_min_edge),
        cross_asset: req.cross_asset,
    };

    let result = if req.parallel {
        state
            .scan_engine
            .run_parallel(request, state.config.max_scan_concurrency)
            .await
    } else {
        state.scan_engine.run(request).await
    };

    match result {
        Ok(job_id) => {
            info!(job_id = %job_id, "scan job started");
            Ok(Json(RunScanResponse { job_id }))
        }
        Err(ScanRequestError::EmptySymbols) => Err((
            StatusCode::BAD_REQUEST,
            Json(ScanRequestErrorResponse {
                error: "symbols list must not be empty".to_string(),
            }),
        )),
    }
}

// =============================================================================
// Job status
// =============================================================================

#[derive(Deserialize)]
struct JobStatusQuery {
    #[serde(default)]
    sort_by: Option<SortBy>,
    #[serde(default)]
    direction: Option<Direction>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    500
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<JobStatusQuery>,
) -> impl IntoResponse {
    match state
        .store
        .get_job_status(&id, query.sort_by.unwrap_or_default(), query.direction, query.limit)
        .await
    {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("job {id} not found") })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, job_id = %id, "failed to fetch job status");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Cancel a job
// =============================================================================

#[derive(Serialize)]
struct CancelResponse {
    job_id: String,
    cancelled: bool,
}

async fn cancel_job(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let cancelled = state.scan_engine.cancel(&id);
    if cancelled {
        info!(job_id = %id, "scan job cancelled");
    }
    Json(CancelResponse { job_id: id, cancelled })
}

// =============================================================================
// Performance stats
// =============================================================================

#[derive(Deserialize)]
struct PerformanceQuery {
    #[serde(default = "default_period")]
    period: String,
}

fn default_period() -> String {
    "all".to_string()
}

async fn performance(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PerformanceQuery>,
) -> impl IntoResponse {
    match state.store.get_performance_stats(&query.period).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to compute performance stats");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Recent job history
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

async fn history(State(state): State<Arc<AppState>>, Query(query): Query<HistoryQuery>) -> impl IntoResponse {
    match state.store.get_recent_jobs(query.limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to fetch job history");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
