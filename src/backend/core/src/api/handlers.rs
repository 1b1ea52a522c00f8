//! API request handlers.
//!
//! Handlers return `Result<impl IntoResponse, QueueError>`; errors render
//! through the `IntoResponse` implementation on `QueueError`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::{ApiResponse, AppState};
use crate::error::{ErrorCode, QueueError};
use crate::jobs::{JobId, JobPriority, QueueStats, ResearchRequest, WorkerStatsSnapshot};

// ═══════════════════════════════════════════════════════════════════════════════
// Health and Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// GET /health - 200 while any store tier answers, 503 otherwise
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check_health().await;
    let status = StatusCode::from_u16(report.http_status()).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (status, Json(report))
}

/// GET /metrics - Prometheus text format
pub async fn prometheus_metrics(State(state): State<AppState>) -> axum::response::Response {
    match state.metrics {
        Some(ref handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            crate::telemetry::render(handle),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error_with_code("Metrics are disabled", "METRICS_DISABLED")),
        )
            .into_response(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    pub owner_id: String,
    #[serde(flatten)]
    pub request: ResearchRequest,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

/// POST /api/v1/jobs
pub async fn create_job(
    State(state): State<AppState>,
    body: Result<Json<EnqueueJobRequest>, JsonRejection>,
) -> Result<impl IntoResponse, QueueError> {
    let Json(req) = body.map_err(|e| {
        QueueError::with_internal(ErrorCode::InvalidInput, "Malformed job request", e.body_text())
    })?;

    let priority = match req.priority.as_deref() {
        Some(raw) => raw.parse()?,
        None => JobPriority::default(),
    };

    let receipt = state
        .engine
        .enqueue(&req.owner_id, &req.request, priority, req.metadata.unwrap_or_default())
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(receipt))))
}

/// GET /api/v1/jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, QueueError> {
    let id: JobId = id.parse()?;
    let job = state.engine.get_job(id).await?;
    Ok(Json(ApiResponse::success(job)))
}

/// POST /api/v1/jobs/process - run one batch now
pub async fn process_batch(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.process_batch().await;
    Json(ApiResponse::success(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    /// Single window for every terminal status, e.g. `"24h"`
    #[serde(default, with = "humantime_serde")]
    pub older_than: Option<Duration>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: u64,
}

/// POST /api/v1/jobs/cleanup - body is optional
pub async fn cleanup(
    State(state): State<AppState>,
    body: Option<Json<CleanupRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(req)| req).unwrap_or_default();
    let deleted = match request.older_than {
        Some(window) => state.engine.cleanup_older_than(window).await,
        None => state.engine.cleanup().await,
    };
    Json(ApiResponse::success(CleanupResponse { deleted }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    pub queue: QueueStats,
    pub worker: WorkerStatsSnapshot,
}

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.engine.stats().await;
    let worker = state.engine.worker_stats().snapshot();
    Json(ApiResponse::success(StatsResponse { queue, worker }))
}
