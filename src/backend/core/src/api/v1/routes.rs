//! V1 API routes.

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::{handlers, AppState};

/// V1 API prefix.
pub const V1_PREFIX: &str = "/api/v1";

/// Build the V1 API router.
///
/// ## Jobs
/// - `POST /api/v1/jobs` - Enqueue a research job
/// - `GET /api/v1/jobs/:id` - Get a job record
/// - `POST /api/v1/jobs/process` - Run one batch now
/// - `POST /api/v1/jobs/cleanup` - Delete old terminal jobs
///
/// ## System
/// - `GET /api/v1/stats` - Queue and worker statistics
pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(handlers::create_job))
        .route("/jobs/process", post(handlers::process_batch))
        .route("/jobs/cleanup", post(handlers::cleanup))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/stats", get(handlers::get_stats))
}
