#![allow(clippy::result_large_err)]
//! # Research Queue Core
//!
//! Durable retry queue for AI research requests.
//!
//! ## Architecture
//!
//! - **Jobs**: job records, validation, backoff, the queue engine and its scheduler
//! - **Store**: Redis, Supabase and Postgres tiers behind a fallback router, plus an
//!   in-process memory store
//! - **Research**: client for the downstream research service
//! - **Health**: per-tier reachability and overall status
//! - **API**: axum control surface (enqueue, job lookup, batch, cleanup, stats)
//! - **Telemetry**: structured logging, OTLP tracing and Prometheus metrics

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod jobs;
pub mod research;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, QueueError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, QueueError, Result};
    pub use crate::jobs::{
        EnqueueReceipt, JobId, JobPriority, JobRecord, JobStatus, QueueEngine, QueueStats,
        ResearchRequest, RetryPolicy,
    };
    pub use crate::research::{HttpResearchClient, ResearchClient, ResearchReport};
    pub use crate::store::{FallbackStore, JobStore, MemoryStore};
}
