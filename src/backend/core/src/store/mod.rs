//! Job persistence.
//!
//! Every backend implements [`JobStore`]. The engine talks to a
//! [`FallbackStore`] that routes each call to the first healthy tier.
//!
//! ```text
//! QueueEngine ──▶ FallbackStore ──▶ redis ──▶ supabase ──▶ postgres ──▶ memory
//!                  (breaker + timeout per tier, falls through on store failure)
//! ```

pub mod circuit_breaker;
pub mod fallback;
pub mod memory;
pub mod postgres;
pub mod redis;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, StoreKind};
use crate::error::Result;
use crate::jobs::job::{JobId, JobPriority, JobRecord, JobStatus, JobUpdate};

pub use self::circuit_breaker::{CircuitBreaker, CircuitState};
pub use self::fallback::{FallbackStore, TierStatus};
pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;
pub use self::redis::RedisStore;
pub use self::supabase::SupabaseStore;

/// Persistence contract for job records.
///
/// Implementations must make [`JobStore::claim`] and [`JobStore::update`]
/// atomic per record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Short backend name used in logs, metrics and health output.
    fn name(&self) -> &'static str;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;

    /// Insert a new record.
    async fn create(&self, job: &JobRecord) -> Result<JobId>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Apply a partial update and return the updated record.
    /// Fails with `RecordNotFound` if the id is unknown.
    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<JobRecord>;

    /// Atomically move an eligible job with attempts left into `processing`,
    /// incrementing `attempts`. Returns `None` if the job is missing, not
    /// eligible at `now`, out of attempts, or was claimed by someone else.
    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>>;

    /// Up to `limit` jobs eligible at `now`, ordered by the position of their
    /// priority in `priority_order` and then by creation time.
    ///
    /// Eligible means `pending` or `failed` with the retry timer elapsed.
    /// Jobs out of attempts are included so the dispatcher can move them to
    /// `dead_letter`; every backend must return them.
    async fn list_eligible(
        &self,
        limit: usize,
        priority_order: &[JobPriority],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>>;

    /// Up to `limit` jobs in `processing` last updated before `cutoff`,
    /// oldest first.
    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>>;

    /// Delete jobs in `statuses` last updated before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[JobStatus]) -> Result<u64>;
}

/// Order `jobs` for [`JobStore::list_eligible`] and cut to `limit`.
pub(crate) fn order_eligible(
    mut jobs: Vec<JobRecord>,
    limit: usize,
    priority_order: &[JobPriority],
) -> Vec<JobRecord> {
    jobs.retain(|job| priority_order.contains(&job.priority));
    jobs.sort_by_key(|job| {
        let rank = priority_order
            .iter()
            .position(|p| *p == job.priority)
            .unwrap_or(usize::MAX);
        (rank, job.created_at)
    });
    jobs.truncate(limit);
    jobs
}

/// Oldest first, cut to `limit`, for [`JobStore::list_stale`].
pub(crate) fn order_stale(mut jobs: Vec<JobRecord>, limit: usize) -> Vec<JobRecord> {
    jobs.sort_by_key(|job| job.updated_at);
    jobs.truncate(limit);
    jobs
}

/// Build the configured tiers in order.
///
/// Tiers that cannot be constructed (missing URL, bad credentials, refused
/// connection) are logged and left out; the fallback router probes the rest.
pub async fn connect_tiers(config: &Config) -> Vec<Arc<dyn JobStore>> {
    let mut tiers: Vec<Arc<dyn JobStore>> = Vec::new();

    for kind in &config.store.tiers {
        let built: Result<Option<Arc<dyn JobStore>>> = match kind {
            StoreKind::Redis => RedisStore::connect(&config.redis)
                .await
                .map(|s| Some(Arc::new(s) as Arc<dyn JobStore>)),
            StoreKind::Supabase => SupabaseStore::from_config(&config.supabase)
                .map(|s| s.map(|s| Arc::new(s) as Arc<dyn JobStore>)),
            StoreKind::Postgres => PostgresStore::from_config(&config.database)
                .await
                .map(|s| s.map(|s| Arc::new(s) as Arc<dyn JobStore>)),
            StoreKind::Memory => Ok(Some(Arc::new(MemoryStore::new()) as Arc<dyn JobStore>)),
        };

        match built {
            Ok(Some(store)) => {
                tracing::info!(store = store.name(), "Store tier configured");
                tiers.push(store);
            }
            Ok(None) => {
                tracing::info!(tier = ?kind, "Store tier not configured, skipping");
            }
            Err(e) => {
                tracing::warn!(tier = ?kind, error = %e, "Store tier unavailable at startup, skipping");
            }
        }
    }

    let has_memory = config.store.tiers.contains(&StoreKind::Memory);
    if config.store.memory_fallback && !has_memory {
        tracing::info!("Appending in-process memory store as last tier");
        tiers.push(Arc::new(MemoryStore::new()));
    }

    tiers
}
