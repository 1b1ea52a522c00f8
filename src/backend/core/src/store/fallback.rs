//! Tiered store router.
//!
//! Tries tiers in preference order. A tier whose call fails with a store
//! failure (or exceeds the operation timeout) is recorded on its breaker and
//! the call moves to the next tier. Answers about the data itself, such as a
//! missing record or a validation problem, are returned as-is.
//!
//! Tiers do not replicate to each other, so a job lives on the tier that
//! accepted its `create`. Reads and writes of one job go to that tier:
//!
//! | operation                         | tiers asked                                   |
//! |-----------------------------------|-----------------------------------------------|
//! | `create`, `ping`                  | first that answers                            |
//! | `get`                             | cached location first, then each in order     |
//! | `update`, `claim`                 | the tier holding the job                      |
//! | `list_*`, `count`, `delete`       | every tier with a closed circuit, merged      |
//!
//! Where a job lives is cached per id. The cache is only a hint: a miss or a
//! stale entry costs one search.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::{order_eligible, order_stale, JobStore};
use crate::config::StoreConfig;
use crate::error::{QueueError, Result};
use crate::jobs::job::{JobId, JobPriority, JobRecord, JobStatus, JobUpdate};

struct Tier {
    store: Arc<dyn JobStore>,
    breaker: CircuitBreaker,
}

/// Snapshot of one tier for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub name: &'static str,
    pub position: usize,
    pub circuit: CircuitState,
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How one tier handled a call.
enum TierOutcome<T> {
    /// The tier answered; an `Err` is an answer about the data.
    Answered(Result<T>),
    /// The tier failed or timed out. Already recorded on its breaker.
    Failed(QueueError),
}

pub struct FallbackStore {
    tiers: Vec<Tier>,
    operation_timeout: Duration,
    /// Tier index each non-terminal job was last seen on.
    locations: DashMap<JobId, usize>,
}

impl FallbackStore {
    /// Wrap `stores` without probing them.
    pub fn new(stores: Vec<Arc<dyn JobStore>>, config: &StoreConfig) -> Self {
        let tiers = stores
            .into_iter()
            .map(|store| Tier {
                breaker: CircuitBreaker::new(store.name(), config.failure_threshold)
                    .with_recovery_timeout(config.recovery_timeout),
                store,
            })
            .collect();

        Self {
            tiers,
            operation_timeout: config.operation_timeout,
            locations: DashMap::new(),
        }
    }

    /// Wrap `stores` and probe each one; tiers that do not answer start with
    /// their circuit open so the first reachable tier serves traffic.
    pub async fn connect(stores: Vec<Arc<dyn JobStore>>, config: &StoreConfig) -> Self {
        let router = Self::new(stores, config);
        for status in router.probe().await {
            if status.reachable {
                tracing::info!(store = status.name, latency_ms = status.latency_ms, "Store tier reachable");
            } else {
                tracing::warn!(store = status.name, error = ?status.error, "Store tier unreachable at startup");
                router.tiers[status.position].breaker.trip();
            }
        }
        if let Some(active) = router.active_tier() {
            tracing::info!(store = active, "Active job store selected");
        } else {
            tracing::error!("No job store tier reachable at startup");
        }
        router
    }

    /// Name of the first tier whose circuit is not open.
    pub fn active_tier(&self) -> Option<&'static str> {
        self.tiers
            .iter()
            .find(|tier| tier.breaker.state() != CircuitState::Open)
            .map(|tier| tier.store.name())
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|tier| tier.store.name()).collect()
    }

    /// Ping every tier under the operation timeout. Does not touch breakers.
    pub async fn probe(&self) -> Vec<TierStatus> {
        let probes = self.tiers.iter().enumerate().map(|(position, tier)| async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.operation_timeout, tier.store.ping()).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("ping timed out after {:?}", self.operation_timeout)),
            };
            TierStatus {
                name: tier.store.name(),
                position,
                circuit: tier.breaker.state(),
                reachable: error.is_none(),
                latency_ms,
                error,
            }
        });
        join_all(probes).await
    }

    /// Run one call on `tier` under the operation timeout and record the
    /// result on its breaker. The caller must have passed `can_execute`.
    async fn attempt<T, Fut>(&self, tier: &Tier, operation: &'static str, call: Fut) -> TierOutcome<T>
    where
        Fut: Future<Output = Result<T>> + Send,
    {
        let name = tier.store.name();
        let error = match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(Ok(value)) => {
                tier.breaker.record_success();
                return TierOutcome::Answered(Ok(value));
            }
            Ok(Err(e)) if !e.triggers_fallback() => {
                tier.breaker.record_success();
                return TierOutcome::Answered(Err(e));
            }
            Ok(Err(e)) => e,
            Err(_) => QueueError::store_timeout(name, operation),
        };

        tier.breaker.record_failure();
        counter!("rq_store_operation_failures_total", "store" => name, "operation" => operation)
            .increment(1);
        tracing::warn!(store = name, operation, error = %error, "Store tier call failed");
        TierOutcome::Failed(error)
    }

    /// First tier to answer wins. Returns its position with the answer.
    async fn route<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<(usize, T)>
    where
        F: Fn(Arc<dyn JobStore>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut last_error = None;

        for (position, tier) in self.tiers.iter().enumerate() {
            let name = tier.store.name();
            if !tier.breaker.can_execute() {
                tracing::debug!(store = name, operation, "Skipping store tier with open circuit");
                continue;
            }

            match self.attempt(tier, operation, call(tier.store.clone())).await {
                TierOutcome::Answered(Ok(value)) => {
                    if position > 0 {
                        counter!("rq_store_fallbacks_total", "store" => name, "operation" => operation)
                            .increment(1);
                    }
                    return Ok((position, value));
                }
                TierOutcome::Answered(Err(e)) => return Err(e),
                TierOutcome::Failed(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| QueueError::all_stores_unavailable(operation)))
    }

    /// Ask every tier whose circuit admits the call, concurrently. Fails only
    /// if none of them answered.
    async fn gather<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<Vec<(usize, T)>>
    where
        F: Fn(Arc<dyn JobStore>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let calls: Vec<_> = self
            .tiers
            .iter()
            .enumerate()
            .filter(|(_, tier)| tier.breaker.can_execute())
            .map(|(position, tier)| {
                let pending = call(tier.store.clone());
                async move { (position, self.attempt(tier, operation, pending).await) }
            })
            .collect();

        let mut answers = Vec::with_capacity(calls.len());
        let mut last_error = None;
        for (position, outcome) in join_all(calls).await {
            match outcome {
                TierOutcome::Answered(Ok(value)) => answers.push((position, value)),
                TierOutcome::Answered(Err(e)) => return Err(e),
                TierOutcome::Failed(e) => last_error = Some(e),
            }
        }

        if answers.is_empty() {
            return Err(last_error.unwrap_or_else(|| QueueError::all_stores_unavailable(operation)));
        }
        Ok(answers)
    }

    /// Run a call on the tier at `position` only.
    async fn on_tier<T, Fut>(&self, position: usize, operation: &'static str, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>> + Send,
    {
        let tier = &self.tiers[position];
        if !tier.breaker.can_execute() {
            return Err(QueueError::store_unavailable(tier.store.name(), "circuit open"));
        }
        match self.attempt(tier, operation, call).await {
            TierOutcome::Answered(result) => result,
            TierOutcome::Failed(e) => Err(e),
        }
    }

    fn remember(&self, job: &JobRecord, position: usize) {
        if job.status.is_terminal() {
            self.locations.remove(&job.id);
        } else {
            self.locations.insert(job.id, position);
        }
    }

    fn cached(&self, id: JobId) -> Option<usize> {
        self.locations.get(&id).map(|entry| *entry)
    }

    /// Look `id` up tier by tier, cached location first.
    ///
    /// A miss is only reported as `None` if no tier failed along the way;
    /// otherwise the job may be on the tier that could not answer.
    async fn find(&self, id: JobId) -> Result<Option<(usize, JobRecord)>> {
        let cached = self.cached(id);
        let order = cached
            .into_iter()
            .chain((0..self.tiers.len()).filter(|position| Some(*position) != cached));

        let mut answered = false;
        let mut last_error = None;
        for position in order {
            let tier = &self.tiers[position];
            if !tier.breaker.can_execute() {
                continue;
            }
            match self.attempt(tier, "get", tier.store.get(id)).await {
                TierOutcome::Answered(Ok(Some(job))) => {
                    self.remember(&job, position);
                    return Ok(Some((position, job)));
                }
                TierOutcome::Answered(Ok(None)) => answered = true,
                TierOutcome::Answered(Err(e)) => return Err(e),
                TierOutcome::Failed(e) => last_error = Some(e),
            }
        }

        self.locations.remove(&id);
        match last_error {
            Some(e) => Err(e),
            None if answered => Ok(None),
            None => Err(QueueError::all_stores_unavailable("get")),
        }
    }

    /// Flatten per-tier listings, keeping the first copy of each id and
    /// caching where it came from.
    fn merge(&self, answers: Vec<(usize, Vec<JobRecord>)>) -> Vec<JobRecord> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for (position, jobs) in answers {
            for job in jobs {
                if seen.insert(job.id) {
                    self.remember(&job, position);
                    merged.push(job);
                }
            }
        }
        merged
    }

    /// Position of the tier holding `id`, from the cache or a fresh search.
    async fn locate(&self, id: JobId) -> Result<Option<usize>> {
        match self.cached(id) {
            Some(position) => Ok(Some(position)),
            None => Ok(self.find(id).await?.map(|(position, _)| position)),
        }
    }
}

#[async_trait]
impl JobStore for FallbackStore {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn ping(&self) -> Result<()> {
        self.route("ping", |store| async move { store.ping().await }).await?;
        Ok(())
    }

    async fn create(&self, job: &JobRecord) -> Result<JobId> {
        let (position, id) = self
            .route("create", |store| async move { store.create(job).await })
            .await?;
        self.remember(job, position);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.find(id).await?.map(|(_, job)| job))
    }

    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<JobRecord> {
        let mut searched = self.cached(id).is_none();
        let mut position = self.locate(id).await?;

        loop {
            let Some(at) = position else {
                return Err(QueueError::job_not_found(id));
            };
            match self.on_tier(at, "update", self.tiers[at].store.update(id, update)).await {
                Ok(job) => {
                    self.remember(&job, at);
                    return Ok(job);
                }
                // Cached location was stale
                Err(e) if e.is_not_found() && !searched => {
                    self.locations.remove(&id);
                    searched = true;
                    position = self.find(id).await?.map(|(position, _)| position);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let Some(position) = self.locate(id).await? else {
            return Ok(None);
        };
        let claimed = self
            .on_tier(position, "claim", self.tiers[position].store.claim(id, now))
            .await?;
        if let Some(ref job) = claimed {
            self.remember(job, position);
        }
        Ok(claimed)
    }

    async fn list_eligible(
        &self,
        limit: usize,
        priority_order: &[JobPriority],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let answers = self
            .gather("list_eligible", |store| async move {
                store.list_eligible(limit, priority_order, now).await
            })
            .await?;
        Ok(order_eligible(self.merge(answers), limit, priority_order))
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let answers = self
            .gather("list_stale", |store| async move { store.list_stale(cutoff, limit).await })
            .await?;
        Ok(order_stale(self.merge(answers), limit))
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let answers = self
            .gather("count_by_status", |store| async move { store.count_by_status().await })
            .await?;

        let mut totals = HashMap::new();
        for (_, counts) in answers {
            for (status, count) in counts {
                *totals.entry(status).or_insert(0) += count;
            }
        }
        Ok(totals)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[JobStatus]) -> Result<u64> {
        let answers = self
            .gather("delete_older_than", |store| async move {
                store.delete_older_than(cutoff, statuses).await
            })
            .await?;

        let deleted: u64 = answers.into_iter().map(|(_, count)| count).sum();
        if deleted > 0 {
            self.locations.clear();
        }
        Ok(deleted)
    }
}
