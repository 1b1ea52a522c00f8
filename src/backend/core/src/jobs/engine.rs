//! Queue engine: enqueue, batch dispatch, per-job state machine, cleanup and
//! stats.
//!
//! ```text
//! process_batch ──▶ list_eligible(batch_size, high > normal > low)
//!       │
//!       ├──▶ spawn ─▶ permit ─▶ process_one(id)
//!       │                         claim ─▶ research call (timeout) ─▶ completed
//!       │                                                          ├▶ failed + next_retry_at
//!       │                                                          └▶ dead_letter
//!       └──▶ join all ─▶ BatchReport
//! ```
//!
//! Store and research failures are absorbed into job transitions and
//! counters. Only validation errors at enqueue and store errors on paths
//! that must not silently lose a job reach the caller.
//!
//! A job whose outcome could not be written stays in `processing` until
//! [`QueueEngine::recover_stale`] returns it to the retry path.

use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use super::events::{EventDispatcher, JobEventKind};
use super::job::{JobId, JobPriority, JobRecord, JobStatus, JobUpdate};
use super::payload::ResearchRequest;
use super::retry::{should_dead_letter, RetryPolicy};
use crate::config::QueueConfig;
use crate::error::{ErrorCode, QueueError, Result};
use crate::research::ResearchClient;
use crate::store::JobStore;

/// Per-job estimate used until a real duration has been observed.
const DEFAULT_JOB_ESTIMATE_SECS: u64 = 30;

/// Writes of an attempt's outcome before the job is left to stale recovery.
const SETTLE_ATTEMPTS: u32 = 3;
const SETTLE_BACKOFF: Duration = Duration::from_millis(100);

const ABANDONED_ERROR: &str = "worker stopped before recording an outcome";

// ═══════════════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Returned to the producer of a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
    pub estimated_processing_secs: u64,
}

/// How one call to [`QueueEngine::process_one`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    RetryScheduled { next_retry_at: chrono::DateTime<Utc> },
    DeadLettered,
    /// Not claimable right now (already taken, not due, or terminal).
    Skipped,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::DeadLettered => "dead_lettered",
            Self::Skipped => "skipped",
        }
    }
}

/// Tally of one [`QueueEngine::process_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub fetched: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &Result<JobOutcome>) {
        match outcome {
            Ok(JobOutcome::Completed) => self.completed += 1,
            Ok(JobOutcome::RetryScheduled { .. }) => self.retried += 1,
            Ok(JobOutcome::DeadLettered) => self.dead_lettered += 1,
            Ok(JobOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.dead_letter
    }

    fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::DeadLetter => self.dead_letter,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local counters for jobs this engine has run.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    timeouts: AtomicU64,
    total_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub timeouts: u64,
    pub mean_duration_ms: Option<u64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, outcome: &JobOutcome, elapsed: Duration) {
        let counter = match outcome {
            JobOutcome::Completed => &self.completed,
            JobOutcome::RetryScheduled { .. } => &self.retried,
            JobOutcome::DeadLettered => &self.dead_lettered,
            JobOutcome::Skipped => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Mean duration of processed jobs, `None` before the first one.
    pub fn mean_duration(&self) -> Option<Duration> {
        let processed = self.processed();
        if processed == 0 {
            return None;
        }
        Some(Duration::from_millis(
            self.total_duration_ms.load(Ordering::Relaxed) / processed,
        ))
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed(),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            mean_duration_ms: self
                .mean_duration()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

pub struct QueueEngine {
    store: Arc<dyn JobStore>,
    client: Arc<dyn ResearchClient>,
    events: EventDispatcher,
    config: QueueConfig,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    stats: WorkerStats,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn ResearchClient>,
        events: EventDispatcher,
        config: QueueConfig,
        retry: RetryPolicy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            store,
            client,
            events,
            config,
            retry,
            permits,
            stats: WorkerStats::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn worker_stats(&self) -> &WorkerStats {
        &self.stats
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Producer side
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate `request` and persist it as a pending job.
    ///
    /// Store failure is returned, never swallowed: a job that was not
    /// persisted must not look accepted.
    #[tracing::instrument(skip(self, request, metadata), fields(owner_id = %owner_id, priority = %priority))]
    pub async fn enqueue(
        &self,
        owner_id: &str,
        request: &ResearchRequest,
        priority: JobPriority,
        metadata: Map<String, Value>,
    ) -> Result<EnqueueReceipt> {
        if owner_id.trim().is_empty() {
            return Err(QueueError::invalid_field(
                ErrorCode::MissingRequiredField,
                "owner_id",
                "Owner id must not be empty",
            ));
        }

        let mut payload = request.validate(self.config.max_query_length)?;
        payload.metadata = metadata;

        let job = JobRecord::new(owner_id, payload, priority, self.config.max_attempts);
        let job_id = self.store.create(&job).await?;

        counter!("rq_jobs_enqueued_total", "priority" => priority.as_str()).increment(1);
        self.events.job(JobEventKind::Created, &job);
        tracing::info!(job_id = %job_id, "Job enqueued");

        Ok(EnqueueReceipt {
            job_id,
            status: job.status,
            estimated_processing_secs: self.estimate_wait().await,
        })
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    /// Rough seconds until a job enqueued now finishes: the queue ahead of it
    /// drained `pool_size` at a time at the observed mean job duration.
    async fn estimate_wait(&self) -> u64 {
        let per_job = self
            .stats
            .mean_duration()
            .map(|d| d.as_secs().max(1))
            .unwrap_or(DEFAULT_JOB_ESTIMATE_SECS);
        let pending = match self.store.count_by_status().await {
            Ok(counts) => counts.get(&JobStatus::Pending).copied().unwrap_or(0),
            Err(_) => 0,
        };
        let pool = self.config.pool_size.max(1) as u64;
        pending.max(1).div_ceil(pool) * per_job
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch up to `batch_size` eligible jobs and run them on the worker pool.
    /// Returns once every fetched job has settled. Never fails: a listing
    /// error is logged and counted in the report.
    pub async fn process_batch(self: &Arc<Self>) -> BatchReport {
        let mut report = BatchReport::default();
        let now = Utc::now();

        let jobs = match self
            .store
            .list_eligible(self.config.batch_size, &JobPriority::DESCENDING, now)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list eligible jobs");
                report.errors += 1;
                return report;
            }
        };

        let mut seen = HashSet::with_capacity(jobs.len());
        let ids: Vec<JobId> = jobs
            .into_iter()
            .map(|job| job.id)
            .filter(|id| seen.insert(*id))
            .collect();
        report.fetched = ids.len();
        if ids.is_empty() {
            return report;
        }

        let handles = ids.into_iter().map(|id| {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = Arc::clone(&engine.permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| QueueError::internal("worker pool closed"))?;
                engine.process_one(id).await
            })
        });

        for joined in join_all(handles).await {
            let outcome = joined.unwrap_or_else(|e| Err(QueueError::internal(format!("worker task failed: {}", e))));
            if let Err(ref e) = outcome {
                e.log();
            }
            report.record(&outcome);
        }

        tracing::debug!(?report, "Batch settled");
        report
    }

    /// Run one job through its next attempt.
    #[tracing::instrument(skip(self), fields(job_id = %id))]
    pub async fn process_one(&self, id: JobId) -> Result<JobOutcome> {
        let Some(job) = self.store.get(id).await? else {
            return Err(QueueError::job_not_found(id));
        };

        // Eligible but out of attempts: nothing left to try.
        if job.status.is_eligible_state() && job.attempts_exhausted() {
            self.transition(&job, JobStatus::DeadLetter)?;
            let error = job.last_error.clone().unwrap_or_else(|| "attempts exhausted".to_string());
            let updated = self.store.update(id, &JobUpdate::dead_lettered(error, Utc::now())).await?;
            self.events.job(JobEventKind::DeadLettered, &updated);
            counter!("rq_jobs_processed_total", "outcome" => "dead_lettered").increment(1);
            return Ok(JobOutcome::DeadLettered);
        }

        let started = Instant::now();
        let Some(claimed) = self.store.claim(id, Utc::now()).await? else {
            return Ok(JobOutcome::Skipped);
        };
        self.events.job(JobEventKind::Started, &claimed);

        let timeout = self.config.job_timeout;
        let attempt = tokio::time::timeout(timeout, self.client.perform(&claimed.payload, timeout)).await;
        let failure = match attempt {
            Ok(Ok(report)) => {
                self.transition(&claimed, JobStatus::Completed)?;
                let updated = self.settle(id, &JobUpdate::completed(report, Utc::now())).await?;
                self.events.job(JobEventKind::Completed, &updated);
                return Ok(self.finish(JobOutcome::Completed, started));
            }
            Ok(Err(failure)) => {
                if failure.is_timeout() {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                failure.to_string()
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                "timeout".to_string()
            }
        };

        tracing::warn!(attempts = claimed.attempts, error = %failure, "Research request failed");
        let now = Utc::now();

        if should_dead_letter(claimed.attempts, claimed.max_attempts) {
            self.transition(&claimed, JobStatus::DeadLetter)?;
            let updated = self.settle(id, &JobUpdate::dead_lettered(failure, now)).await?;
            self.events.job(JobEventKind::DeadLettered, &updated);
            tracing::error!(attempts = updated.attempts, "Job moved to dead letter");
            return Ok(self.finish(JobOutcome::DeadLettered, started));
        }

        self.transition(&claimed, JobStatus::Failed)?;
        let next_retry_at = self.retry.next_retry_at(claimed.attempts, now);
        let updated = self
            .settle(id, &JobUpdate::retry_scheduled(failure, next_retry_at, now))
            .await?;
        self.events.job(JobEventKind::RetryScheduled, &updated);
        Ok(self.finish(JobOutcome::RetryScheduled { next_retry_at }, started))
    }

    /// Record the outcome of a claimed attempt, retrying store failures with
    /// a short backoff. If every write fails the job stays in `processing`
    /// for [`recover_stale`](Self::recover_stale).
    async fn settle(&self, id: JobId, update: &JobUpdate) -> Result<JobRecord> {
        let mut delay = SETTLE_BACKOFF;
        for _ in 1..SETTLE_ATTEMPTS {
            match self.store.update(id, update).await {
                Err(e) if e.triggers_fallback() => {
                    tracing::warn!(error = %e, retry_in = ?delay, "Failed to record job outcome, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                settled => return settled,
            }
        }
        self.store.update(id, update).await.map_err(|e| {
            counter!("rq_jobs_unsettled_total").increment(1);
            tracing::error!(error = %e, "Job outcome not recorded, leaving it for stale recovery");
            e
        })
    }

    fn transition(&self, job: &JobRecord, next: JobStatus) -> Result<()> {
        if job.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(QueueError::invalid_state_transition(job.status, next))
        }
    }

    fn finish(&self, outcome: JobOutcome, started: Instant) -> JobOutcome {
        let elapsed = started.elapsed();
        self.stats.record(&outcome, elapsed);
        counter!("rq_jobs_processed_total", "outcome" => outcome.as_str()).increment(1);
        histogram!("rq_job_duration_seconds").record(elapsed.as_secs_f64());
        outcome
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete completed and failed jobs past `retention`, and dead-letter
    /// jobs past `dead_letter_retention`. Returns the number deleted.
    pub async fn cleanup(&self) -> u64 {
        let now = Utc::now();
        let windows = [
            (self.config.retention, &[JobStatus::Completed, JobStatus::Failed][..]),
            (self.config.dead_letter_retention, &[JobStatus::DeadLetter][..]),
        ];

        let mut deleted = 0;
        for (retention, statuses) in windows {
            deleted += self.delete_before(now, retention, statuses).await;
        }
        if deleted > 0 {
            tracing::info!(deleted, "Cleaned up old jobs");
        }
        deleted
    }

    /// Move `processing` jobs nobody has touched for `job_timeout +
    /// stale_grace` back to `failed` with a retry scheduled, or to
    /// `dead_letter` if they are out of attempts. No live attempt outlasts
    /// `job_timeout`, so these jobs lost their worker. Returns the number
    /// recovered.
    pub async fn recover_stale(&self) -> u64 {
        let now = Utc::now();
        let Ok(window) = chrono::Duration::from_std(self.config.job_timeout + self.config.stale_grace) else {
            return 0;
        };

        let stale = match self.store.list_stale(now - window, self.config.batch_size).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list stale jobs");
                return 0;
            }
        };

        let mut recovered = 0;
        for job in stale {
            match self.release(&job, now).await {
                Ok(()) => recovered += 1,
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to recover stale job"),
            }
        }
        if recovered > 0 {
            counter!("rq_jobs_recovered_total").increment(recovered);
            tracing::warn!(recovered, "Recovered jobs abandoned in processing");
        }
        recovered
    }

    async fn release(&self, job: &JobRecord, now: chrono::DateTime<Utc>) -> Result<()> {
        if should_dead_letter(job.attempts, job.max_attempts) {
            self.transition(job, JobStatus::DeadLetter)?;
            let updated = self.store.update(job.id, &JobUpdate::dead_lettered(ABANDONED_ERROR, now)).await?;
            self.events.job(JobEventKind::DeadLettered, &updated);
            counter!("rq_jobs_processed_total", "outcome" => "dead_lettered").increment(1);
        } else {
            self.transition(job, JobStatus::Failed)?;
            let next_retry_at = self.retry.next_retry_at(job.attempts, now);
            let updated = self
                .store
                .update(job.id, &JobUpdate::retry_scheduled(ABANDONED_ERROR, next_retry_at, now))
                .await?;
            self.events.job(JobEventKind::RetryScheduled, &updated);
        }
        Ok(())
    }

    /// Delete every terminal or failed job older than `retention`.
    pub async fn cleanup_older_than(&self, retention: Duration) -> u64 {
        self.delete_before(Utc::now(), retention, &JobStatus::PURGEABLE).await
    }

    async fn delete_before(
        &self,
        now: chrono::DateTime<Utc>,
        retention: Duration,
        statuses: &[JobStatus],
    ) -> u64 {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        match self.store.delete_older_than(now - retention, statuses).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Cleanup failed");
                0
            }
        }
    }

    /// Counts per status; all zero if the store cannot answer.
    pub async fn stats(&self) -> QueueStats {
        let stats = match self.store.count_by_status().await {
            Ok(counts) => {
                let count = |status: JobStatus| counts.get(&status).copied().unwrap_or(0);
                QueueStats {
                    pending: count(JobStatus::Pending),
                    processing: count(JobStatus::Processing),
                    completed: count(JobStatus::Completed),
                    failed: count(JobStatus::Failed),
                    dead_letter: count(JobStatus::DeadLetter),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to count jobs, reporting zeros");
                QueueStats::default()
            }
        };

        for status in JobStatus::ALL {
            gauge!("rq_queue_depth", "status" => status.as_str()).set(stats.get(status) as f64);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::events::TracingEventSink;
    use crate::jobs::payload::ResearchPayload;
    use crate::research::{RequestFailure, ResearchReport};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct Answering;

    #[async_trait]
    impl ResearchClient for Answering {
        async fn perform(
            &self,
            payload: &ResearchPayload,
            _timeout: Duration,
        ) -> std::result::Result<ResearchReport, RequestFailure> {
            Ok(ResearchReport::new(format!("report on {}", payload.query)))
        }
    }

    fn engine(store: Arc<MemoryStore>) -> Arc<QueueEngine> {
        let (events, _drain) = EventDispatcher::spawn(Arc::new(TracingEventSink), 64);
        Arc::new(QueueEngine::new(
            store,
            Arc::new(Answering),
            events,
            QueueConfig::default(),
            RetryPolicy::default(),
        ))
    }

    #[tokio::test]
    async fn test_enqueue_then_complete() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let receipt = engine
            .enqueue("u1", &ResearchRequest::new("rust async"), JobPriority::Normal, Map::new())
            .await
            .unwrap();
        assert_eq!(receipt.status, JobStatus::Pending);
        assert_eq!(receipt.estimated_processing_secs, DEFAULT_JOB_ESTIMATE_SECS);

        let report = engine.process_batch().await;
        assert_eq!(report.fetched, 1);
        assert_eq!(report.completed, 1);

        let job = engine.get_job(receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result.unwrap().report, "report on rust async");
        assert_eq!(engine.worker_stats().processed(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_blank_owner() {
        let engine = engine(Arc::new(MemoryStore::new()));
        let err = engine
            .enqueue(" ", &ResearchRequest::new("q"), JobPriority::Low, Map::new())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_terminal_job_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let receipt = engine
            .enqueue("u1", &ResearchRequest::new("q"), JobPriority::High, Map::new())
            .await
            .unwrap();
        assert_eq!(engine.process_one(receipt.job_id).await.unwrap(), JobOutcome::Completed);
        assert_eq!(engine.process_one(receipt.job_id).await.unwrap(), JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_get_unknown_job() {
        let engine = engine(Arc::new(MemoryStore::new()));
        let err = engine.get_job(JobId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_recover_stale_requeues_abandoned_job() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let receipt = engine
            .enqueue("u1", &ResearchRequest::new("lost"), JobPriority::Normal, Map::new())
            .await
            .unwrap();
        let claimed = store.claim(receipt.job_id, Utc::now()).await.unwrap().unwrap();

        // Still inside the timeout window
        assert_eq!(engine.recover_stale().await, 0);

        let abandoned_at = claimed.updated_at - chrono::Duration::hours(1);
        store.update(claimed.id, &JobUpdate::at(abandoned_at)).await.unwrap();
        assert_eq!(engine.recover_stale().await, 1);

        let job = engine.get_job(receipt.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some(ABANDONED_ERROR));
        assert!(job.next_retry_at.is_some());
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let json = serde_json::to_value(QueueStats::default()).unwrap();
        assert_eq!(json["deadLetter"], 0);
        assert!(json.get("dead_letter").is_none());
    }
}
