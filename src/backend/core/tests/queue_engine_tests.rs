//! Queue engine behavior against the in-process store.
//!
//! Tests cover:
//! - Retry with backoff through to dead letter
//! - Recovery of jobs abandoned in processing
//! - Single dispatch under concurrent batches
//! - Request timeouts
//! - Priority ordering within a batch
//! - Stats defaults and backend failures
//! - Query truncation on enqueue

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use research_queue_core::config::{QueueConfig, StoreConfig};
use research_queue_core::error::{ErrorCode, QueueError, Result};
use research_queue_core::jobs::{
    EventDispatcher, EventSink, JobEvent, JobEventKind, JobId, JobOutcome, JobPriority, JobRecord,
    JobStatus, JobUpdate, QueueEngine, QueueStats, ResearchPayload, ResearchRequest, RetryPolicy,
    TracingEventSink,
};
use research_queue_core::research::{RequestFailure, ResearchClient, ResearchReport};
use research_queue_core::store::{FallbackStore, JobStore, MemoryStore};
use serde_json::Map;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test doubles
// ============================================================================

/// Fails the first `failures` calls, then succeeds. Records calls per query.
struct ScriptedClient {
    failures: AtomicUsize,
    latency: Duration,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedClient {
    fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            latency: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn succeeding() -> Self {
        Self::failing(0)
    }

    fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::succeeding()
        }
    }

    fn calls_for(&self, query: &str) -> usize {
        self.calls.lock().get(query).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl ResearchClient for ScriptedClient {
    async fn perform(
        &self,
        payload: &ResearchPayload,
        _timeout: Duration,
    ) -> std::result::Result<ResearchReport, RequestFailure> {
        *self.calls.lock().entry(payload.query.clone()).or_default() += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(RequestFailure::rejected("upstream returned 502"))
        } else {
            Ok(ResearchReport::new(format!("findings for {}", payload.query)))
        }
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<JobEvent>>,
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn record(&self, event: &JobEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// A store that is always unreachable.
struct DownStore;

#[async_trait]
impl JobStore for DownStore {
    fn name(&self) -> &'static str {
        "down"
    }
    async fn ping(&self) -> Result<()> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
    async fn create(&self, _job: &JobRecord) -> Result<JobId> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
    async fn get(&self, _id: JobId) -> Result<Option<JobRecord>> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
    async fn update(&self, _id: JobId, _update: &JobUpdate) -> Result<JobRecord> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
    async fn claim(&self, _id: JobId, _now: chrono::DateTime<Utc>) -> Result<Option<JobRecord>> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
    async fn list_eligible(
        &self,
        _limit: usize,
        _order: &[JobPriority],
        _now: chrono::DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
    async fn list_stale(&self, _cutoff: chrono::DateTime<Utc>, _limit: usize) -> Result<Vec<JobRecord>> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
    async fn delete_older_than(
        &self,
        _cutoff: chrono::DateTime<Utc>,
        _statuses: &[JobStatus],
    ) -> Result<u64> {
        Err(QueueError::store_unavailable("down", "connection refused"))
    }
}

fn build_engine(
    store: Arc<dyn JobStore>,
    client: Arc<dyn ResearchClient>,
    config: QueueConfig,
) -> Arc<QueueEngine> {
    let (events, _drain) = EventDispatcher::spawn(Arc::new(TracingEventSink), 256);
    Arc::new(QueueEngine::new(store, client, events, config, RetryPolicy::default()))
}

async fn enqueue(engine: &QueueEngine, query: &str, priority: JobPriority) -> JobId {
    engine
        .enqueue("u1", &ResearchRequest::new(query), priority, Map::new())
        .await
        .unwrap()
        .job_id
}

// ============================================================================
// Retry and dead letter
// ============================================================================

#[tokio::test]
async fn test_failing_job_backs_off_then_dead_letters() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::failing(usize::MAX));
    let engine = build_engine(store.clone(), client.clone(), QueueConfig::default());

    let id = enqueue(&engine, "quantum computing trends", JobPriority::High).await;

    // First failure: retry in about one second
    let before = Utc::now();
    let report = engine.process_batch().await;
    let after = Utc::now();
    assert_eq!(report.retried, 1);

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("upstream returned 502"));
    let next = job.next_retry_at.unwrap();
    assert!(next >= before + ChronoDuration::seconds(1));
    assert!(next <= after + ChronoDuration::seconds(1));

    // Not yet due
    let report = engine.process_batch().await;
    assert_eq!(report.fetched, 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    engine.process_batch().await;
    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);

    // Second failure waits two seconds
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let report = engine.process_batch().await;
    assert_eq!(report.dead_lettered, 1);

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 3);
    assert_eq!(client.calls_for("quantum computing trends"), 3);

    // Terminal: never listed again
    assert_eq!(engine.process_batch().await.fetched, 0);
    assert_eq!(engine.stats().await.dead_letter, 1);
}

#[tokio::test]
async fn test_retry_then_success_completes() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::failing(1));
    let engine = build_engine(store.clone(), client.clone(), QueueConfig::default());
    let id = enqueue(&engine, "lithium supply chain", JobPriority::Normal).await;

    let first = engine.process_one(id).await.unwrap();
    assert!(matches!(first, JobOutcome::RetryScheduled { .. }));

    // Force the retry timer to elapse
    store
        .update(id, &JobUpdate::at(Utc::now()).with_next_retry_at(Some(Utc::now())))
        .await
        .unwrap();

    assert_eq!(engine.process_one(id).await.unwrap(), JobOutcome::Completed);
    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(job.result.unwrap().report, "findings for lithium supply chain");
}

#[tokio::test]
async fn test_exhausted_job_is_dead_lettered_without_calling_out() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::succeeding());
    let engine = build_engine(store.clone(), client.clone(), QueueConfig::default());

    let payload = ResearchRequest::new("stale").validate(1000).unwrap();
    let mut job = JobRecord::new("u1", payload, JobPriority::Normal, 3);
    job.status = JobStatus::Failed;
    job.attempts = 3;
    job.last_error = Some("timeout".into());
    let id = store.create(&job).await.unwrap();

    assert_eq!(engine.process_one(id).await.unwrap(), JobOutcome::DeadLettered);
    assert_eq!(client.total_calls(), 0);

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_exhausted_jobs_do_not_stay_listed() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::succeeding());
    let engine = build_engine(store.clone(), client.clone(), QueueConfig::default());

    let mut failed = JobRecord::new(
        "u1",
        ResearchRequest::new("failed out").validate(1000).unwrap(),
        JobPriority::High,
        2,
    );
    failed.status = JobStatus::Failed;
    failed.attempts = 2;
    let never_runnable = JobRecord::new(
        "u1",
        ResearchRequest::new("no budget").validate(1000).unwrap(),
        JobPriority::Low,
        0,
    );
    store.create(&failed).await.unwrap();
    store.create(&never_runnable).await.unwrap();

    let report = engine.process_batch().await;
    assert_eq!(report.fetched, 2);
    assert_eq!(report.dead_lettered, 2);
    assert_eq!(client.total_calls(), 0);

    let report = engine.process_batch().await;
    assert_eq!(report.fetched, 0);
    assert_eq!(engine.stats().await.dead_letter, 2);
}

// ============================================================================
// Abandoned jobs
// ============================================================================

fn short_timeout() -> QueueConfig {
    QueueConfig {
        job_timeout: Duration::from_millis(50),
        stale_grace: Duration::from_millis(20),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_abandoned_job_returns_to_retry_path() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::succeeding());
    let engine = build_engine(store.clone(), client.clone(), short_timeout());
    let id = enqueue(&engine, "abandoned", JobPriority::Normal).await;

    // A worker claimed it and died
    store.claim(id, Utc::now()).await.unwrap().unwrap();
    assert_eq!(engine.recover_stale().await, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.recover_stale().await, 1);

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    let retry_at = job.next_retry_at.unwrap();

    let wait = (retry_at - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(wait + Duration::from_millis(20)).await;
    let report = engine.process_batch().await;
    assert_eq!(report.completed, 1);
    assert_eq!(engine.get_job(id).await.unwrap().attempts, 2);
}

#[tokio::test]
async fn test_abandoned_job_out_of_attempts_is_dead_lettered() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::succeeding());
    let engine = build_engine(store.clone(), client, short_timeout());

    let payload = ResearchRequest::new("last try").validate(1000).unwrap();
    let job = JobRecord::new("u1", payload, JobPriority::High, 1);
    store.create(&job).await.unwrap();
    store.claim(job.id, Utc::now()).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.recover_stale().await, 1);
    assert_eq!(engine.get_job(job.id).await.unwrap().status, JobStatus::DeadLetter);
    assert_eq!(engine.process_batch().await.fetched, 0);
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::slow(Duration::from_millis(500)));
    let config = QueueConfig {
        job_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let engine = build_engine(store, client, config);
    let id = enqueue(&engine, "slow topic", JobPriority::Normal).await;

    let report = engine.process_batch().await;
    assert_eq!(report.retried, 1);

    let job = engine.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("timeout"));
    assert_eq!(engine.worker_stats().snapshot().timeouts, 1);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_concurrent_batches_never_double_dispatch() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::slow(Duration::from_millis(20)));
    let config = QueueConfig {
        batch_size: 20,
        pool_size: 8,
        ..Default::default()
    };
    let engine = build_engine(store.clone(), client.clone(), config);

    let mut queries = Vec::new();
    for i in 0..20 {
        let query = format!("topic {}", i);
        enqueue(&engine, &query, JobPriority::Normal).await;
        queries.push(query);
    }

    let (a, b) = tokio::join!(engine.process_batch(), engine.process_batch());
    assert_eq!(a.completed + b.completed, 20);
    assert_eq!(a.errors + b.errors, 0);

    for query in &queries {
        assert_eq!(client.calls_for(query), 1, "{} dispatched more than once", query);
    }
    let stats = engine.stats().await;
    assert_eq!(stats.completed, 20);
    assert_eq!(stats.processing, 0);
}

#[tokio::test]
async fn test_high_priority_runs_first() {
    let store = Arc::new(MemoryStore::new());
    let client = Arc::new(ScriptedClient::succeeding());
    let config = QueueConfig {
        batch_size: 1,
        ..Default::default()
    };
    let engine = build_engine(store, client, config);

    let low = enqueue(&engine, "low", JobPriority::Low).await;
    let normal = enqueue(&engine, "normal", JobPriority::Normal).await;
    let high = enqueue(&engine, "high", JobPriority::High).await;

    engine.process_batch().await;
    assert_eq!(engine.get_job(high).await.unwrap().status, JobStatus::Completed);
    assert_eq!(engine.get_job(normal).await.unwrap().status, JobStatus::Pending);

    engine.process_batch().await;
    assert_eq!(engine.get_job(normal).await.unwrap().status, JobStatus::Completed);
    assert_eq!(engine.get_job(low).await.unwrap().status, JobStatus::Pending);
}

#[tokio::test]
async fn test_lifecycle_events_are_emitted() {
    let sink = Arc::new(CollectingSink::default());
    let (events, drain) = EventDispatcher::spawn(sink.clone(), 64);
    let engine = Arc::new(QueueEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedClient::failing(1)),
        events,
        QueueConfig::default(),
        RetryPolicy::default(),
    ));

    let id = enqueue(&engine, "events", JobPriority::Normal).await;
    engine.process_batch().await;
    drop(engine);
    drain.shutdown().await;

    let kinds: Vec<JobEventKind> = sink
        .events
        .lock()
        .iter()
        .filter(|e| e.job_id == id)
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![JobEventKind::Created, JobEventKind::Started, JobEventKind::RetryScheduled]
    );
}

// ============================================================================
// Stats, cleanup, validation
// ============================================================================

#[tokio::test]
async fn test_stats_on_empty_store_are_zero() {
    let engine = build_engine(
        Arc::new(MemoryStore::new()),
        Arc::new(ScriptedClient::succeeding()),
        QueueConfig::default(),
    );
    let stats = engine.stats().await;
    assert_eq!(stats, QueueStats::default());

    let json = serde_json::to_value(stats).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"pending": 0, "processing": 0, "completed": 0, "failed": 0, "deadLetter": 0})
    );
}

#[tokio::test]
async fn test_unreachable_store_degrades_safely() {
    let store = Arc::new(FallbackStore::new(vec![Arc::new(DownStore)], &StoreConfig::default()));
    let engine = build_engine(store, Arc::new(ScriptedClient::succeeding()), QueueConfig::default());

    assert_eq!(engine.stats().await, QueueStats::default());
    assert_eq!(engine.cleanup().await, 0);
    assert_eq!(engine.process_batch().await.errors, 1);

    // Enqueue must not pretend to have accepted the job
    let err = engine
        .enqueue("u1", &ResearchRequest::new("q"), JobPriority::Normal, Map::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.code(),
        ErrorCode::StoreUnavailable | ErrorCode::AllStoresUnavailable
    ));
}

#[tokio::test]
async fn test_cleanup_keeps_dead_letters_longer() {
    let store = Arc::new(MemoryStore::new());
    let engine = build_engine(store.clone(), Arc::new(ScriptedClient::succeeding()), QueueConfig::default());

    let old = Utc::now() - ChronoDuration::days(10);
    for status in [JobStatus::Completed, JobStatus::DeadLetter, JobStatus::Pending] {
        let payload = ResearchRequest::new(status.as_str()).validate(1000).unwrap();
        let mut job = JobRecord::new("u1", payload, JobPriority::Normal, 3);
        job.status = status;
        job.updated_at = old;
        store.create(&job).await.unwrap();
    }

    // 7-day window removes the completed job only
    assert_eq!(engine.cleanup().await, 1);
    let stats = engine.stats().await;
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.dead_letter, 1);
    assert_eq!(stats.pending, 1);

    // An explicit window applies to every terminal status
    assert_eq!(engine.cleanup_older_than(Duration::from_secs(86_400)).await, 1);
    assert_eq!(engine.stats().await.pending, 1);
}

#[tokio::test]
async fn test_enqueue_truncates_long_queries() {
    let store = Arc::new(MemoryStore::new());
    let engine = build_engine(store, Arc::new(ScriptedClient::succeeding()), QueueConfig::default());

    let id = enqueue(&engine, &"q".repeat(1500), JobPriority::Normal).await;
    let stored = engine.get_job(id).await.unwrap().payload.query;
    assert_eq!(stored.chars().count(), 1000);

    let again = enqueue(&engine, &stored, JobPriority::Normal).await;
    assert_eq!(engine.get_job(again).await.unwrap().payload.query, stored);
}

#[tokio::test]
async fn test_enqueue_rejects_malformed_payload() {
    let store = Arc::new(MemoryStore::new());
    let engine = build_engine(store.clone(), Arc::new(ScriptedClient::succeeding()), QueueConfig::default());

    let request = ResearchRequest::new("q").with_output_format("pdf");
    let err = engine
        .enqueue("u1", &request, JobPriority::Normal, Map::new())
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_eligibility_respects_retry_timer() {
    let store = MemoryStore::new();
    let payload = ResearchRequest::new("later").validate(1000).unwrap();
    let mut job = JobRecord::new("u1", payload, JobPriority::Normal, 3);
    job.status = JobStatus::Failed;
    job.attempts = 1;
    let now = Utc::now();
    job.next_retry_at = Some(now + ChronoDuration::seconds(10));
    store.create(&job).await.unwrap();

    let order = JobPriority::DESCENDING;
    assert!(store.list_eligible(10, &order, now).await.unwrap().is_empty());
    let later = now + ChronoDuration::seconds(10);
    assert_eq!(store.list_eligible(10, &order, later).await.unwrap().len(), 1);
}
