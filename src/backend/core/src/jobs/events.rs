//! Job lifecycle events.
//!
//! The engine emits a [`JobEvent`] at every state change. Events go through a
//! bounded channel to a single consumer task that hands them to an
//! [`EventSink`], so a slow sink never blocks job processing. When the channel
//! is full the event is dropped and counted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::job::{JobId, JobRecord, JobStatus};
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Started,
    Completed,
    RetryScheduled,
    DeadLettered,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::RetryScheduled => "retry_scheduled",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub owner_id: String,
    pub kind: JobEventKind,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    /// Snapshot `job` as it stands after the transition.
    pub fn from_job(kind: JobEventKind, job: &JobRecord) -> Self {
        Self {
            job_id: job.id,
            owner_id: job.owner_id.clone(),
            kind,
            status: job.status,
            attempts: job.attempts,
            error: job.last_error.clone(),
            at: job.updated_at,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sinks
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination for job events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &JobEvent) -> Result<()>;
}

/// Writes each event as a structured log line and counts it.
#[derive(Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, event: &JobEvent) -> Result<()> {
        counter!("rq_job_events_total", "kind" => event.kind.as_str()).increment(1);
        tracing::info!(
            target: "research_queue::events",
            job_id = %event.job_id,
            owner_id = %event.owner_id,
            kind = event.kind.as_str(),
            status = %event.status,
            attempts = event.attempts,
            error = event.error.as_deref(),
            "Job event"
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Cheap, cloneable handle for emitting events.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: mpsc::Sender<JobEvent>,
}

/// Owner of the consumer task; call [`EventDrain::shutdown`] to flush.
#[derive(Debug)]
pub struct EventDrain {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl EventDispatcher {
    /// Start the consumer task feeding `sink`.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> (Self, EventDrain) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(consume(sink, rx, shutdown_rx));
        (Self { tx }, EventDrain { shutdown_tx, handle })
    }

    /// Queue an event without waiting. Returns `false` if it was dropped.
    pub fn emit(&self, event: JobEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                counter!("rq_events_dropped_total", "reason" => "full").increment(1);
                tracing::warn!(job_id = %event.job_id, kind = event.kind.as_str(), "Event buffer full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                counter!("rq_events_dropped_total", "reason" => "closed").increment(1);
                tracing::debug!(job_id = %event.job_id, kind = event.kind.as_str(), "Event consumer stopped, dropping event");
                false
            }
        }
    }

    /// Convenience for `emit(JobEvent::from_job(kind, job))`.
    pub fn job(&self, kind: JobEventKind, job: &JobRecord) -> bool {
        self.emit(JobEvent::from_job(kind, job))
    }
}

impl EventDrain {
    /// Stop accepting events, deliver what is buffered, and return how many
    /// events the consumer recorded in total.
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown_tx.send(true);
        match self.handle.await {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::error!(error = %e, "Event consumer task failed");
                0
            }
        }
    }
}

async fn consume(
    sink: Arc<dyn EventSink>,
    mut rx: mpsc::Receiver<JobEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> u64 {
    let mut recorded = 0u64;

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => recorded += deliver(sink.as_ref(), &event).await,
                None => return recorded,
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    // Closing keeps already-buffered events readable.
    rx.close();
    while let Some(event) = rx.recv().await {
        recorded += deliver(sink.as_ref(), &event).await;
    }
    tracing::debug!(recorded, "Event consumer drained");
    recorded
}

async fn deliver(sink: &dyn EventSink, event: &JobEvent) -> u64 {
    match sink.record(event).await {
        Ok(()) => 1,
        Err(e) => {
            tracing::warn!(job_id = %event.job_id, error = %e, "Event sink failed");
            0
        }
    }
}
