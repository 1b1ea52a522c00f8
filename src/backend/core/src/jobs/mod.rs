//! Research job queue.
//!
//! - **job**: the job record, its status machine and partial updates
//! - **payload**: request validation and query truncation
//! - **retry**: exponential backoff and the dead-letter decision
//! - **events**: lifecycle events on a bounded background channel
//! - **engine**: enqueue, batch dispatch, cleanup and stats
//! - **scheduler**: periodic driver for the engine
//!
//! # Lifecycle
//!
//! ```text
//! pending ──▶ processing ──▶ completed
//!                 │
//!                 ├──▶ failed ──(next_retry_at elapses)──▶ processing
//!                 │
//!                 └──▶ dead_letter        (attempts == max_attempts)
//! ```
//!
//! A `processing` job whose worker died is moved to `failed` (or
//! `dead_letter`) once it has gone `job_timeout + stale_grace` without an
//! update. An eligible job already out of attempts goes straight to
//! `dead_letter` when dispatched.

pub mod engine;
pub mod events;
pub mod job;
pub mod payload;
pub mod retry;
pub mod scheduler;

pub use engine::{
    BatchReport, EnqueueReceipt, JobOutcome, QueueEngine, QueueStats, WorkerStats,
    WorkerStatsSnapshot,
};
pub use events::{EventDispatcher, EventDrain, EventSink, JobEvent, JobEventKind, TracingEventSink};
pub use job::{JobId, JobPriority, JobRecord, JobStatus, JobUpdate};
pub use payload::{FocusArea, OutputFormat, ResearchPayload, ResearchRequest};
pub use retry::{should_dead_letter, RetryPolicy};
pub use scheduler::{QueueScheduler, SchedulerHandle};
