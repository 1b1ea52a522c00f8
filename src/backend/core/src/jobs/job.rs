//! Job records and their lifecycle.
//!
//! - **JobRecord**: the persisted unit of work wrapping one research request
//! - **JobStatus**: the state machine every record moves through
//! - **JobPriority**: dequeue ordering
//! - **JobUpdate**: the partial update a store applies atomically

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::payload::ResearchPayload;
use crate::error::{ErrorCode, QueueError};
use crate::research::ResearchReport;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| QueueError::invalid_field(ErrorCode::InvalidInput, "id", e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
///
/// ```text
/// pending ──▶ processing ──▶ completed
///                 │
///                 ├──▶ failed ──(next_retry_at elapses)──▶ processing
///                 │       └──(attempts exhausted)──▶ dead_letter
///                 └──▶ dead_letter
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its first dispatch
    Pending,
    /// Owned by exactly one worker
    Processing,
    /// Finished with a result
    Completed,
    /// Last attempt failed; eligible again once `next_retry_at` passes
    Failed,
    /// Retry budget exhausted
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::DeadLetter,
    ];

    /// Statuses a dispatcher may pick up (subject to the retry timer).
    pub const ELIGIBLE: [JobStatus; 2] = [Self::Pending, Self::Failed];

    /// Statuses removed by cleanup once past retention.
    pub const PURGEABLE: [JobStatus; 3] = [Self::Completed, Self::Failed, Self::DeadLetter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }

    pub fn is_eligible_state(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, DeadLetter)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Failed, Processing)
                | (Failed, DeadLetter)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(QueueError::with_internal(
                ErrorCode::DeserializationError,
                "Unknown job status",
                other.to_string(),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    /// Dequeue order used by the engine.
    pub const DESCENDING: [JobPriority; 3] = [Self::High, Self::Normal, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(QueueError::invalid_field(
                ErrorCode::InvalidInput,
                "priority",
                format!("Unknown priority '{}', expected high, normal or low", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted job. The JSON form (payload fields flattened) is the record
/// shape every store keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner_id: String,
    #[serde(flatten)]
    pub payload: ResearchPayload,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<ResearchReport>,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh pending record.
    pub fn new(
        owner_id: impl Into<String>,
        payload: ResearchPayload,
        priority: JobPriority,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            owner_id: owner_id.into(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            next_retry_at: None,
            last_error: None,
            result: None,
            priority,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible for dispatch at `now`: pending or failed, and the retry timer
    /// (if any) has elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_eligible_state() && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Eligible and still within its attempt budget.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_eligible(now) && self.attempts < self.max_attempts
    }

    /// The moment this job becomes (or became) eligible.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.next_retry_at.unwrap_or(self.created_at)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(next_retry_at) = update.next_retry_at {
            self.next_retry_at = next_retry_at;
        }
        if let Some(ref result) = update.result {
            self.result = result.clone();
        }
        if let Some(ref last_error) = update.last_error {
            self.last_error = last_error.clone();
        }
        self.updated_at = update.updated_at;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Partial Update
// ═══════════════════════════════════════════════════════════════════════════════

/// Partial update of the mutable job fields.
///
/// Outer `None` leaves a field untouched; `Some(None)` clears a nullable field.
/// `updated_at` is always written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Option<ResearchReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Option<String>>,
    pub updated_at: DateTime<Utc>,
}

impl JobUpdate {
    /// An update that only touches `updated_at`.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            attempts: None,
            next_retry_at: None,
            result: None,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn with_result(mut self, result: Option<ResearchReport>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    /// Claim transition: processing with the attempt counter bumped.
    pub fn processing(attempts: u32, now: DateTime<Utc>) -> Self {
        Self::at(now)
            .with_status(JobStatus::Processing)
            .with_attempts(attempts)
            .with_next_retry_at(None)
    }

    pub fn completed(report: ResearchReport, now: DateTime<Utc>) -> Self {
        Self::at(now)
            .with_status(JobStatus::Completed)
            .with_result(Some(report))
            .with_next_retry_at(None)
    }

    pub fn retry_scheduled(error: impl Into<String>, next_retry_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::at(now)
            .with_status(JobStatus::Failed)
            .with_next_retry_at(Some(next_retry_at))
            .with_last_error(Some(error.into()))
    }

    pub fn dead_lettered(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::at(now)
            .with_status(JobStatus::DeadLetter)
            .with_next_retry_at(None)
            .with_last_error(Some(error.into()))
    }
}
