//! Per-tier circuit breaker.
//!
//! A tier that keeps failing is skipped for `recovery_timeout`, then given a
//! single trial call (half-open). Success closes it again; failure re-opens it.
//! Other callers keep skipping the tier while the trial is in flight. A trial
//! that never reports back stops blocking after another `recovery_timeout`.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls go through
    Closed,
    /// Calls are skipped until the recovery timeout elapses
    Open,
    /// Recovery timeout elapsed; one trial call decides
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    tier: &'static str,
    inner: RwLock<Inner>,
    failure_count: AtomicU32,
    failure_threshold: u32,
    recovery_timeout: Duration,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(tier: &'static str, failure_threshold: u32) -> Self {
        Self {
            tier,
            inner: RwLock::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                trial_started: None,
            }),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(30),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    fn waited(&self, since: Option<Instant>) -> bool {
        since.map_or(true, |at| at.elapsed() >= self.recovery_timeout)
    }

    /// Check if a call may be sent to this tier. A `true` while not closed
    /// hands the caller the trial call, which must be reported through
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn can_execute(&self) -> bool {
        {
            let inner = self.inner.read();
            match inner.state {
                CircuitState::Closed => return true,
                CircuitState::Open if !self.waited(inner.opened_at) => return false,
                CircuitState::HalfOpen if !self.waited(inner.trial_started) => return false,
                _ => {}
            }
        }

        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open if !self.waited(inner.opened_at) => false,
            CircuitState::HalfOpen if !self.waited(inner.trial_started) => false,
            CircuitState::Open => {
                inner.state = CircuitState::HalfOpen;
                inner.trial_started = Some(Instant::now());
                tracing::info!(tier = self.tier, "Store circuit half-open, sending trial call");
                true
            }
            CircuitState::HalfOpen => {
                inner.trial_started = Some(Instant::now());
                true
            }
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);

        let mut inner = self.inner.write();
        inner.trial_started = None;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            tracing::info!(tier = self.tier, "Store circuit closed after successful call");
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;

        let mut inner = self.inner.write();
        inner.trial_started = None;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(tier = self.tier, "Store circuit re-opened after failed trial call");
            }
            CircuitState::Closed if failures >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(
                    tier = self.tier,
                    failures = failures,
                    threshold = self.failure_threshold,
                    "Store circuit opened due to consecutive failures"
                );
            }
            _ => {}
        }
    }

    /// Open the circuit immediately, e.g. for a tier unreachable at startup.
    pub fn trip(&self) {
        let mut inner = self.inner.write();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_started = None;
        self.failure_count.store(self.failure_threshold, Ordering::Relaxed);
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            failure_threshold: self.failure_threshold,
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}
