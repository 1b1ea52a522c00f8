//! Retry backoff and the dead-letter decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff: `min(base_delay * multiplier^attempt, max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

fn default_base_delay() -> Duration { Duration::from_secs(1) }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay() -> Duration { Duration::from_secs(30) }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failure number `attempt` (0-indexed).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// When a job that has now made `attempts` attempts may run again.
    ///
    /// The first failure waits `next_delay(0)`, the second `next_delay(1)`.
    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.next_delay(attempts.saturating_sub(1));
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }
}

/// Whether a job that has made `attempts` attempts is out of budget.
pub const fn should_dead_letter(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.next_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.next_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.next_delay(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_delays_are_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..64 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(policy.next_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn test_first_retry_waits_base_delay() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.next_retry_at(1, now) - now, chrono::Duration::seconds(1));
        assert_eq!(policy.next_retry_at(2, now) - now, chrono::Duration::seconds(2));
    }

    #[test]
    fn test_should_dead_letter() {
        assert!(!should_dead_letter(0, 3));
        assert!(!should_dead_letter(2, 3));
        assert!(should_dead_letter(3, 3));
        assert!(should_dead_letter(4, 3));
    }

    #[test]
    fn test_policy_deserializes_humantime() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"base_delay":"500ms","multiplier":3.0,"max_delay":"1m"}"#).unwrap();
        assert_eq!(policy.next_delay(1), Duration::from_millis(1500));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }
}
