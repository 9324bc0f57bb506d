//! Retry policy: decides whether a failed record gets another attempt, and when.

use std::time::Duration;

use crate::domain::TaskRecord;

/// What to do with a record whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver after `delay`.
    Retry { delay: Duration },

    /// `max_retries + 1` attempts used; the record fails.
    Exhausted,
}

/// Retry policy for failed attempts.
///
/// The base delay comes from each task's `retry_delay`. The multiplier
/// defaults to 1.0, so the delay is fixed per attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed()
    }
}

impl RetryPolicy {
    pub fn fixed() -> Self {
        Self {
            backoff_multiplier: 1.0,
        }
    }

    pub fn exponential(multiplier: f64) -> Self {
        Self {
            backoff_multiplier: multiplier,
        }
    }

    pub fn decide(&self, record: &TaskRecord) -> RetryDecision {
        if record.retries_exhausted() {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.next_delay(record.task.retry_delay, record.attempt),
            }
        }
    }

    /// Delay before the retry that follows attempt number `attempt` (1-indexed).
    ///
    /// delay = base * multiplier^(attempt - 1)
    pub fn next_delay(&self, base: Duration, attempt: u32) -> Duration {
        if self.backoff_multiplier == 1.0 {
            return base;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = base.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
