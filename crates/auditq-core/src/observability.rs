//! Status views and performance counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::CircuitState;

/// Records held by a queue backend, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub retrying: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.retrying
    }
}

/// Monotonic counters accumulated since the processor was created.
#[derive(Debug, Default)]
pub struct PerformanceCounters {
    tasks_added: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_timed_out: AtomicU64,
    circuit_rejections: AtomicU64,
    rate_limited: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    attempts: AtomicU64,
    total_processing_ms: AtomicU64,
}

impl PerformanceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_added(&self) {
        self.tasks_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_timed_out(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_rejected(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// One finished attempt (any outcome) and how long it took.
    pub fn attempt_finished(&self, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.total_processing_ms.fetch_add(millis, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let total_processing_ms = self.total_processing_ms.load(Ordering::Relaxed);
        let average_processing_ms = if attempts == 0 {
            0.0
        } else {
            total_processing_ms as f64 / attempts as f64
        };

        PerformanceSnapshot {
            tasks_added: self.tasks_added.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            attempts,
            total_processing_ms,
            average_processing_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub tasks_added: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_timed_out: u64,
    pub circuit_rejections: u64,
    pub rate_limited: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub attempts: u64,
    pub total_processing_ms: u64,
    pub average_processing_ms: f64,
}

/// Point-in-time view returned by `AuditProcessor::get_queue_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Records not yet completed or failed (pending + retrying + processing).
    pub size: usize,
    /// At least one worker is executing a task.
    pub processing: bool,
    /// Configured concurrency.
    pub workers: usize,
    pub pending: usize,
    pub retrying: usize,
    pub in_flight: usize,
    /// `None` when the circuit breaker is disabled.
    pub circuit_state: Option<CircuitState>,
    pub performance: PerformanceSnapshot,
}
