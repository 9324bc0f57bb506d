//! Queue module: the backend seam, in-memory implementation and retry policy.

mod memory;
mod retry;

pub use memory::InMemoryTaskQueue;
pub use retry::{RetryDecision, RetryPolicy};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::TaskRecord;
use crate::error::AuditError;
use crate::observability::QueueCounts;

/// Result of asking a backend for work.
#[derive(Debug)]
pub enum Dequeue {
    /// Highest-priority, earliest-submitted ready record (already removed).
    Ready(TaskRecord),

    /// Nothing ready. `Some(t)` is when the next scheduled retry comes due.
    Wait(Option<Instant>),
}

/// Queue port (interface).
///
/// The in-memory backend is the reference; this trait is the seam for
/// swapping in another store without touching dispatch/retry/breaker logic.
///
/// Design intent:
/// - The backend only orders and holds records; it never runs them.
/// - Waiting for work is the dispatcher's job (`Dequeue::Wait` tells it how long).
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Insert a pending record, ordered by (priority desc, seq asc).
    async fn push(&self, record: TaskRecord) -> Result<(), AuditError>;

    /// Hold a retrying record until `run_at`, then make it ready again.
    async fn schedule(&self, record: TaskRecord, run_at: Instant) -> Result<(), AuditError>;

    /// Take the next ready record, promoting due retries first.
    async fn dequeue(&self) -> Result<Dequeue, AuditError>;

    /// Remove every pending and retrying record.
    async fn clear(&self) -> Result<Vec<TaskRecord>, AuditError>;

    async fn counts(&self) -> Result<QueueCounts, AuditError>;
}
