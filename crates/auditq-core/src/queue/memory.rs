//! In-memory queue implementation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Dequeue, TaskQueue};
use crate::domain::{TaskRecord, TaskState};
use crate::error::AuditError;
use crate::observability::QueueCounts;

/// Ready entry: max-heap on priority, then min on seq (FIFO within a level).
#[derive(Debug)]
struct ReadyTask(TaskRecord);

impl PartialEq for ReadyTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyTask {}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority()
            .cmp(&other.0.priority())
            // Reverse: lower seq (earlier submission) wins
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Scheduled retry entry.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug)]
struct ScheduledTask {
    run_at: Instant,
    record: TaskRecord,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.record.seq.cmp(&self.record.seq))
    }
}

#[derive(Debug, Default)]
struct InMemoryQueueState {
    ready: BinaryHeap<ReadyTask>,
    scheduled: BinaryHeap<ScheduledTask>,
}

impl InMemoryQueueState {
    /// Move retries whose delay has elapsed into the ready heap.
    fn promote_scheduled_tasks(&mut self, now: Instant) {
        while self
            .scheduled
            .peek()
            .is_some_and(|entry| entry.run_at <= now)
        {
            let Some(ScheduledTask { mut record, .. }) = self.scheduled.pop() else {
                break;
            };
            record.requeue();
            self.ready.push(ReadyTask(record));
        }
    }

    fn counts(&self) -> QueueCounts {
        QueueCounts {
            pending: self.ready.len(),
            retrying: self.scheduled.len(),
        }
    }
}

/// Reference `TaskQueue` backend.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<InMemoryQueueState>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, mut record: TaskRecord) -> Result<(), AuditError> {
        record.state = TaskState::Pending;
        self.state.lock().await.ready.push(ReadyTask(record));
        Ok(())
    }

    async fn schedule(&self, mut record: TaskRecord, run_at: Instant) -> Result<(), AuditError> {
        record.state = TaskState::Retrying;
        self.state
            .lock()
            .await
            .scheduled
            .push(ScheduledTask { run_at, record });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Dequeue, AuditError> {
        let mut state = self.state.lock().await;
        state.promote_scheduled_tasks(Instant::now());

        if let Some(ReadyTask(record)) = state.ready.pop() {
            return Ok(Dequeue::Ready(record));
        }
        Ok(Dequeue::Wait(state.scheduled.peek().map(|entry| entry.run_at)))
    }

    async fn clear(&self) -> Result<Vec<TaskRecord>, AuditError> {
        let mut state = self.state.lock().await;
        let mut removed: Vec<TaskRecord> = state.ready.drain().map(|entry| entry.0).collect();
        removed.extend(state.scheduled.drain().map(|entry| entry.record));
        Ok(removed)
    }

    async fn counts(&self) -> Result<QueueCounts, AuditError> {
        Ok(self.state.lock().await.counts())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::TaskConfig;
    use serde_json::json;

    fn record(task_id: &str, priority: i32, seq: u64) -> TaskRecord {
        TaskRecord::new(
            TaskConfig::new(task_id, "post", json!({})).with_priority(priority),
            seq,
        )
    }

    async fn next_id(queue: &InMemoryTaskQueue) -> Option<String> {
        match queue.dequeue().await.unwrap() {
            Dequeue::Ready(record) => Some(record.task.task_id),
            Dequeue::Wait(_) => None,
        }
    }

    #[tokio::test]
    async fn push_and_counts() {
        let queue = InMemoryTaskQueue::new();
        queue.push(record("a", 0, 0)).await.unwrap();
        queue.push(record("b", 0, 1)).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.retrying, 0);
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let queue = InMemoryTaskQueue::new();
        queue.push(record("low", 1, 0)).await.unwrap();
        queue.push(record("high", 10, 1)).await.unwrap();
        queue.push(record("mid", 5, 2)).await.unwrap();

        assert_eq!(next_id(&queue).await.as_deref(), Some("high"));
        assert_eq!(next_id(&queue).await.as_deref(), Some("mid"));
        assert_eq!(next_id(&queue).await.as_deref(), Some("low"));
        assert_eq!(next_id(&queue).await, None);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo_by_seq() {
        let queue = InMemoryTaskQueue::new();
        // pushed out of order on purpose
        queue.push(record("third", 0, 3)).await.unwrap();
        queue.push(record("first", 0, 1)).await.unwrap();
        queue.push(record("second", 0, 2)).await.unwrap();

        assert_eq!(next_id(&queue).await.as_deref(), Some("first"));
        assert_eq!(next_id(&queue).await.as_deref(), Some("second"));
        assert_eq!(next_id(&queue).await.as_deref(), Some("third"));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_retry_becomes_ready_when_due() {
        let queue = InMemoryTaskQueue::new();
        let run_at = Instant::now() + Duration::from_millis(200);
        queue.schedule(record("retry", 0, 0), run_at).await.unwrap();

        match queue.dequeue().await.unwrap() {
            Dequeue::Wait(Some(wake)) => assert_eq!(wake, run_at),
            other => panic!("expected wait, got {other:?}"),
        }
        assert_eq!(queue.counts().await.unwrap().retrying, 1);

        tokio::time::advance(Duration::from_millis(200)).await;

        match queue.dequeue().await.unwrap() {
            Dequeue::Ready(rec) => {
                assert_eq!(rec.task.task_id, "retry");
                assert_eq!(rec.state, TaskState::Pending);
            }
            other => panic!("expected ready, got {other:?}"),
        }
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn empty_queue_waits_without_deadline() {
        let queue = InMemoryTaskQueue::new();
        assert!(matches!(queue.dequeue().await.unwrap(), Dequeue::Wait(None)));
    }

    #[tokio::test]
    async fn clear_drops_pending_and_retrying() {
        let queue = InMemoryTaskQueue::new();
        for seq in 0..3 {
            queue.push(record("p", 0, seq)).await.unwrap();
        }
        let later = Instant::now() + Duration::from_secs(60);
        queue.schedule(record("r", 0, 9), later).await.unwrap();

        let removed = queue.clear().await.unwrap();
        assert_eq!(removed.len(), 4);
        assert_eq!(queue.counts().await.unwrap().total(), 0);
    }
}
