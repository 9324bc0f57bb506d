//! Task record: task config + processing metadata.

use chrono::{DateTime, Utc};

use super::{RecordId, TaskConfig, TaskState};
use crate::error::AuditError;

/// Processor-owned wrapper around a submitted `TaskConfig`.
///
/// Design:
/// - Queue backends hold whole records; the dispatcher owns a record while it
///   is processing.
/// - All state transitions happen here.
/// - A record is dropped from every internal structure once terminal.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: RecordId,
    pub task: TaskConfig,
    pub state: TaskState,

    /// Handler attempts started so far (including the current one while processing).
    pub attempt: u32,

    /// Submission order, used to break priority ties.
    pub seq: u64,

    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub last_error: Option<AuditError>,

    /// Handler output, set on completion.
    pub result: Option<serde_json::Value>,
}

impl TaskRecord {
    pub fn new(task: TaskConfig, seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::at(now),
            task,
            state: TaskState::Pending,
            attempt: 0,
            seq,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
        }
    }

    pub fn priority(&self) -> i32 {
        self.task.priority
    }

    /// Mark as processing (increment attempt).
    pub fn start_attempt(&mut self) {
        self.state = TaskState::Processing;
        self.attempt += 1;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: serde_json::Value) {
        self.state = TaskState::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    /// Mark as failed (retries exhausted).
    pub fn mark_failed(&mut self, error: AuditError) {
        self.state = TaskState::Failed;
        self.last_error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    pub fn schedule_retry(&mut self, error: AuditError) {
        self.state = TaskState::Retrying;
        self.last_error = Some(error);
    }

    /// Move from Retrying back to Pending.
    pub fn requeue(&mut self) {
        self.state = TaskState::Pending;
    }

    /// `max_retries + 1` attempts have been made.
    pub fn retries_exhausted(&self) -> bool {
        self.attempt > self.task.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn record(max_retries: u32) -> TaskRecord {
        TaskRecord::new(
            TaskConfig::new("post-1", "post", json!({})).with_max_retries(max_retries),
            0,
        )
    }

    #[test]
    fn new_record_is_pending() {
        let rec = record(3);
        assert_eq!(rec.state, TaskState::Pending);
        assert_eq!(rec.attempt, 0);
        assert!(rec.started_at.is_none());
    }

    #[test]
    fn start_attempt_increments() {
        let mut rec = record(3);
        rec.start_attempt();
        rec.start_attempt();
        assert_eq!(rec.state, TaskState::Processing);
        assert_eq!(rec.attempt, 2);
    }

    #[test]
    fn retry_then_requeue_keeps_error() {
        let mut rec = record(3);
        rec.start_attempt();
        rec.schedule_retry(AuditError::TaskProcessing("boom".into()));
        assert_eq!(rec.state, TaskState::Retrying);

        rec.requeue();
        assert_eq!(rec.state, TaskState::Pending);
        assert_eq!(
            rec.last_error,
            Some(AuditError::TaskProcessing("boom".into()))
        );
    }

    #[rstest]
    #[case::first_of_one(0, 1, true)]
    #[case::first_of_three(2, 1, false)]
    #[case::last_of_three(2, 3, true)]
    #[case::middle(2, 2, false)]
    fn retries_exhausted(#[case] max_retries: u32, #[case] attempts: u32, #[case] expected: bool) {
        let mut rec = record(max_retries);
        for _ in 0..attempts {
            rec.start_attempt();
        }
        assert_eq!(rec.retries_exhausted(), expected);
    }

    #[test]
    fn terminal_transitions_stamp_finish_time() {
        let mut rec = record(0);
        rec.start_attempt();
        rec.mark_completed(json!({ "verdict": "approve" }));
        assert!(rec.state.is_terminal());
        assert!(rec.finished_at.is_some());
        assert_eq!(rec.result, Some(json!({ "verdict": "approve" })));
    }
}
