//! Task state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a `TaskRecord`.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Retrying -> Pending (until retries are exhausted)
/// - Pending -> Processing -> Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, waiting for a free worker.
    Pending,

    /// Currently being executed by a worker.
    Processing,

    /// Failed an attempt, waiting out `retry_delay`.
    Retrying,

    /// Handler succeeded.
    Completed,

    /// Retries exhausted.
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Retrying => "retrying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Pending, false)]
    #[case(TaskState::Processing, false)]
    #[case(TaskState::Retrying, false)]
    #[case(TaskState::Completed, true)]
    #[case(TaskState::Failed, true)]
    fn terminal_states(#[case] state: TaskState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&TaskState::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
    }
}
