use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::BizType;

/// Errors produced by the audit processor.
///
/// Admission errors (`RateLimitExceeded`, `InvalidTask`, `ShuttingDown`) are
/// returned from `add_task` itself. Execution errors never reach the caller of
/// `add_task`; they are fed to the retry manager and only show up in a
/// terminal `task_failed` event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("rate limit exceeded: at most {limit} tasks per {window:?}")]
    RateLimitExceeded { limit: u32, window: Duration },

    #[error("circuit breaker is open, dispatch rejected")]
    CircuitOpen,

    #[error("task processing failed: {0}")]
    TaskProcessing(String),

    #[error("task timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("handler not found for biz_type={0}")]
    HandlerNotFound(BizType),

    #[error("processor is shutting down")]
    ShuttingDown,

    #[error("backend error: {0}")]
    Backend(String),
}

impl AuditError {
    /// Was this error raised at submission time (before a record existed)?
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            AuditError::RateLimitExceeded { .. }
                | AuditError::InvalidTask(_)
                | AuditError::ShuttingDown
        )
    }
}

/// Errors raised while wiring a processor.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate handler for biz_type={0}")]
    DuplicateHandler(BizType),

    #[error("pluggable {0} backend selected but none was supplied")]
    MissingBackend(&'static str),

    #[error("a {0} backend was supplied but the config selects the in-memory one")]
    UnexpectedBackend(&'static str),

    #[error("processor must be built inside a Tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}
