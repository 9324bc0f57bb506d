use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::AuditError;

/// Category label of a moderation task (e.g. `post`, `classified`, `quotation`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BizType(String);

impl BizType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BizType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for BizType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Caller-supplied description of one unit of moderation work.
///
/// Immutable once submitted. `data` is opaque to the processor and handed to
/// the handler as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub task_id: String,
    pub biz_type: BizType,

    /// Higher dispatches first; ties go to the earlier submission.
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay", with = "duration_ms")]
    pub retry_delay: Duration,

    /// Deadline for a single handler attempt.
    #[serde(default = "default_timeout", with = "duration_ms")]
    pub timeout: Duration,

    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl TaskConfig {
    pub fn new(
        task_id: impl Into<String>,
        biz_type: impl Into<BizType>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            biz_type: biz_type.into(),
            priority: 0,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            timeout: default_timeout(),
            data,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Field checks run by `add_task` before the rate limiter.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.task_id.trim().is_empty() {
            return Err(AuditError::InvalidTask("task_id must not be empty".into()));
        }
        if self.biz_type.as_str().trim().is_empty() {
            return Err(AuditError::InvalidTask("biz_type must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(AuditError::InvalidTask(format!(
                "timeout must be non-zero (task_id={})",
                self.task_id
            )));
        }
        Ok(())
    }
}
