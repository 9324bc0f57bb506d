//! Fixed-window admission limiter.
//!
//! Throttles how fast tasks are submitted, not how fast they are processed.
//! The window opens at the first call after the previous one expired.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::AuditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Submissions admitted per window.
    pub limit: u32,
    pub window: Duration,
}

#[derive(Debug, Default)]
struct WindowState {
    window_start: Option<Instant>,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn config(&self) -> RateLimiterConfig {
        self.config
    }

    /// Count one submission, or reject it if the window is full.
    pub async fn try_admit(&self) -> Result<(), AuditError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired = state
            .window_start
            .is_none_or(|start| now.duration_since(start) >= self.config.window);
        if expired {
            state.window_start = Some(now);
            state.count = 0;
        }

        if state.count >= self.config.limit {
            debug!(
                count = state.count,
                limit = self.config.limit,
                "submission rejected by rate limiter"
            );
            return Err(AuditError::RateLimitExceeded {
                limit: self.config.limit,
                window: self.config.window,
            });
        }
        state.count += 1;
        Ok(())
    }

    /// Submissions admitted in the current window.
    pub async fn current_count(&self) -> u32 {
        self.state.lock().await.count
    }
}
