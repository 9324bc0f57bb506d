//! Circuit breaker guarding dispatch to the task handler.
//!
//! # States
//! - Closed: normal operation, dispatches pass through
//! - Open: handler assumed unhealthy, dispatches fail fast
//! - HalfOpen: one probe dispatch tests whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open:      consecutive failures reach the threshold
//! Open → HalfOpen:    first dispatch after the open timeout (becomes the probe)
//! HalfOpen → Closed:  probe succeeds
//! HalfOpen → Open:    probe fails
//! ```
//!
//! One breaker per processor, shared by every `biz_type`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::AuditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    /// How long the circuit stays open before a probe is let through.
    pub timeout: Duration,
}

/// Ticket for one admitted dispatch. Hand it back with the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Admitted dispatch plus the state change admission caused, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub permit: Permit,
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn transition(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        Transition { from, to }
    }

    fn open(&mut self, now: Instant) -> Transition {
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.transition(CircuitState::Open)
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        debug!(
            threshold = config.threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            "circuit breaker initialized"
        );
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().await;
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Ask to dispatch. `Err(CircuitOpen)` means fail fast without calling the handler.
    pub async fn try_acquire(&self) -> Result<Admission, AuditError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                permit: Permit::Normal,
                transition: None,
            }),
            CircuitState::Open => {
                let now = Instant::now();
                let elapsed = inner
                    .opened_at
                    .map(|opened| now.duration_since(opened) >= self.config.timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return Err(AuditError::CircuitOpen);
                }
                inner.probe_in_flight = true;
                let transition = inner.transition(CircuitState::HalfOpen);
                info!("circuit breaker half-open, letting one probe through");
                Ok(Admission {
                    permit: Permit::Probe,
                    transition: Some(transition),
                })
            }
            CircuitState::HalfOpen if inner.probe_in_flight => Err(AuditError::CircuitOpen),
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(Admission {
                    permit: Permit::Probe,
                    transition: None,
                })
            }
        }
    }

    pub async fn record_success(&self, permit: Permit) -> Option<Transition> {
        let mut inner = self.inner.lock().await;
        match (permit, inner.state) {
            (Permit::Probe, CircuitState::HalfOpen) => {
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                inner.opened_at = None;
                info!("probe succeeded, circuit breaker closed");
                Some(inner.transition(CircuitState::Closed))
            }
            (_, CircuitState::Closed) => {
                inner.consecutive_failures = 0;
                None
            }
            // A dispatch admitted before the circuit opened; only the probe decides recovery.
            _ => None,
        }
    }

    pub async fn record_failure(&self, permit: Permit) -> Option<Transition> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match (permit, inner.state) {
            (Permit::Probe, CircuitState::HalfOpen) => {
                warn!("probe failed, circuit breaker re-opened");
                Some(inner.open(now))
            }
            (_, CircuitState::Closed) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.threshold {
                    warn!(
                        consecutive_failures = inner.consecutive_failures,
                        threshold = self.config.threshold,
                        "circuit breaker opened"
                    );
                    Some(inner.open(now))
                } else {
                    None
                }
            }
            _ => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            threshold,
            timeout: Duration::from_secs(10),
        })
    }

    async fn fail_once(cb: &CircuitBreaker) -> Option<Transition> {
        let admission = cb.try_acquire().await.unwrap();
        cb.record_failure(admission.permit).await
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(2);
        assert_eq!(fail_once(&cb).await, None);
        assert_eq!(cb.state().await, CircuitState::Closed);

        let transition = fail_once(&cb).await;
        assert_eq!(
            transition,
            Some(Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            })
        );
        assert!(matches!(cb.try_acquire().await, Err(AuditError::CircuitOpen)));
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let cb = breaker(2);
        fail_once(&cb).await;

        let admission = cb.try_acquire().await.unwrap();
        cb.record_success(admission.permit).await;
        assert_eq!(cb.snapshot().await.consecutive_failures, 0);

        fail_once(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn single_probe_after_timeout_then_close() {
        let cb = breaker(1);
        fail_once(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cb.try_acquire().await.is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let probe = cb.try_acquire().await.unwrap();
        assert_eq!(probe.permit, Permit::Probe);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // only one probe in flight
        assert!(matches!(cb.try_acquire().await, Err(AuditError::CircuitOpen)));

        let transition = cb.record_success(probe.permit).await;
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::Closed));
        assert_eq!(cb.try_acquire().await.unwrap().permit, Permit::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_restarts_timer() {
        let cb = breaker(1);
        fail_once(&cb).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let probe = cb.try_acquire().await.unwrap();
        let transition = cb.record_failure(probe.permit).await;
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::Open));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.try_acquire().await.is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cb.try_acquire().await.unwrap().permit, Permit::Probe);
    }

    #[tokio::test]
    async fn late_success_does_not_close_open_circuit() {
        let cb = breaker(1);
        let early = cb.try_acquire().await.unwrap();
        fail_once(&cb).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        assert_eq!(cb.record_success(early.permit).await, None);
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
