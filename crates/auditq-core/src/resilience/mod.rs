//! Resilience primitives: circuit breaker (dispatch gate) and fixed-window
//! rate limiter (admission control).

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState, Permit,
    Transition,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
