//! Processor configuration.
//!
//! Every field has a default so `ProcessorConfig::default()` (or an empty JSON
//! object) is a valid configuration. Durations are milliseconds on the wire.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig};

/// Backend selector for the queue and the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    #[default]
    Memory,
    /// Supplied by the caller through the processor builder.
    Pluggable,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessorConfig {
    /// Number of tasks allowed in `processing` at once.
    pub concurrency: usize,
    pub queue_type: BackendType,
    pub cache_type: BackendType,
    /// Run every handler attempt on its own spawned task.
    pub enable_worker_threads: bool,
    pub enable_circuit_breaker: bool,
    pub circuit_breaker_threshold: u32,
    #[serde(with = "duration_ms")]
    pub circuit_breaker_timeout: Duration,
    pub enable_rate_limiting: bool,
    pub rate_limit: u32,
    #[serde(with = "duration_ms")]
    pub rate_limit_window: Duration,
    /// 1.0 keeps `retry_delay` fixed across attempts.
    pub retry_backoff_multiplier: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_type: BackendType::Memory,
            cache_type: BackendType::Memory,
            enable_worker_threads: false,
            enable_circuit_breaker: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            enable_rate_limiting: false,
            rate_limit: 100,
            rate_limit_window: Duration::from_secs(60),
            retry_backoff_multiplier: 1.0,
        }
    }
}

impl ProcessorConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject values the processor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.enable_circuit_breaker {
            if self.circuit_breaker_threshold == 0 {
                return Err(invalid("circuitBreakerThreshold", "must be at least 1"));
            }
            if self.circuit_breaker_timeout.is_zero() {
                return Err(invalid("circuitBreakerTimeout", "must be non-zero"));
            }
        }
        if self.enable_rate_limiting {
            if self.rate_limit == 0 {
                return Err(invalid("rateLimit", "must be at least 1"));
            }
            if self.rate_limit_window.is_zero() {
                return Err(invalid("rateLimitWindow", "must be non-zero"));
            }
        }
        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(invalid("retryBackoffMultiplier", "must be a finite value >= 1.0"));
        }
        Ok(())
    }

    pub fn circuit_breaker(&self) -> Option<CircuitBreakerConfig> {
        self.enable_circuit_breaker.then(|| CircuitBreakerConfig {
            threshold: self.circuit_breaker_threshold,
            timeout: self.circuit_breaker_timeout,
        })
    }

    pub fn rate_limiter(&self) -> Option<RateLimiterConfig> {
        self.enable_rate_limiting.then(|| RateLimiterConfig {
            limit: self.rate_limit,
            window: self.rate_limit_window,
        })
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Serde adapter: `Duration` <-> integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
