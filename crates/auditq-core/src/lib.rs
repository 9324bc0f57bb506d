//! auditq-core
//!
//! Bounded-concurrency audit task processor.
//!
//! # Modules
//! - **domain**: task model (ids, state, task config, record)
//! - **queue**: `TaskQueue` port, in-memory priority queue, retry policy
//! - **cache**: `Cache` port, in-memory TTL cache, single-flight memoizer
//! - **resilience**: circuit breaker and fixed-window rate limiter
//! - **runtime**: `TaskHandler` trait and the biz_type registry
//! - **events**: lifecycle events and listener registry
//! - **processor**: `AuditProcessor` and its builder
//! - **config / error / observability**: settings, error types, status views

pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod observability;
pub mod processor;
pub mod queue;
pub mod resilience;
pub mod runtime;

mod worker;

pub use config::{BackendType, ConfigError, ProcessorConfig};
pub use domain::{BizType, RecordId, TaskConfig, TaskRecord, TaskState};
pub use error::{AuditError, BuildError};
pub use events::{EventKind, ListenerId, TaskEvent};
pub use observability::{PerformanceSnapshot, QueueStatus};
pub use processor::{AuditProcessor, ProcessorBuilder};
pub use resilience::CircuitState;
pub use runtime::{HandlerError, TaskHandler, handler_fn};
