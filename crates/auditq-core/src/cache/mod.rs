//! Cache module: backend seam, in-memory implementation and single-flight memoizer.

mod memo;
mod memory;

pub use memo::{Lookup, Memoizer};
pub use memory::InMemoryCache;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AuditError;

/// Cache port (interface).
///
/// Values are opaque JSON. Expired entries must read as absent.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, AuditError>;

    /// Insert or overwrite. `ttl = None` never expires.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), AuditError>;

    async fn remove(&self, key: &str) -> Result<bool, AuditError>;

    async fn clear(&self) -> Result<(), AuditError>;

    /// Stored entries, possibly including expired ones not yet purged.
    async fn len(&self) -> Result<usize, AuditError>;
}
