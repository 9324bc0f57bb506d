//! Single-flight memoization on top of a `Cache`.
//!
//! Workers run on a multi-threaded runtime, so two callers can miss the same
//! key at once. A per-key async lock makes the second caller wait for the
//! first and then read its result instead of invoking the handler again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::Cache;
use crate::error::AuditError;

/// Where a memoized value came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(Value),
    Computed(Value),
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_value(self) -> Value {
        match self {
            Lookup::Hit(value) | Lookup::Computed(value) => value,
        }
    }
}

type KeyLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

pub struct Memoizer {
    cache: Arc<dyn Cache>,
    inflight: KeyLocks,
}

/// Holds one caller's share of a per-key lock. The map entry goes away when
/// the last holder drops, including callers whose future was cancelled.
struct KeyLease<'a> {
    inflight: &'a KeyLocks,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // map + ours
        if Arc::strong_count(&self.lock) <= 2 {
            inflight.remove(self.key);
        }
    }
}

impl Memoizer {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            inflight: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    /// Return the cached value for `key`, or run `compute` once and store its
    /// result. Errors from `compute` are returned and nothing is stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Lookup, AuditError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, AuditError>>,
    {
        if let Some(value) = self.cache.get(key).await? {
            return Ok(Lookup::Hit(value));
        }

        let lease = self.lease(key);
        let _guard = lease.lock.lock().await;
        self.compute_locked(key, ttl, compute).await
    }

    async fn compute_locked<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Lookup, AuditError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, AuditError>>,
    {
        // another caller may have filled it while we waited for the lock
        if let Some(value) = self.cache.get(key).await? {
            return Ok(Lookup::Hit(value));
        }
        debug!(key, "cache miss, computing");
        let value = compute().await?;
        self.cache.set(key, value.clone(), ttl).await?;
        Ok(Lookup::Computed(value))
    }

    fn lease<'a>(&'a self, key: &'a str) -> KeyLease<'a> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(inflight.entry(key.to_string()).or_default());
        KeyLease {
            inflight: &self.inflight,
            key,
            lock,
        }
    }

    #[cfg(test)]
    fn inflight_keys(&self) -> usize {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
