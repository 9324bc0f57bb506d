use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::{BizType, TaskRecord};
use crate::error::{AuditError, BuildError};

/// Error returned by a task handler. Any failure counts against the record's
/// retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("json decode: {err}"))
    }
}

impl From<HandlerError> for AuditError {
    fn from(err: HandlerError) -> Self {
        AuditError::TaskProcessing(err.message)
    }
}

/// The moderation work itself. The processor never encodes business rules;
/// it only calls through this trait.
///
/// The handler gets the whole record so it can read `data`, `biz_type` and the
/// current `attempt`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, record: &TaskRecord) -> Result<Value, HandlerError>;
}

/// Adapter so plain async closures can be used as handlers.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f(record) -> Future<Output = Result<Value, HandlerError>>` as a `TaskHandler`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, record: &TaskRecord) -> Result<Value, HandlerError> {
        (self.f)(record.clone()).await
    }
}

/// Registry of handlers (biz_type -> handler) plus an optional fallback.
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<BizType, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one biz_type. Registering the same type twice is an error.
    pub fn register(
        &mut self,
        biz_type: BizType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), BuildError> {
        if self.handlers.contains_key(&biz_type) {
            return Err(BuildError::DuplicateHandler(biz_type));
        }
        self.handlers.insert(biz_type, handler);
        Ok(())
    }

    /// Handler used for biz_types with no registration of their own (last wins).
    pub fn set_fallback(&mut self, handler: Arc<dyn TaskHandler>) {
        self.fallback = Some(handler);
    }

    pub fn get(&self, biz_type: &BizType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(biz_type).or(self.fallback.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}

/// Runtime resolves the handler for a record.
pub struct Runtime {
    registry: Arc<HandlerRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn resolve(&self, record: &TaskRecord) -> Result<Arc<dyn TaskHandler>, AuditError> {
        let biz_type = &record.task.biz_type;
        self.registry
            .get(biz_type)
            .cloned()
            .ok_or_else(|| AuditError::HandlerNotFound(biz_type.clone()))
    }
}
