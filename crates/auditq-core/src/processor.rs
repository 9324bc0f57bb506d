//! AuditProcessor - the public face of the task processor.
//!
//! # Flow
//! caller -> rate limiter (admission) -> task queue (priority order)
//! -> dispatcher (free worker) -> circuit breaker -> handler
//! -> retry manager -> events / status
//!
//! # Usage
//! ```ignore
//! let processor = AuditProcessor::builder()
//!     .config(ProcessorConfig { concurrency: 2, ..Default::default() })
//!     .register("post", PostScorer::new())?
//!     .build()?;
//!
//! processor.on(EventKind::TaskFailed, |event| eprintln!("{event:?}"));
//! processor.add_task(TaskConfig::new("post-42", "post", json!({ "content": "..." }))).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::cache::{Cache, InMemoryCache, Memoizer};
use crate::config::{BackendType, ProcessorConfig};
use crate::domain::{BizType, RecordId, TaskConfig, TaskRecord};
use crate::error::{AuditError, BuildError};
use crate::events::{EventBus, EventKind, ListenerId, TaskEvent};
use crate::observability::{PerformanceCounters, QueueStatus};
use crate::queue::{InMemoryTaskQueue, RetryPolicy, TaskQueue};
use crate::resilience::{CircuitBreaker, CircuitState, RateLimiter};
use crate::runtime::{HandlerError, HandlerRegistry, Runtime, TaskHandler};
use crate::worker::{Dispatcher, WorkerGroup};

/// Builds an `AuditProcessor`.
///
/// Fail-fast: config validation, duplicate handler registration and
/// backend/config mismatches are reported by `build()` (or `register()`),
/// never later at dispatch time.
#[derive(Default)]
pub struct ProcessorBuilder {
    config: ProcessorConfig,
    registry: HandlerRegistry,
    queue: Option<Arc<dyn TaskQueue>>,
    cache: Option<Arc<dyn Cache>>,
}

impl ProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Handler for every biz_type without its own registration.
    pub fn handler<H: TaskHandler + 'static>(mut self, handler: H) -> Self {
        self.registry.set_fallback(Arc::new(handler));
        self
    }

    /// Handler for one biz_type.
    pub fn register<H: TaskHandler + 'static>(
        mut self,
        biz_type: impl Into<BizType>,
        handler: H,
    ) -> Result<Self, BuildError> {
        self.registry.register(biz_type.into(), Arc::new(handler))?;
        Ok(self)
    }

    /// Queue backend, used when `queue_type` is `Pluggable`.
    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Cache backend, used when `cache_type` is `Pluggable`.
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate and start the workers. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<AuditProcessor, BuildError> {
        self.config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(BuildError::NoRuntime);
        }

        let queue: Arc<dyn TaskQueue> = match (self.config.queue_type, self.queue) {
            (BackendType::Memory, None) => Arc::new(InMemoryTaskQueue::new()),
            (BackendType::Pluggable, Some(queue)) => queue,
            (BackendType::Pluggable, None) => return Err(BuildError::MissingBackend("queue")),
            (BackendType::Memory, Some(_)) => return Err(BuildError::UnexpectedBackend("queue")),
        };
        let cache: Arc<dyn Cache> = match (self.config.cache_type, self.cache) {
            (BackendType::Memory, None) => Arc::new(InMemoryCache::new()),
            (BackendType::Pluggable, Some(cache)) => cache,
            (BackendType::Pluggable, None) => return Err(BuildError::MissingBackend("cache")),
            (BackendType::Memory, Some(_)) => return Err(BuildError::UnexpectedBackend("cache")),
        };

        if self.registry.is_empty() {
            warn!("audit processor built without any task handler; every task will fail");
        }

        let events = Arc::new(EventBus::new());
        let counters = Arc::new(PerformanceCounters::new());
        let dispatcher = Arc::new(Dispatcher::new(
            queue,
            Runtime::new(Arc::new(self.registry)),
            self.config.circuit_breaker().map(CircuitBreaker::new),
            RetryPolicy::exponential(self.config.retry_backoff_multiplier),
            Arc::clone(&events),
            Arc::clone(&counters),
            self.config.enable_worker_threads,
        ));
        let workers = WorkerGroup::spawn(self.config.concurrency, Arc::clone(&dispatcher));

        info!(
            concurrency = self.config.concurrency,
            circuit_breaker = self.config.enable_circuit_breaker,
            rate_limiting = self.config.enable_rate_limiting,
            worker_threads = self.config.enable_worker_threads,
            "audit processor started"
        );

        Ok(AuditProcessor {
            limiter: self.config.rate_limiter().map(RateLimiter::new),
            config: self.config,
            dispatcher,
            memo: Memoizer::new(cache),
            events,
            counters,
            seq: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            workers: Mutex::new(Some(workers)),
        })
    }
}

/// Bounded-concurrency audit task processor.
///
/// Every instance owns its queue, cache, limiter window, breaker and
/// listeners; instances never share state.
pub struct AuditProcessor {
    config: ProcessorConfig,
    dispatcher: Arc<Dispatcher>,
    limiter: Option<RateLimiter>,
    memo: Memoizer,
    events: Arc<EventBus>,
    counters: Arc<PerformanceCounters>,
    seq: AtomicU64,
    accepting: AtomicBool,
    workers: Mutex<Option<WorkerGroup>>,
}

impl AuditProcessor {
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new()
    }

    /// Processor with the given handler and default config.
    pub fn new<H: TaskHandler + 'static>(handler: H) -> Result<Self, BuildError> {
        Self::builder().handler(handler).build()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Admit one task. Returns as soon as it is queued, not when it finishes.
    ///
    /// Only admission errors are returned here; execution failures are
    /// reported through `task_failed`.
    pub async fn add_task(&self, task: TaskConfig) -> Result<RecordId, AuditError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(AuditError::ShuttingDown);
        }
        task.validate()?;

        if let Some(limiter) = &self.limiter {
            if let Err(err) = limiter.try_admit().await {
                self.counters.rate_limited();
                warn!(task_id = %task.task_id, biz_type = %task.biz_type, "task rejected: {err}");
                return Err(err);
            }
        }

        let record = TaskRecord::new(task, self.seq.fetch_add(1, Ordering::Relaxed));
        let id = record.id;
        debug!(
            record_id = %id,
            task_id = %record.task.task_id,
            biz_type = %record.task.biz_type,
            priority = record.task.priority,
            "task admitted"
        );

        self.events.emit(TaskEvent::TaskAdded(record.clone()));
        self.dispatcher.queue.push(record).await?;
        self.counters.task_added();
        self.dispatcher.wake();
        Ok(id)
    }

    /// Admit tasks in order, stopping at the first rejection.
    ///
    /// Best-effort per item: tasks admitted before the rejected one stay
    /// queued. Use `add_tasks_detailed` to see every item's outcome.
    pub async fn add_tasks<I>(&self, tasks: I) -> Result<Vec<RecordId>, AuditError>
    where
        I: IntoIterator<Item = TaskConfig>,
    {
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(self.add_task(task).await?);
        }
        Ok(ids)
    }

    /// Admit every task independently and report each outcome, in order.
    pub async fn add_tasks_detailed<I>(&self, tasks: I) -> Vec<Result<RecordId, AuditError>>
    where
        I: IntoIterator<Item = TaskConfig>,
    {
        let mut results = Vec::new();
        for task in tasks {
            results.push(self.add_task(task).await);
        }
        results
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus, AuditError> {
        let (counts, in_flight) = self.dispatcher.occupancy().await?;
        Ok(QueueStatus {
            size: counts.total() + in_flight,
            processing: in_flight > 0,
            workers: self.config.concurrency,
            pending: counts.pending,
            retrying: counts.retrying,
            in_flight,
            circuit_state: self.circuit_state().await,
            performance: self.counters.snapshot(),
        })
    }

    /// Drop every pending and retrying record. In-flight records are untouched.
    pub async fn clear_queue(&self) -> Result<usize, AuditError> {
        let removed = self.dispatcher.queue.clear().await?.len();
        info!(removed, "queue cleared");
        self.events.emit(TaskEvent::QueueCleared { removed });
        Ok(removed)
    }

    pub async fn set_cached(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), AuditError> {
        self.memo.cache().set(key, value, ttl).await
    }

    pub async fn get_cached(&self, key: &str) -> Result<Option<Value>, AuditError> {
        let value = self.memo.cache().get(key).await?;
        if value.is_some() {
            self.counters.cache_hit();
        } else {
            self.counters.cache_miss();
        }
        Ok(value)
    }

    /// Cached value for `key`, or the result of `handler` (run once per key,
    /// even under concurrent callers). A handler error is returned and not cached.
    pub async fn process_with_cache<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        handler: F,
    ) -> Result<Value, AuditError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, HandlerError>>,
    {
        let lookup = self
            .memo
            .get_or_compute(key, ttl, || async move { handler().await.map_err(AuditError::from) })
            .await?;
        if lookup.is_hit() {
            self.counters.cache_hit();
        } else {
            self.counters.cache_miss();
        }
        Ok(lookup.into_value())
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.events.once(kind, listener)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.events.off(kind, id)
    }

    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        self.events.remove_all_listeners(kind);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// `None` when the circuit breaker is disabled.
    pub async fn circuit_state(&self) -> Option<CircuitState> {
        match self.dispatcher.breaker() {
            Some(breaker) => Some(breaker.state().await),
            None => None,
        }
    }

    /// Stop admitting tasks, stop the workers and wait for in-flight attempts.
    ///
    /// Records still queued stay in the backend. Calling twice is a no-op.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let workers = self.workers.lock().await.take();
        if let Some(workers) = workers {
            info!("audit processor shutting down");
            workers.shutdown_and_join().await;
        }
    }
}

impl Drop for AuditProcessor {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get_mut().take() {
            workers.request_shutdown();
        }
    }
}
