//! Dispatcher and worker pool.
//!
//! `concurrency` workers share one `Dispatcher`. Each worker loops:
//! take the best ready record -> gate through the circuit breaker ->
//! run the handler under the record's deadline -> settle (complete, retry, fail).
//! A worker runs one record at a time, which is what bounds concurrency.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::TaskRecord;
use crate::error::AuditError;
use crate::events::{EventBus, TaskEvent};
use crate::observability::{PerformanceCounters, QueueCounts};
use crate::queue::{Dequeue, RetryDecision, RetryPolicy, TaskQueue};
use crate::resilience::{CircuitBreaker, Transition};
use crate::runtime::{Runtime, TaskHandler};

/// Pause after a backend error before asking the queue again.
const BACKEND_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Stand-in deadline for retry delays too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub(crate) struct Dispatcher {
    pub(crate) queue: Arc<dyn TaskQueue>,
    runtime: Runtime,
    breaker: Option<CircuitBreaker>,
    retry_policy: RetryPolicy,
    events: Arc<EventBus>,
    counters: Arc<PerformanceCounters>,
    in_flight: AtomicUsize,
    // read: dequeue + in_flight bump, write: status snapshot
    status_gate: RwLock<()>,
    notify: Notify,
    spawn_attempts: bool,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: Arc<dyn TaskQueue>,
        runtime: Runtime,
        breaker: Option<CircuitBreaker>,
        retry_policy: RetryPolicy,
        events: Arc<EventBus>,
        counters: Arc<PerformanceCounters>,
        spawn_attempts: bool,
    ) -> Self {
        Self {
            queue,
            runtime,
            breaker,
            retry_policy,
            events,
            counters,
            in_flight: AtomicUsize::new(0),
            status_gate: RwLock::new(()),
            notify: Notify::new(),
            spawn_attempts,
        }
    }

    /// New work is available.
    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    /// Queue counts and in-flight records, read as one consistent pair.
    ///
    /// A record moving from the queue to a worker is never missing from both.
    pub(crate) async fn occupancy(&self) -> Result<(QueueCounts, usize), AuditError> {
        let _snapshot = self.status_gate.write().await;
        let counts = self.queue.counts().await?;
        Ok((counts, self.in_flight.load(Ordering::Acquire)))
    }

    pub(crate) fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Wait for the next ready record. `None` once shutdown is requested.
    async fn next_record(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Option<TaskRecord> {
        loop {
            if *shutdown_rx.borrow() {
                return None;
            }

            let dequeued = {
                let _claim = self.status_gate.read().await;
                let dequeued = self.queue.dequeue().await;
                if let Ok(Dequeue::Ready(_)) = &dequeued {
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                }
                dequeued
            };

            let next_wake = match dequeued {
                Ok(Dequeue::Ready(record)) => {
                    // pass the wake on; more records may be ready
                    self.notify.notify_one();
                    return Some(record);
                }
                Ok(Dequeue::Wait(next_wake)) => next_wake,
                Err(err) => {
                    error!(error = %err, "queue backend dequeue failed");
                    Some(Instant::now() + BACKEND_ERROR_BACKOFF)
                }
            };

            // 通知・次の retry 時刻・shutdown のどれかで起きる
            let shutdown = if let Some(wake_at) = next_wake {
                tokio::select! {
                    changed = shutdown_rx.changed() => changed.is_err(),
                    _ = self.notify.notified() => false,
                    _ = tokio::time::sleep_until(wake_at) => false,
                }
            } else {
                tokio::select! {
                    changed = shutdown_rx.changed() => changed.is_err(),
                    _ = self.notify.notified() => false,
                }
            };
            if shutdown {
                return None;
            }
        }
    }

    /// Run one attempt of `record` and settle it. Caller already counted it in flight.
    async fn process(&self, mut record: TaskRecord) {
        record.start_attempt();
        debug!(
            record_id = %record.id,
            task_id = %record.task.task_id,
            biz_type = %record.task.biz_type,
            attempt = record.attempt,
            "task started"
        );
        self.events.emit(TaskEvent::TaskStarted(record.clone()));

        let started = Instant::now();
        let outcome = self.dispatch(&record).await;
        self.counters.attempt_finished(started.elapsed());

        self.settle(record, outcome).await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Resolve the handler, pass the circuit breaker, run with the deadline.
    async fn dispatch(&self, record: &TaskRecord) -> Result<Value, AuditError> {
        // a missing handler is a wiring problem, not a downstream failure
        let handler = self.runtime.resolve(record)?;

        let Some(breaker) = &self.breaker else {
            return self.run_attempt(handler, record).await;
        };

        let permit = match breaker.try_acquire().await {
            Ok(admission) => {
                self.report_transition(admission.transition);
                admission.permit
            }
            Err(err) => {
                self.counters.circuit_rejected();
                debug!(record_id = %record.id, "dispatch rejected, circuit open");
                return Err(err);
            }
        };

        let outcome = self.run_attempt(handler, record).await;
        let transition = if outcome.is_ok() {
            breaker.record_success(permit).await
        } else {
            breaker.record_failure(permit).await
        };
        self.report_transition(transition);
        outcome
    }

    async fn run_attempt(
        &self,
        handler: Arc<dyn TaskHandler>,
        record: &TaskRecord,
    ) -> Result<Value, AuditError> {
        let timeout = record.task.timeout;

        let outcome = if self.spawn_attempts {
            let owned = record.clone();
            let mut join = tokio::spawn(async move { handler.handle(&owned).await });
            match tokio::time::timeout(timeout, &mut join).await {
                Ok(Ok(result)) => result.map_err(AuditError::from),
                Ok(Err(join_err)) if join_err.is_panic() => {
                    Err(panicked(record, &*join_err.into_panic()))
                }
                Ok(Err(join_err)) => Err(AuditError::TaskProcessing(format!(
                    "handler task aborted: {join_err}"
                ))),
                Err(_) => {
                    join.abort();
                    Err(AuditError::TaskTimeout(timeout))
                }
            }
        } else {
            let attempt = AssertUnwindSafe(handler.handle(record)).catch_unwind();
            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(result)) => result.map_err(AuditError::from),
                Ok(Err(panic)) => Err(panicked(record, &*panic)),
                // the handler future is dropped here (abandoned, not preempted)
                Err(_) => Err(AuditError::TaskTimeout(timeout)),
            }
        };

        if matches!(outcome, Err(AuditError::TaskTimeout(_))) {
            self.counters.task_timed_out();
        }
        outcome
    }

    /// Apply the outcome: complete, schedule a retry, or fail for good.
    async fn settle(&self, mut record: TaskRecord, outcome: Result<Value, AuditError>) {
        let error = match outcome {
            Ok(value) => {
                record.mark_completed(value);
                self.counters.task_completed();
                info!(
                    record_id = %record.id,
                    task_id = %record.task.task_id,
                    attempt = record.attempt,
                    "task completed"
                );
                self.events.emit(TaskEvent::TaskCompleted(record));
                return;
            }
            Err(error) => error,
        };

        match self.retry_policy.decide(&record) {
            RetryDecision::Retry { delay } => {
                record.schedule_retry(error.clone());
                let snapshot = record.clone();
                let now = Instant::now();
                let run_at = now
                    .checked_add(delay)
                    .unwrap_or_else(|| now + FAR_FUTURE);
                match self.queue.schedule(record, run_at).await {
                    Ok(()) => {
                        self.counters.task_retried();
                        warn!(
                            record_id = %snapshot.id,
                            task_id = %snapshot.task.task_id,
                            attempt = snapshot.attempt,
                            max_retries = snapshot.task.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "task attempt failed, retry scheduled"
                        );
                        self.events.emit(TaskEvent::TaskRetrying {
                            task: snapshot,
                            error,
                            delay,
                        });
                        // a sleeping worker may need to shorten its wait
                        self.wake();
                    }
                    Err(backend) => {
                        error!(
                            record_id = %snapshot.id,
                            error = %backend,
                            "could not schedule retry, failing task"
                        );
                        self.fail(snapshot, backend);
                    }
                }
            }
            RetryDecision::Exhausted => self.fail(record, error),
        }
    }

    fn fail(&self, mut record: TaskRecord, error: AuditError) {
        record.mark_failed(error.clone());
        self.counters.task_failed();
        error!(
            record_id = %record.id,
            task_id = %record.task.task_id,
            attempts = record.attempt,
            error = %error,
            "task failed"
        );
        self.events.emit(TaskEvent::TaskFailed {
            task: record,
            error,
        });
    }

    fn report_transition(&self, transition: Option<Transition>) {
        if let Some(Transition { from, to }) = transition {
            info!(%from, %to, "circuit breaker state changed");
            self.events.emit(TaskEvent::CircuitStateChanged { from, to });
        }
    }
}

fn panicked(record: &TaskRecord, payload: &(dyn Any + Send)) -> AuditError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    error!(record_id = %record.id, panic = %message, "handler panicked");
    AuditError::TaskProcessing(format!("handler panicked: {message}"))
}

/// Worker group handle.
/// - `request_shutdown()` stops every worker from taking new records
/// - `shutdown_and_join()` additionally waits for in-flight attempts
pub(crate) struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers.
    pub(crate) fn spawn(n: usize, dispatcher: Arc<Dispatcher>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..n)
            .map(|worker_id| {
                let dispatcher = Arc::clone(&dispatcher);
                let rx = shutdown_rx.clone();
                tokio::spawn(worker_loop(worker_id, dispatcher, rx))
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    /// In-flight handler execution is not cancelled; workers just stop
    /// taking new records.
    pub(crate) fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "worker ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    while let Some(record) = dispatcher.next_record(&mut shutdown_rx).await {
        dispatcher.process(record).await;
    }
    debug!(worker_id, "worker stopped");
}
