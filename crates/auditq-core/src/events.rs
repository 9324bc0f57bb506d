//! Task lifecycle events and the per-processor listener registry.
//!
//! Every processor owns its own `EventBus`; there is no global bus. Listeners
//! are called synchronously on the worker that produced the event, so they
//! should return quickly (hand heavy work to a channel or a spawned task).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::TaskRecord;
use crate::error::AuditError;
use crate::resilience::CircuitState;

const STREAM_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskAdded,
    TaskStarted,
    TaskRetrying,
    TaskCompleted,
    TaskFailed,
    QueueCleared,
    CircuitStateChanged,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TaskAdded => "task_added",
            EventKind::TaskStarted => "task_started",
            EventKind::TaskRetrying => "task_retrying",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
            EventKind::QueueCleared => "queue_cleared",
            EventKind::CircuitStateChanged => "circuit_state_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum TaskEvent {
    TaskAdded(TaskRecord),
    TaskStarted(TaskRecord),
    TaskRetrying {
        task: TaskRecord,
        error: AuditError,
        delay: Duration,
    },
    /// Terminal. Fired exactly once per record, never together with `TaskFailed`.
    TaskCompleted(TaskRecord),
    /// Terminal. Fired exactly once per record, never together with `TaskCompleted`.
    TaskFailed {
        task: TaskRecord,
        error: AuditError,
    },
    QueueCleared {
        removed: usize,
    },
    CircuitStateChanged {
        from: CircuitState,
        to: CircuitState,
    },
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TaskEvent::TaskAdded(_) => EventKind::TaskAdded,
            TaskEvent::TaskStarted(_) => EventKind::TaskStarted,
            TaskEvent::TaskRetrying { .. } => EventKind::TaskRetrying,
            TaskEvent::TaskCompleted(_) => EventKind::TaskCompleted,
            TaskEvent::TaskFailed { .. } => EventKind::TaskFailed,
            TaskEvent::QueueCleared { .. } => EventKind::QueueCleared,
            TaskEvent::CircuitStateChanged { .. } => EventKind::CircuitStateChanged,
        }
    }

    /// The record this event is about, if any.
    pub fn record(&self) -> Option<&TaskRecord> {
        match self {
            TaskEvent::TaskAdded(task)
            | TaskEvent::TaskStarted(task)
            | TaskEvent::TaskCompleted(task)
            | TaskEvent::TaskRetrying { task, .. }
            | TaskEvent::TaskFailed { task, .. } => Some(task),
            TaskEvent::QueueCleared { .. } | TaskEvent::CircuitStateChanged { .. } => None,
        }
    }
}

pub type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stream,
        }
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.add(kind, Arc::new(listener), false)
    }

    /// Like `on`, but the listener is removed after its first call.
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.add(kind, Arc::new(listener), true)
    }

    /// Returns false if `id` was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(registrations) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|reg| reg.id != id);
        before != registrations.len()
    }

    /// `None` clears every kind.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let mut listeners = self.lock();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Channel view of the same events. Slow receivers may observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.stream.subscribe()
    }

    pub fn emit(&self, event: TaskEvent) {
        let kind = event.kind();
        let to_call: Vec<Listener> = {
            let mut listeners = self.lock();
            match listeners.get_mut(&kind) {
                Some(registrations) => {
                    let calls = registrations
                        .iter()
                        .map(|reg| Arc::clone(&reg.listener))
                        .collect();
                    registrations.retain(|reg| !reg.once);
                    calls
                }
                None => Vec::new(),
            }
        };

        // called outside the lock so listeners may call on/off
        for listener in to_call {
            listener(&event);
        }

        // no receivers is fine
        let _ = self.stream.send(event);
    }

    fn add(&self, kind: EventKind, listener: Listener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(kind).or_default().push(Registration { id, once, listener });
        id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Registration>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
