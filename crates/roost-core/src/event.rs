//! In-process event bus.
//!
//! Handlers register per event kind. Every handler owns a bounded queue
//! drained by its own task, so a slow handler only ever loses its own
//! events and publishing never waits.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::session::Session;

/// Default per-handler queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Event kinds handlers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A session was cleared, by expiry or explicitly.
    SessionExpired,
}

/// Event payloads.
#[derive(Debug, Clone)]
pub enum EventPayload {
    SessionExpired(Session),
}

/// An event with its creation time.
#[derive(Debug, Clone)]
pub struct Event {
    pub payload: EventPayload,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Event {
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    #[must_use]
    pub fn session_expired(session: Session) -> Self {
        Self::new(EventPayload::SessionExpired(session))
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::SessionExpired(_) => EventKind::SessionExpired,
        }
    }
}

/// Something that reacts to events.
///
/// Handlers run on their own task; a panic inside `handle` is caught and
/// logged and the handler keeps receiving later events.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn handle(&self, event: &Event) {
        self(event);
    }
}

struct Registration {
    handler: Arc<dyn EventHandler>,
    tx: mpsc::Sender<Arc<Event>>,
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// Publish/subscribe hub for [`Event`]s.
pub struct EventBus {
    capacity: usize,
    handlers: Mutex<HashMap<EventKind, Vec<Registration>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus whose handler queues hold `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            handlers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler` for `kind`.
    ///
    /// Returns `false` if this exact handler is already registered for the
    /// kind. Must be called from within a Tokio runtime.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.lock();
        let registered = handlers.entry(kind).or_default();
        if registered.iter().any(|r| same_handler(&r.handler, &handler)) {
            return false;
        }

        let (tx, mut rx) = mpsc::channel::<Arc<Event>>(self.capacity);
        let consumer = Arc::clone(&handler);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(|| consumer.handle(&event))).is_err() {
                    error!(kind = ?event.kind(), "Event handler panicked");
                }
            }
        });

        registered.push(Registration { handler, tx });
        self.tasks.lock().push(task);
        debug!(kind = ?kind, handlers = registered.len(), "Event handler registered");
        true
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// Never blocks. A handler whose queue is full misses this event.
    /// Returns the number of handlers the event was queued for.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind();
        let handlers = self.handlers.lock();
        let Some(registered) = handlers.get(&kind) else {
            return 0;
        };

        let event = Arc::new(event);
        let mut delivered = 0;
        for registration in registered {
            match registration.tx.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(kind = ?kind, "Event queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(kind = ?kind, "Event handler stopped, dropping event");
                }
            }
        }
        delivered
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Unregister every handler and wait for queued events to drain.
    pub async fn shutdown(&self) {
        self.handlers.lock().clear();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        debug!("Event bus stopped");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
