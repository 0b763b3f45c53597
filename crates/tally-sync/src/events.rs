//! Explicit publish/subscribe bus.
//!
//! Handlers run synchronously on the publishing task, outside the bus lock, so a handler may
//! subscribe or unsubscribe without deadlocking. Handlers should be quick; anything slow belongs
//! on a channel the handler forwards to.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tracing::trace;

use crate::{connectivity::Connectivity, engine::SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectivityChanged,
    SyncCompleted,
    SubmissionQueued,
    RecordsEvicted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectivityChanged(Connectivity),
    SyncCompleted(SyncReport),
    SubmissionQueued { id: String },
    RecordsEvicted { ids: Vec<String>, freed_bytes: u64 },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::ConnectivityChanged(_) => EventKind::ConnectivityChanged,
            SyncEvent::SyncCompleted(_) => EventKind::SyncCompleted,
            SyncEvent::SubmissionQueued { .. } => EventKind::SubmissionQueued,
            SyncEvent::RecordsEvicted { .. } => EventKind::RecordsEvicted,
        }
    }
}

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Unsubscribe
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Unsubscribe {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    pub fn publish(&self, event: SyncEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        trace!(?kind, subscribers = handlers.len(), "publishing event");
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .lock()
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it keeps the subscription alive.
#[must_use = "call unsubscribe() to remove the handler; dropping keeps it registered"]
pub struct Unsubscribe {
    bus: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut handlers = inner.handlers.lock();
        if let Some(entries) = handlers.get_mut(&self.kind) {
            entries.retain(|(id, _)| *id != self.id);
        }
    }
}
