//! Status notifications and message transcript for the UI layer.

use crate::domain::models::{MessageKind, MessageLogEntry, StatusEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// Fan-out of [`StatusEvent`]s to any number of subscribers
#[derive(Default)]
pub struct StatusBus {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<StatusEvent>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl StatusBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscriber. After [`close`](Self::close) the returned
    /// subscription yields nothing.
    pub fn subscribe(self: &Arc<Self>) -> StatusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.closed.load(Ordering::Acquire) {
            self.lock().insert(id, tx);
        }

        StatusSubscription {
            id,
            rx,
            bus: Arc::downgrade(self),
        }
    }

    pub fn emit(&self, event: StatusEvent) {
        trace!("Status event: {:?}", event);
        // Receivers that went away without unsubscribing are pruned here
        self.lock().retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every subscriber; their streams end
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<StatusEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by [`StatusBus::subscribe`]. Dropping it unsubscribes.
pub struct StatusSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<StatusEvent>,
    bus: Weak<StatusBus>,
}

impl StatusSubscription {
    /// Next event, or `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued
    pub fn drain(&mut self) -> Vec<StatusEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Drop for StatusSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Bounded transcript of what was sent and what happened to the link
pub struct MessageLog {
    entries: Mutex<VecDeque<MessageLogEntry>>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, text: impl Into<String>, kind: MessageKind) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(MessageLogEntry::new(text, kind));
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<MessageLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
