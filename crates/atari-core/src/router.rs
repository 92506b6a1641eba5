use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::event::Event;

/// Default per-subscriber queue depth. Sinks that must not drop (the state
/// sink) subscribe with a larger capacity.
pub const DEFAULT_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// EventRouter
// ---------------------------------------------------------------------------

/// Single-producer-to-many-consumers fan-out.
///
/// Each subscriber holds a bounded queue; `emit` never blocks: when a
/// queue is full the event is dropped for that subscriber and a structured
/// warning is logged. Within one subscriber delivery is FIFO; no ordering
/// is guaranteed across subscribers.
pub struct EventRouter {
    registry: Mutex<Registry>,
    dropped: AtomicU64,
}

struct Registry {
    next_id: u64,
    subscribers: Vec<SubscriberEntry>,
    closed: bool,
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Consumer side of one subscriber queue.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event; `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for tests and polling consumers.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                subscribers: Vec::new(),
                closed: false,
            }),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_CAPACITY)
    }

    /// Add a subscriber with an explicit queue depth.
    ///
    /// After [`EventRouter::close`] the returned queue is already closed:
    /// `recv` yields `None` immediately.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        if !registry.closed {
            registry.subscribers.push(SubscriberEntry { id, tx });
        }
        Subscription { id, rx }
    }

    /// Remove a subscriber and close its queue. Idempotent on unknown ids.
    pub fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|s| s.id != id);
    }

    /// Fan the event out to every subscriber without blocking.
    ///
    /// The registry lock is released before any queue push so a slow
    /// consumer can never stall the producer or other consumers.
    pub fn emit(&self, event: Event) {
        let senders: Vec<(u64, mpsc::Sender<Event>)> = {
            let registry = self.lock();
            if registry.closed {
                return;
            }
            registry
                .subscribers
                .iter()
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        for (id, tx) in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscriber = id,
                        event_type = dropped.type_name(),
                        source = ?dropped.source,
                        "subscriber queue full, dropping event"
                    );
                }
                // Consumer went away without unsubscribing; nothing to do.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Total events dropped across all subscribers since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close all subscriber queues. Idempotent; later `emit` is a no-op.
    pub fn close(&self) {
        let mut registry = self.lock();
        registry.closed = true;
        registry.subscribers.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
