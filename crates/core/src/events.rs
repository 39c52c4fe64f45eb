//! Lifecycle event bus
//!
//! Publish/subscribe over a closed set of topics. Collaborators (engine,
//! fallback backend, WAL) emit lifecycle events; embedders and other
//! components subscribe. Subscriptions unsubscribe on drop or explicitly.
//!
//! Payloads are JSON documents whose shape is fixed by the emitting
//! component.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// The closed set of event topics the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A schema upgrade is blocked by other open connections
    ConnectionBlocked,
    /// An open attempt failed and will be retried
    ConnectionRetry,
    /// A connection was established
    ConnectionEstablished,
    /// All open attempts failed
    ConnectionFailed,
    /// The fallback backend was activated after connection failure
    FallbackActivated,
    /// The fallback backend selected its mode at init
    FallbackActive,
    /// The fallback backend downgraded or hit a recoverable problem
    FallbackWarning,
    /// A storage-level error was surfaced
    StorageError,
    /// WAL replay finished (successfully or not)
    WalReplayComplete,
    /// Worker-pool cleanup failed
    WorkerCleanupFailed,
}

impl Topic {
    /// Wire name of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ConnectionBlocked => "storage:connection_blocked",
            Topic::ConnectionRetry => "storage:connection_retry",
            Topic::ConnectionEstablished => "storage:connection_established",
            Topic::ConnectionFailed => "storage:connection_failed",
            Topic::FallbackActivated => "storage:fallback_activated",
            Topic::FallbackActive => "storage:fallback_active",
            Topic::FallbackWarning => "storage:fallback_warning",
            Topic::StorageError => "storage:error",
            Topic::WalReplayComplete => "wal:replay_complete",
            Topic::WorkerCleanupFailed => "worker:cleanup_failed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct BusInner {
    subscribers: RwLock<HashMap<Topic, Vec<(u64, Callback)>>>,
    next_id: AtomicU64,
}

/// Publish/subscribe bus for lifecycle events.
///
/// Cloning is cheap; clones share the same subscriber registry. Emission
/// runs callbacks inline on the emitting thread, outside the registry lock.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event to all subscribers of `topic`.
    pub fn emit(&self, topic: Topic, payload: Value) {
        debug!(topic = topic.as_str(), "emitting event");
        // Snapshot callbacks so a subscriber may unsubscribe re-entrantly.
        let callbacks: Vec<Callback> = {
            let subs = self.inner.subscribers.read();
            subs.get(&topic)
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default()
        };
        for cb in callbacks {
            cb(&payload);
        }
    }

    /// Subscribe to a topic. The subscription lasts until the returned
    /// handle is dropped or `unsubscribe` is called.
    pub fn on(&self, topic: Topic, callback: impl Fn(&Value) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .entry(topic)
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
            active: true,
        }
    }

    /// Number of live subscribers for a topic (for tests and stats).
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&topic)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

/// Handle to an active subscription; unsubscribes on drop.
pub struct Subscription {
    bus: Weak<BusInner>,
    topic: Topic,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Remove the subscription now. Idempotent.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.bus.upgrade() {
            let mut subs = inner.subscribers.write();
            if let Some(list) = subs.get_mut(&self.topic) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
