//! Tab coordination interface
//!
//! At most one tab holds write authority at a time. The engine and the WAL
//! consult the coordinator before mutating shared state; they never decide
//! authority themselves. The trait is injected into collaborators so a real
//! cross-tab election scheme can be supplied by the embedder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked when write authority changes. Receives the new
/// write-allowed state.
pub type AuthorityListener = Box<dyn Fn(bool) + Send + Sync>;

/// Read-only view of tab authority, consumed by the engine and the WAL.
pub trait TabCoordinator: Send + Sync {
    /// Whether this process is the primary (write-authoritative) tab.
    fn is_primary(&self) -> bool;

    /// Whether writes are currently allowed from this process.
    fn is_write_allowed(&self) -> bool;

    /// Register a listener for authority changes.
    fn on_authority_change(&self, listener: AuthorityListener);
}

/// Process-local coordinator backed by atomics.
///
/// Suitable for single-process embeddings and tests; an embedder with real
/// cross-tab election wraps its scheme in the `TabCoordinator` trait
/// instead.
pub struct SharedCoordinator {
    primary: AtomicBool,
    write_allowed: AtomicBool,
    listeners: parking_lot::Mutex<Vec<AuthorityListener>>,
}

impl SharedCoordinator {
    /// Create a coordinator that starts with the given authority.
    pub fn new(primary: bool) -> Arc<Self> {
        Arc::new(Self {
            primary: AtomicBool::new(primary),
            write_allowed: AtomicBool::new(primary),
            listeners: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Grant or revoke primary status, notifying listeners on change.
    pub fn set_primary(&self, primary: bool) {
        let was = self.primary.swap(primary, Ordering::AcqRel);
        self.write_allowed.store(primary, Ordering::Release);
        if was != primary {
            let listeners = self.listeners.lock();
            for listener in listeners.iter() {
                listener(primary);
            }
        }
    }
}

impl TabCoordinator for SharedCoordinator {
    fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    fn is_write_allowed(&self) -> bool {
        self.write_allowed.load(Ordering::Acquire)
    }

    fn on_authority_change(&self, listener: AuthorityListener) {
        self.listeners.lock().push(listener);
    }
}
