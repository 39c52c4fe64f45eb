//! In-process completion handles
//!
//! Each queued entry carries a waiter that settles exactly once, when the
//! entry commits or exhausts its retries. Handles are transient: they are
//! never persisted, and after a crash callers look results up by entry id
//! instead.

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{StowageError, StowageResult};

/// Shared settle-once cell.
pub struct EntryWaiter {
    outcome: Mutex<Option<Result<Value, String>>>,
    cond: Condvar,
}

impl Default for EntryWaiter {
    fn default() -> Self {
        Self {
            outcome: Mutex::new(None),
            cond: Condvar::new(),
        }
    }
}

impl EntryWaiter {
    /// Settle the waiter. The first terminal event wins; later calls are
    /// ignored.
    pub fn settle(&self, outcome: Result<Value, String>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> Option<Result<Value, String>> {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            self.cond.wait_for(&mut slot, timeout);
        }
        slot.clone()
    }
}

/// Caller-facing handle for one queued entry.
#[derive(Clone)]
pub struct EntryHandle {
    entry_id: String,
    waiter: Arc<EntryWaiter>,
}

impl EntryHandle {
    /// Create an unsettled handle.
    pub fn new(entry_id: impl Into<String>) -> (Self, Arc<EntryWaiter>) {
        let waiter = Arc::new(EntryWaiter::default());
        (
            Self {
                entry_id: entry_id.into(),
                waiter: Arc::clone(&waiter),
            },
            waiter,
        )
    }

    /// Create a handle already settled with a direct-run outcome.
    pub fn settled(entry_id: impl Into<String>, outcome: StowageResult<Value>) -> Self {
        let (handle, waiter) = Self::new(entry_id);
        waiter.settle(outcome.map_err(|e| e.to_string()));
        handle
    }

    /// The stable entry id for post-crash result lookup.
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// Whether the entry has settled.
    pub fn is_settled(&self) -> bool {
        self.waiter.outcome.lock().is_some()
    }

    /// Block until the entry settles or the timeout elapses.
    pub fn wait(&self, timeout: Duration) -> StowageResult<Value> {
        match self.waiter.wait(timeout) {
            Some(Ok(value)) => Ok(value),
            Some(Err(error)) => Err(StowageError::Storage(error)),
            None => Err(StowageError::Timeout {
                operation: format!("wait for WAL entry {}", self.entry_id),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settle_then_wait() {
        let (handle, waiter) = EntryHandle::new("e1");
        waiter.settle(Ok(json!("done")));
        assert_eq!(handle.wait(Duration::from_millis(10)).unwrap(), json!("done"));
    }

    #[test]
    fn test_first_settle_wins() {
        let (handle, waiter) = EntryHandle::new("e1");
        waiter.settle(Ok(json!(1)));
        waiter.settle(Err("late failure".to_string()));
        assert_eq!(handle.wait(Duration::from_millis(10)).unwrap(), json!(1));
    }

    #[test]
    fn test_wait_timeout() {
        let (handle, _waiter) = EntryHandle::new("e1");
        let err = handle.wait(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_wait_from_other_thread() {
        let (handle, waiter) = EntryHandle::new("e1");
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waiter.settle(Ok(json!("async")));
        });
        assert_eq!(
            handle.wait(Duration::from_secs(2)).unwrap(),
            json!("async")
        );
        thread.join().unwrap();
    }

    #[test]
    fn test_pre_settled_failure() {
        let handle = EntryHandle::settled(
            "e1",
            Err(StowageError::Storage("direct run failed".to_string())),
        );
        assert!(handle.is_settled());
        assert!(handle.wait(Duration::from_millis(1)).is_err());
    }
}
