//! Worker-pool interface
//!
//! The engine offloads long-running algorithmic work to an external worker
//! pool. Only the contract lives here: message envelopes, heartbeats, the
//! backpressure counter with its listener protocol, and pool-termination
//! rejection. The pool implementation itself is outside the core.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stowage_core::{now_ms, StowageError, StowageResult};
use tracing::{debug, warn};

/// A task envelope sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTask {
    /// Correlates responses to requests
    pub request_id: u64,
    /// Operation the worker should run
    pub operation: String,
    /// Operation input
    pub payload: Value,
}

/// A worker heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHeartbeat {
    /// Which worker sent it
    pub worker_id: usize,
    /// When, milliseconds since epoch
    pub timestamp: u64,
}

impl WorkerHeartbeat {
    /// A heartbeat from `worker_id` stamped now.
    pub fn now(worker_id: usize) -> Self {
        Self {
            worker_id,
            timestamp: now_ms(),
        }
    }
}

/// A message coming back from a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum WorkerResponse {
    /// A finished task
    Result {
        /// The request this answers
        request_id: u64,
        /// The task's output
        result: Value,
    },
    /// A failed task
    Error {
        /// The request this answers
        request_id: u64,
        /// What went wrong
        error: String,
    },
    /// Liveness signal
    Heartbeat(WorkerHeartbeat),
}

/// Pause/resume thresholds for pending results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureWatermarks {
    /// Pending-result count that pauses production
    pub high: usize,
    /// Pending-result count that resumes production
    pub low: usize,
}

impl BackpressureWatermarks {
    /// Validated constructor: `low` must be below `high`.
    pub fn new(low: usize, high: usize) -> StowageResult<Self> {
        if low >= high {
            return Err(StowageError::InvalidOperation(format!(
                "backpressure low watermark {low} must be below high watermark {high}"
            )));
        }
        Ok(Self { high, low })
    }
}

/// Listener for backpressure transitions.
pub trait BackpressureListener: Send + Sync {
    /// Production should pause.
    fn on_backpressure(&self);
    /// Production may resume.
    fn on_resume(&self);
}

struct CounterState {
    delivered: HashSet<u64>,
    listeners: Vec<Arc<dyn BackpressureListener>>,
}

/// Pending-result accounting with watermark-driven pause/resume.
///
/// `on_result_delivered` and `on_result_consumed` pair one-to-one per
/// request id; a consume for an unknown id is ignored, so double consumes
/// and underflow cannot corrupt the counter.
pub struct ResultCounter {
    watermarks: BackpressureWatermarks,
    state: Mutex<CounterState>,
    paused: AtomicBool,
}

impl ResultCounter {
    /// Create a counter with the given watermarks.
    pub fn new(watermarks: BackpressureWatermarks) -> Self {
        Self {
            watermarks,
            state: Mutex::new(CounterState {
                delivered: HashSet::new(),
                listeners: Vec::new(),
            }),
            paused: AtomicBool::new(false),
        }
    }

    /// Register a backpressure listener.
    pub fn add_listener(&self, listener: Arc<dyn BackpressureListener>) {
        self.state.lock().listeners.push(listener);
    }

    /// Pending (delivered, not yet consumed) results.
    pub fn pending(&self) -> usize {
        self.state.lock().delivered.len()
    }

    /// Whether production is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Record a result delivered to the consumer.
    pub fn on_result_delivered(&self, request_id: u64) {
        let listeners = {
            let mut state = self.state.lock();
            if !state.delivered.insert(request_id) {
                warn!(request_id, "duplicate result delivery ignored");
                return;
            }
            if state.delivered.len() >= self.watermarks.high
                && !self.paused.swap(true, Ordering::AcqRel)
            {
                debug!(pending = state.delivered.len(), "backpressure pause");
                state.listeners.clone()
            } else {
                Vec::new()
            }
        };
        for listener in listeners {
            listener.on_backpressure();
        }
    }

    /// Record a delivered result as consumed. Must be called exactly once
    /// per delivery; surplus calls are ignored.
    pub fn on_result_consumed(&self, request_id: u64) {
        let listeners = {
            let mut state = self.state.lock();
            if !state.delivered.remove(&request_id) {
                warn!(request_id, "consume for unknown result ignored");
                return;
            }
            if state.delivered.len() <= self.watermarks.low
                && self.paused.swap(false, Ordering::AcqRel)
            {
                debug!(pending = state.delivered.len(), "backpressure resume");
                state.listeners.clone()
            } else {
                Vec::new()
            }
        };
        for listener in listeners {
            listener.on_resume();
        }
    }
}

/// In-flight request registry that rejects everything on termination.
#[derive(Default)]
pub struct PendingRequests {
    inflight: Mutex<HashSet<u64>>,
    terminated: AtomicBool,
}

impl PendingRequests {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request. Fails once the pool is terminated.
    pub fn register(&self, request_id: u64) -> StowageResult<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(StowageError::PoolTerminated(format!(
                "request {request_id} rejected; pool is terminated"
            )));
        }
        self.inflight.lock().insert(request_id);
        Ok(())
    }

    /// Settle a request normally.
    pub fn complete(&self, request_id: u64) -> bool {
        self.inflight.lock().remove(&request_id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    /// Terminate the pool: every pending request is rejected and returned
    /// so callers can fail their waiters with `PoolTerminated`.
    pub fn terminate(&self) -> Vec<u64> {
        self.terminated.store(true, Ordering::Release);
        let mut inflight = self.inflight.lock();
        let mut rejected: Vec<u64> = inflight.drain().collect();
        rejected.sort_unstable();
        rejected
    }
}
