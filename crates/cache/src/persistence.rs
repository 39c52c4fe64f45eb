//! Asynchronous cache persistence
//!
//! Every cache mutation enqueues a persistence task; a flush drains the
//! queue through the injected sink. Failed tasks move to a retry queue
//! with exponential backoff and a bounded attempt count, and the retry
//! queue's age is surfaced in cache stats so callers can detect stuck
//! persistence.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use stowage_core::StowageResult;
use tracing::{debug, error, warn};

/// Base backoff before a failed task becomes eligible again.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// A vector as the sink stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedVector {
    /// Vector id
    pub id: String,
    /// Embedding values
    pub vector: Vec<f32>,
    /// Opaque caller payload
    pub payload: Value,
    /// Whether the entry was pinned when saved
    pub pinned: bool,
}

/// Durable sink the cache persists through.
pub trait VectorPersistence: Send + Sync {
    /// Insert or replace a vector.
    fn save(&self, entry: &PersistedVector) -> StowageResult<()>;
    /// Remove a vector.
    fn delete(&self, id: &str) -> StowageResult<()>;
    /// Load every persisted vector.
    fn load_all(&self) -> StowageResult<Vec<PersistedVector>>;
    /// Remove every persisted vector.
    fn clear(&self) -> StowageResult<()>;
}

/// One deferred persistence action.
#[derive(Debug, Clone)]
pub enum PersistTask {
    /// Save (insert or replace) a vector
    Save(PersistedVector),
    /// Delete a vector by id
    Delete(String),
}

impl PersistTask {
    fn key(&self) -> &str {
        match self {
            PersistTask::Save(entry) => &entry.id,
            PersistTask::Delete(id) => id,
        }
    }
}

/// A task in the retry queue.
#[derive(Debug)]
pub struct RetryEntry {
    task: PersistTask,
    attempts: u32,
    last_error: String,
    next_eligible_at: Instant,
    first_failed_at: Instant,
}

/// Snapshot of the retry queue for stats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryQueueStats {
    /// Tasks waiting to be retried
    pub size: usize,
    /// Age of the oldest stuck task, in milliseconds
    pub oldest_age_ms: u64,
    /// Retry attempts before a task is dropped
    pub max_retries: u32,
}

struct QueueInner {
    pending: VecDeque<PersistTask>,
    retries: Vec<RetryEntry>,
}

/// Deferred persistence queue with retry/backoff.
pub struct PersistenceQueue {
    inner: Mutex<QueueInner>,
    max_retries: u32,
}

impl PersistenceQueue {
    /// Create an empty queue.
    pub fn new(max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                retries: Vec::new(),
            }),
            max_retries,
        }
    }

    /// Enqueue a task. A newer task for the same key supersedes queued
    /// ones, so only the latest state is written.
    pub fn enqueue(&self, task: PersistTask) {
        let mut inner = self.inner.lock();
        let key = task.key().to_string();
        inner.pending.retain(|queued| queued.key() != key);
        inner.retries.retain(|entry| entry.task.key() != key);
        inner.pending.push_back(task);
    }

    /// Drop every queued and retrying task for a key.
    pub fn cancel(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.pending.retain(|task| task.key() != key);
        inner.retries.retain(|entry| entry.task.key() != key);
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        inner.retries.clear();
    }

    /// Number of tasks waiting in the main queue.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Retry queue snapshot.
    pub fn retry_stats(&self) -> RetryQueueStats {
        let inner = self.inner.lock();
        let oldest_age_ms = inner
            .retries
            .iter()
            .map(|entry| entry.first_failed_at.elapsed().as_millis() as u64)
            .max()
            .unwrap_or(0);
        RetryQueueStats {
            size: inner.retries.len(),
            oldest_age_ms,
            max_retries: self.max_retries,
        }
    }

    /// Drain the main queue through the sink. Failures move to the retry
    /// queue. Returns how many tasks the sink accepted.
    pub fn flush(&self, sink: &dyn VectorPersistence) -> usize {
        let mut flushed = 0;
        loop {
            let task = match self.inner.lock().pending.pop_front() {
                Some(task) => task,
                None => break,
            };
            match run_task(sink, &task) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    warn!(key = task.key(), error = %e, "persistence task failed; queued for retry");
                    let now = Instant::now();
                    self.inner.lock().retries.push(RetryEntry {
                        task,
                        attempts: 1,
                        last_error: e.to_string(),
                        next_eligible_at: now + RETRY_BASE_DELAY,
                        first_failed_at: now,
                    });
                }
            }
        }
        flushed
    }

    /// Retry eligible tasks. Tasks out of attempts are dropped with an
    /// error log. Returns how many tasks succeeded.
    pub fn flush_retries(&self, sink: &dyn VectorPersistence) -> usize {
        let now = Instant::now();
        let eligible: Vec<RetryEntry> = {
            let mut inner = self.inner.lock();
            let mut rest = Vec::new();
            let mut due = Vec::new();
            for entry in inner.retries.drain(..) {
                if entry.next_eligible_at <= now {
                    due.push(entry);
                } else {
                    rest.push(entry);
                }
            }
            inner.retries = rest;
            due
        };

        let mut flushed = 0;
        for mut entry in eligible {
            match run_task(sink, &entry.task) {
                Ok(()) => {
                    debug!(key = entry.task.key(), attempts = entry.attempts, "retried persistence task succeeded");
                    flushed += 1;
                }
                Err(e) => {
                    entry.attempts += 1;
                    entry.last_error = e.to_string();
                    if entry.attempts >= self.max_retries {
                        error!(
                            key = entry.task.key(),
                            attempts = entry.attempts,
                            error = %entry.last_error,
                            "persistence task dropped after exhausting retries"
                        );
                        continue;
                    }
                    let backoff = RETRY_BASE_DELAY * 2u32.saturating_pow(entry.attempts - 1);
                    entry.next_eligible_at = Instant::now() + backoff;
                    self.inner.lock().retries.push(entry);
                }
            }
        }
        flushed
    }
}

fn run_task(sink: &dyn VectorPersistence, task: &PersistTask) -> StowageResult<()> {
    match task {
        PersistTask::Save(entry) => sink.save(entry),
        PersistTask::Delete(id) => sink.delete(id),
    }
}

/// In-memory sink for tests and volatile embeddings.
#[derive(Default)]
pub struct MemoryVectorPersistence {
    entries: Mutex<Vec<PersistedVector>>,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryVectorPersistence {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make saves fail, to exercise the retry queue.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::Release);
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the sink is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl VectorPersistence for MemoryVectorPersistence {
    fn save(&self, entry: &PersistedVector) -> StowageResult<()> {
        if self.fail_saves.load(std::sync::atomic::Ordering::Acquire) {
            return Err(stowage_core::StowageError::Storage(
                "persistence sink unavailable".to_string(),
            ));
        }
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> StowageResult<()> {
        self.entries.lock().retain(|entry| entry.id != id);
        Ok(())
    }

    fn load_all(&self) -> StowageResult<Vec<PersistedVector>> {
        Ok(self.entries.lock().clone())
    }

    fn clear(&self) -> StowageResult<()> {
        self.entries.lock().clear();
        Ok(())
    }
}
