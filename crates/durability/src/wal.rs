//! Write-ahead log
//!
//! A durable, prioritized queue of deferred operations persisted on the
//! key/value surface. Writes queued while the precondition gate is closed
//! survive crashes and reloads; the write-authoritative tab drains them in
//! (priority, sequence) order once the gate opens. Every drain of a
//! persisted entry goes through the replay idempotency adapter, so a write
//! that committed right before a crash can be applied again safely.
//!
//! # State keys
//!
//! - `stowage_wal`: the entry array, insertion order, trimmed newest-first
//! - `stowage_wal_seq`: the latest sequence number
//! - `stowage_wal_results`: recency-limited entry results

use crate::entry::{WalEntry, WalPriority, WalResultRecord, WalStatus, DEFERRED_ERROR};
use crate::gate::Precondition;
use crate::handle::{EntryHandle, EntryWaiter};
use crate::registry::{OpHandler, OperationRegistry};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use stowage_core::{now_ms, EventBus, StowageResult, TabCoordinator, Topic, WalConfig};
use stowage_storage::KvSurface;
use tracing::{debug, info, warn};

/// Key holding the persisted entry array.
pub const WAL_KEY: &str = "stowage_wal";
/// Key holding the latest sequence number.
pub const WAL_SEQ_KEY: &str = "stowage_wal_seq";
/// Key holding the recency-limited result records.
pub const WAL_RESULTS_KEY: &str = "stowage_wal_results";

/// How long committed entries are retained before cleanup.
pub const COMMITTED_RETENTION_MS: u64 = 60_000;
/// Processing entries older than this at load are presumed crashed.
pub const CRASHED_PROCESSING_MS: u64 = 60_000;
/// Bound on how long an enqueue waits for an in-flight replay.
pub const REPLAY_WAIT_MS: u64 = 5_000;

/// Outcome of `queue_write`.
pub struct QueuedWrite {
    /// Stable id for post-crash result lookup
    pub entry_id: String,
    /// Settles when the entry commits or exhausts retries
    pub handle: EntryHandle,
    /// Whether the write was deferred into the queue (vs run directly)
    pub deferred: bool,
}

struct WalInner {
    entries: Vec<WalEntry>,
    results: Vec<WalResultRecord>,
    sequence: u64,
}

/// The write-ahead log.
pub struct WriteAheadLog {
    kv: Arc<KvSurface>,
    config: WalConfig,
    bus: EventBus,
    coordinator: Arc<dyn TabCoordinator>,
    precondition: Arc<dyn Precondition>,
    registry: OperationRegistry,
    inner: Mutex<WalInner>,
    waiters: Mutex<HashMap<String, Arc<EntryWaiter>>>,
    is_processing: AtomicBool,
    is_replaying: AtomicBool,
    replay_wait: Mutex<()>,
    replay_cond: Condvar,
    last_replay: Mutex<Option<Instant>>,
    scheduled_at: Mutex<Option<Instant>>,
    heartbeat: Duration,
}

/// Heartbeat interval tuned to the device: constrained devices poll the
/// gate less often.
fn device_heartbeat() -> Duration {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    if cores >= 8 {
        Duration::from_millis(500)
    } else if cores >= 4 {
        Duration::from_millis(1000)
    } else {
        Duration::from_millis(2000)
    }
}

impl WriteAheadLog {
    /// Open the WAL over a key/value surface, loading persisted state.
    pub fn new(
        kv: Arc<KvSurface>,
        config: WalConfig,
        bus: EventBus,
        coordinator: Arc<dyn TabCoordinator>,
        precondition: Arc<dyn Precondition>,
    ) -> Arc<Self> {
        let inner = Self::load_state(&kv, &config);
        let wal = Arc::new(Self {
            kv,
            config,
            bus,
            coordinator: Arc::clone(&coordinator),
            precondition,
            registry: OperationRegistry::new(),
            inner: Mutex::new(inner),
            waiters: Mutex::new(HashMap::new()),
            is_processing: AtomicBool::new(false),
            is_replaying: AtomicBool::new(false),
            replay_wait: Mutex::new(()),
            replay_cond: Condvar::new(),
            last_replay: Mutex::new(None),
            scheduled_at: Mutex::new(None),
            heartbeat: device_heartbeat(),
        });

        // A tab gaining authority starts draining; one losing it stops.
        let weak: Weak<WriteAheadLog> = Arc::downgrade(&wal);
        coordinator.on_authority_change(Box::new(move |allowed| {
            if let Some(wal) = weak.upgrade() {
                if allowed {
                    wal.schedule_processing(Duration::ZERO);
                } else {
                    *wal.scheduled_at.lock() = None;
                }
            }
        }));

        wal
    }

    /// The operation registry; the engine registers its primitives here.
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Register an operation (see `OperationRegistry::register`).
    pub fn register_operation(
        &self,
        name: impl Into<String>,
        idempotent: bool,
        replay_reviewed: bool,
        handler: OpHandler,
    ) -> StowageResult<()> {
        self.registry.register(name, idempotent, replay_reviewed, handler)
    }

    fn load_state(kv: &KvSurface, config: &WalConfig) -> WalInner {
        let now = now_ms();
        let entries: Vec<WalEntry> = kv
            .get(WAL_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let fresh: Vec<WalEntry> = entries
            .into_iter()
            .filter(|entry| now.saturating_sub(entry.created_at) < config.max_age_ms)
            .collect();
        let results: Vec<WalResultRecord> = kv
            .get(WAL_RESULTS_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let results = results
            .into_iter()
            .filter(|record| now.saturating_sub(record.timestamp) < config.results_max_age_ms)
            .collect();
        let sequence = kv
            .get(WAL_SEQ_KEY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        WalInner {
            entries: fresh,
            results,
            sequence,
        }
    }

    fn persist(&self, inner: &mut WalInner) -> StowageResult<()> {
        // Newest-first trim of non-committed entries to the cap.
        let non_committed = inner
            .entries
            .iter()
            .filter(|entry| entry.status != WalStatus::Committed)
            .count();
        if non_committed > self.config.max_size {
            let mut to_drop = non_committed - self.config.max_size;
            inner.entries.retain(|entry| {
                if to_drop > 0 && entry.status != WalStatus::Committed {
                    to_drop -= 1;
                    false
                } else {
                    true
                }
            });
        }
        let now = now_ms();
        inner
            .results
            .retain(|record| now.saturating_sub(record.timestamp) < self.config.results_max_age_ms);

        self.kv.set(WAL_KEY, &serde_json::to_string(&inner.entries)?)?;
        self.kv.set(WAL_SEQ_KEY, &inner.sequence.to_string())?;
        self.kv
            .set(WAL_RESULTS_KEY, &serde_json::to_string(&inner.results)?)?;
        Ok(())
    }

    /// Block (bounded) while a replay is in flight. A replay never blocks
    /// an enqueue indefinitely; on timeout the enqueue proceeds.
    fn wait_for_replay(&self) {
        if !self.is_replaying.load(Ordering::Acquire) {
            return;
        }
        let deadline = Instant::now() + Duration::from_millis(REPLAY_WAIT_MS);
        let mut guard = self.replay_wait.lock();
        while self.is_replaying.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || self.replay_cond.wait_for(&mut guard, remaining).timed_out()
            {
                warn!(waited_ms = REPLAY_WAIT_MS, "replay wait window elapsed; enqueue proceeding");
                break;
            }
        }
    }

    /// Queue a write.
    ///
    /// When the precondition holds the operation runs directly and the
    /// returned handle is already settled. Otherwise the entry is
    /// persisted, processing is scheduled, and the handle settles when the
    /// entry commits or exhausts its retries.
    pub fn queue_write(
        &self,
        operation: &str,
        args: Vec<Value>,
        priority: WalPriority,
    ) -> StowageResult<QueuedWrite> {
        self.wait_for_replay();

        if self.precondition.is_met() {
            let entry_id = uuid::Uuid::new_v4().to_string();
            let outcome = self
                .registry
                .resolve(operation, false)
                .and_then(|handler| handler(&args));
            return Ok(QueuedWrite {
                entry_id: entry_id.clone(),
                handle: EntryHandle::settled(entry_id, outcome),
                deferred: false,
            });
        }

        let mut inner = self.inner.lock();
        inner.sequence += 1;
        let entry = WalEntry::new(inner.sequence, operation, args, priority);
        let entry_id = entry.id.clone();
        let (handle, waiter) = EntryHandle::new(entry_id.clone());
        inner.entries.push(entry);
        self.persist(&mut inner)?;
        drop(inner);

        self.waiters.lock().insert(entry_id.clone(), waiter);
        debug!(entry_id = %entry_id, operation, "write deferred into WAL");
        self.schedule_processing(Duration::ZERO);

        Ok(QueuedWrite {
            entry_id,
            handle,
            deferred: true,
        })
    }

    /// Drain pending and retryable entries.
    ///
    /// Only the write-authoritative tab processes, and never concurrently
    /// with itself or a replay. Returns the number of entries settled.
    pub fn process_wal(&self) -> StowageResult<usize> {
        if !self.coordinator.is_write_allowed() {
            return Ok(0);
        }
        if self.is_replaying.load(Ordering::Acquire) {
            return Ok(0);
        }
        if self.is_processing.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        let result = self.drain();
        self.is_processing.store(false, Ordering::Release);

        // Reschedule while deferred work remains behind a closed gate.
        if self.pending_count() > 0 && !self.precondition.is_met() {
            self.schedule_processing(self.heartbeat);
        }
        result
    }

    fn drain(&self) -> StowageResult<usize> {
        let mut settled = 0usize;
        loop {
            let batch: Vec<String> = {
                let inner = self.inner.lock();
                let mut due: Vec<&WalEntry> = inner
                    .entries
                    .iter()
                    .filter(|entry| entry.needs_drain(self.config.max_attempts))
                    .collect();
                due.sort_by_key(|entry| entry.drain_key());
                due.iter()
                    .take(self.config.batch_size)
                    .map(|entry| entry.id.clone())
                    .collect()
            };
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;
            for entry_id in batch {
                let (operation, args) = {
                    let mut inner = self.inner.lock();
                    let entry = match inner.entries.iter_mut().find(|entry| entry.id == entry_id) {
                        Some(entry) => entry,
                        None => continue,
                    };
                    entry.status = WalStatus::Processing;
                    entry.attempts += 1;
                    entry.processed_at = Some(now_ms());
                    (entry.operation.clone(), entry.args.clone())
                };

                if !self.precondition.is_met() {
                    let mut inner = self.inner.lock();
                    if let Some(entry) =
                        inner.entries.iter_mut().find(|entry| entry.id == entry_id)
                    {
                        entry.status = WalStatus::Failed;
                        entry.error = Some(DEFERRED_ERROR.to_string());
                    }
                    continue;
                }

                // Persisted entries always apply through the replay
                // adapter, so a duplicate-rejecting primitive cannot fail
                // on its own earlier effect.
                let outcome = self
                    .registry
                    .resolve(&operation, true)
                    .and_then(|handler| handler(&args));

                match outcome {
                    Ok(value) => {
                        let mut inner = self.inner.lock();
                        if let Some(entry) =
                            inner.entries.iter_mut().find(|entry| entry.id == entry_id)
                        {
                            entry.status = WalStatus::Committed;
                            entry.error = None;
                        } else {
                            continue;
                        }
                        settled += 1;
                        progressed = true;
                        inner
                            .results
                            .push(WalResultRecord::success(&entry_id, value.clone()));
                        drop(inner);
                        if let Some(waiter) = self.waiters.lock().remove(&entry_id) {
                            waiter.settle(Ok(value));
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        let mut inner = self.inner.lock();
                        let terminal = match inner
                            .entries
                            .iter_mut()
                            .find(|entry| entry.id == entry_id)
                        {
                            Some(entry) => {
                                entry.status = WalStatus::Failed;
                                entry.error = Some(message.clone());
                                entry.attempts >= self.config.max_attempts
                            }
                            None => continue,
                        };
                        if terminal {
                            warn!(entry_id = %entry_id, error = %message, "WAL entry terminally failed");
                            settled += 1;
                            progressed = true;
                            inner
                                .results
                                .push(WalResultRecord::failure(&entry_id, &message));
                        }
                        drop(inner);
                        if terminal {
                            if let Some(waiter) = self.waiters.lock().remove(&entry_id) {
                                waiter.settle(Err(message));
                            }
                        }
                    }
                }
            }

            {
                let mut inner = self.inner.lock();
                self.persist(&mut inner)?;
            }
            if !progressed {
                break;
            }
        }

        let mut inner = self.inner.lock();
        self.cleanup_wal(&mut inner);
        self.persist(&mut inner)?;
        Ok(settled)
    }

    /// Drop committed entries past their retention window.
    fn cleanup_wal(&self, inner: &mut WalInner) {
        let now = now_ms();
        inner.entries.retain(|entry| {
            !(entry.status == WalStatus::Committed
                && entry
                    .processed_at
                    .map(|at| now.saturating_sub(at) >= COMMITTED_RETENTION_MS)
                    .unwrap_or(false))
        });
    }

    /// Replay persisted state on open.
    ///
    /// Primary tab only, throttled, and exclusive with itself. Reloads
    /// from the surface, resets crashed `processing` entries to pending,
    /// drains what needs draining, and always publishes
    /// `wal:replay_complete`.
    pub fn replay_wal(&self) -> StowageResult<usize> {
        if !self.coordinator.is_primary() {
            return Ok(0);
        }
        {
            let last = self.last_replay.lock();
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_millis(self.config.replay_delay_ms) {
                    return Ok(0);
                }
            }
        }
        if self.is_replaying.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        let result = self.replay_locked();

        *self.last_replay.lock() = Some(Instant::now());
        self.is_replaying.store(false, Ordering::Release);
        self.replay_cond.notify_all();
        let entries_replayed = *result.as_ref().unwrap_or(&0);
        self.bus.emit(
            Topic::WalReplayComplete,
            serde_json::json!({
                "timestamp": now_ms(),
                "entriesReplayed": entries_replayed,
            }),
        );
        result
    }

    fn replay_locked(&self) -> StowageResult<usize> {
        let now = now_ms();
        let needs_drain = {
            let mut inner = self.inner.lock();
            *inner = Self::load_state(&self.kv, &self.config);
            for entry in inner.entries.iter_mut() {
                if entry.status == WalStatus::Processing {
                    let crashed = entry
                        .processed_at
                        .map(|at| now.saturating_sub(at) >= CRASHED_PROCESSING_MS)
                        .unwrap_or(true);
                    if crashed {
                        info!(entry_id = %entry.id, "resetting crashed WAL entry to pending");
                        entry.status = WalStatus::Pending;
                        entry.error = None;
                    }
                }
            }
            inner
                .entries
                .iter()
                .any(|entry| entry.needs_drain(self.config.max_attempts))
        };

        if needs_drain {
            self.drain()
        } else {
            Ok(0)
        }
    }

    /// Look up a persisted result by entry id.
    pub fn get_result(&self, entry_id: &str) -> Option<WalResultRecord> {
        let inner = self.inner.lock();
        let now = now_ms();
        inner
            .results
            .iter()
            .filter(|record| now.saturating_sub(record.timestamp) < self.config.results_max_age_ms)
            .find(|record| record.entry_id == entry_id)
            .cloned()
    }

    /// Entries still needing a drain.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.needs_drain(self.config.max_attempts))
            .count()
    }

    /// Snapshot of one entry, for inspection.
    pub fn entry(&self, entry_id: &str) -> Option<WalEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|entry| entry.id == entry_id)
            .cloned()
    }

    /// Snapshot of all entries in insertion order.
    pub fn entries(&self) -> Vec<WalEntry> {
        self.inner.lock().entries.clone()
    }

    /// Whether a replay is in flight.
    pub fn is_replaying(&self) -> bool {
        self.is_replaying.load(Ordering::Acquire)
    }

    /// Schedule a processing pass no later than `delay` from now.
    pub fn schedule_processing(&self, delay: Duration) {
        let due = Instant::now() + delay;
        let mut scheduled = self.scheduled_at.lock();
        match *scheduled {
            Some(existing) if existing <= due => {}
            _ => *scheduled = Some(due),
        }
    }

    /// When the next scheduled processing pass is due.
    pub fn next_due(&self) -> Option<Instant> {
        *self.scheduled_at.lock()
    }

    /// Run a scheduled processing pass if one is due. Returns how many
    /// entries settled.
    pub fn run_due(&self) -> StowageResult<usize> {
        let due = {
            let mut scheduled = self.scheduled_at.lock();
            match *scheduled {
                Some(at) if at <= Instant::now() => {
                    *scheduled = None;
                    true
                }
                _ => false,
            }
        };
        if due {
            self.process_wal()
        } else {
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::TogglePrecondition;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use stowage_core::SharedCoordinator;

    /// Toy store the registered operations write into.
    type ToyStore = Arc<PlMutex<BTreeMap<String, Value>>>;

    struct Fixture {
        wal: Arc<WriteAheadLog>,
        gate: Arc<TogglePrecondition>,
        coordinator: Arc<SharedCoordinator>,
        store: ToyStore,
        kv: Arc<KvSurface>,
        applied: Arc<PlMutex<Vec<String>>>,
    }

    fn fixture(gate_open: bool, primary: bool) -> Fixture {
        fixture_on(Arc::new(KvSurface::memory()), gate_open, primary)
    }

    fn fixture_on(kv: Arc<KvSurface>, gate_open: bool, primary: bool) -> Fixture {
        let gate = Arc::new(TogglePrecondition::new(gate_open));
        let coordinator = SharedCoordinator::new(primary);
        let wal = WriteAheadLog::new(
            Arc::clone(&kv),
            WalConfig::default(),
            EventBus::new(),
            coordinator.clone() as Arc<dyn TabCoordinator>,
            Arc::clone(&gate) as Arc<dyn Precondition>,
        );
        let store: ToyStore = Arc::new(PlMutex::new(BTreeMap::new()));
        let applied = Arc::new(PlMutex::new(Vec::new()));

        let store_put = Arc::clone(&store);
        let applied_put = Arc::clone(&applied);
        wal.register_operation(
            "put",
            true,
            false,
            Arc::new(move |args| {
                let key = args[0].as_str().unwrap_or_default().to_string();
                store_put.lock().insert(key.clone(), args[1].clone());
                applied_put.lock().push(key.clone());
                Ok(json!(key))
            }),
        )
        .unwrap();

        let store_add = Arc::clone(&store);
        wal.register_operation(
            "add",
            false,
            false,
            Arc::new(move |args| {
                let key = args[0].as_str().unwrap_or_default().to_string();
                let mut store = store_add.lock();
                if store.contains_key(&key) {
                    return Err(stowage_core::StowageError::ConstraintViolation {
                        store: "toy".to_string(),
                        key,
                    });
                }
                store.insert(key.clone(), args[1].clone());
                Ok(json!(key))
            }),
        )
        .unwrap();

        wal.register_operation(
            "alwaysFails",
            true,
            false,
            Arc::new(|_args| Err(stowage_core::StowageError::Storage("boom".to_string()))),
        )
        .unwrap();

        Fixture {
            wal,
            gate,
            coordinator,
            store,
            kv,
            applied,
        }
    }

    #[test]
    fn test_direct_run_when_gate_open() {
        let f = fixture(true, true);
        let queued = f
            .wal
            .queue_write("put", vec![json!("a"), json!({"n": 1})], WalPriority::Normal)
            .unwrap();
        assert!(!queued.deferred);
        assert!(queued.handle.is_settled());
        assert_eq!(f.store.lock().get("a").unwrap()["n"], json!(1));
        assert_eq!(f.wal.pending_count(), 0);
    }

    #[test]
    fn test_deferred_then_drained_in_priority_order() {
        let f = fixture(false, true);
        let normal = f
            .wal
            .queue_write("put", vec![json!("n"), json!(1)], WalPriority::Normal)
            .unwrap();
        let critical = f
            .wal
            .queue_write("put", vec![json!("c"), json!(2)], WalPriority::Critical)
            .unwrap();
        let high = f
            .wal
            .queue_write("put", vec![json!("h"), json!(3)], WalPriority::High)
            .unwrap();
        assert!(normal.deferred && critical.deferred && high.deferred);
        assert_eq!(f.wal.pending_count(), 3);

        f.gate.set(true);
        let settled = f.wal.process_wal().unwrap();
        assert_eq!(settled, 3);
        assert_eq!(*f.applied.lock(), vec!["c", "h", "n"]);

        // All three results retrievable by entry id
        for queued in [&normal, &critical, &high] {
            let record = f.wal.get_result(&queued.entry_id).unwrap();
            assert!(record.result.success);
        }
    }

    #[test]
    fn test_gate_closed_defers_and_reschedules() {
        let f = fixture(false, true);
        f.wal
            .queue_write("put", vec![json!("a"), json!(1)], WalPriority::Normal)
            .unwrap();
        let settled = f.wal.process_wal().unwrap();
        assert_eq!(settled, 0);
        assert_eq!(f.wal.pending_count(), 1);
        assert!(f.wal.next_due().is_some());
        let entry = f.wal.entries()[0].clone();
        assert_eq!(entry.status, WalStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some(DEFERRED_ERROR));
    }

    #[test]
    fn test_non_primary_does_not_process() {
        let f = fixture(false, false);
        f.wal
            .queue_write("put", vec![json!("a"), json!(1)], WalPriority::Normal)
            .unwrap();
        f.gate.set(true);
        assert_eq!(f.wal.process_wal().unwrap(), 0);
        assert_eq!(f.wal.pending_count(), 1);
    }

    #[test]
    fn test_authority_gain_schedules_processing() {
        let f = fixture(false, false);
        f.wal
            .queue_write("put", vec![json!("a"), json!(1)], WalPriority::Normal)
            .unwrap();
        assert!(f.wal.next_due().is_none() || f.wal.process_wal().unwrap() == 0);
        f.gate.set(true);
        f.coordinator.set_primary(true);
        assert!(f.wal.next_due().is_some());
        assert_eq!(f.wal.run_due().unwrap(), 1);
    }

    #[test]
    fn test_terminal_failure_after_max_attempts() {
        let f = fixture(false, true);
        let queued = f
            .wal
            .queue_write("alwaysFails", vec![], WalPriority::Normal)
            .unwrap();
        f.gate.set(true);
        // Each pass retries the failed entry once.
        f.wal.process_wal().unwrap();
        f.wal.process_wal().unwrap();
        f.wal.process_wal().unwrap();

        let entry = f.wal.entry(&queued.entry_id).unwrap();
        assert_eq!(entry.status, WalStatus::Failed);
        assert_eq!(entry.attempts, 3);
        assert!(entry.is_terminal_failure(3));

        let record = f.wal.get_result(&queued.entry_id).unwrap();
        assert!(!record.result.success);
        assert!(queued.handle.wait(Duration::from_millis(10)).is_err());
        // Terminal entries are no longer drained
        assert_eq!(f.wal.process_wal().unwrap(), 0);
    }

    #[test]
    fn test_crash_recovery_replay() {
        let kv = Arc::new(KvSurface::memory());
        // First life: defer three writes, drain one, crash with one
        // processing and one pending.
        {
            let f = fixture_on(Arc::clone(&kv), false, true);
            f.wal
                .queue_write("put", vec![json!("done"), json!(1)], WalPriority::Critical)
                .unwrap();
            f.wal
                .queue_write("put", vec![json!("stuck"), json!(2)], WalPriority::Normal)
                .unwrap();
            f.wal
                .queue_write("put", vec![json!("waiting"), json!(3)], WalPriority::Normal)
                .unwrap();

            // Hand-shape the persisted state: one committed, one crashed
            // mid-processing (old), one pending.
            let mut entries = f.wal.entries();
            entries[0].status = WalStatus::Committed;
            entries[0].processed_at = Some(now_ms());
            entries[1].status = WalStatus::Processing;
            entries[1].processed_at = Some(now_ms() - 120_000);
            kv.set(WAL_KEY, &serde_json::to_string(&entries).unwrap()).unwrap();
        }

        // Second life: replay.
        let f = fixture_on(Arc::clone(&kv), true, true);
        let replayed = f.wal.replay_wal().unwrap();
        assert_eq!(replayed, 2);
        let store = f.store.lock();
        assert!(store.contains_key("stuck"));
        assert!(store.contains_key("waiting"));
        // The committed entry was not re-applied
        assert!(!store.contains_key("done"));
    }

    #[test]
    fn test_replay_emits_complete_event() {
        let kv = Arc::new(KvSurface::memory());
        let gate = Arc::new(TogglePrecondition::new(true));
        let coordinator = SharedCoordinator::new(true);
        let bus = EventBus::new();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = bus.on(Topic::WalReplayComplete, move |payload| {
            seen_clone.lock().push(payload.clone());
        });
        let wal = WriteAheadLog::new(
            kv,
            WalConfig::default(),
            bus,
            coordinator as Arc<dyn TabCoordinator>,
            gate as Arc<dyn Precondition>,
        );
        wal.replay_wal().unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["entriesReplayed"], json!(0));
        assert!(seen[0]["timestamp"].is_u64());
    }

    #[test]
    fn test_replay_throttled() {
        let f = fixture(true, true);
        f.wal.replay_wal().unwrap();
        // Immediately replaying again is throttled to a no-op.
        assert_eq!(f.wal.replay_wal().unwrap(), 0);
    }

    #[test]
    fn test_replay_only_on_primary() {
        let f = fixture(true, false);
        assert_eq!(f.wal.replay_wal().unwrap(), 0);
    }

    #[test]
    fn test_add_replayed_idempotently() {
        let kv = Arc::new(KvSurface::memory());
        let f = fixture_on(Arc::clone(&kv), false, true);
        f.wal
            .queue_write("add", vec![json!("a"), json!(1)], WalPriority::Normal)
            .unwrap();
        // The record already exists, as if the add committed right before
        // a crash that lost the status update.
        f.store.lock().insert("a".to_string(), json!(1));

        f.gate.set(true);
        let settled = f.wal.process_wal().unwrap();
        assert_eq!(settled, 1);
        assert_eq!(f.store.lock().get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_entry_cap_trims_oldest() {
        let f = fixture(false, true);
        for i in 0..110 {
            f.wal
                .queue_write("put", vec![json!(format!("k{i}")), json!(i)], WalPriority::Normal)
                .unwrap();
        }
        let entries = f.wal.entries();
        assert_eq!(entries.len(), 100);
        // Oldest were trimmed; the newest survives
        assert!(entries.iter().any(|entry| entry.args[0] == json!("k109")));
        assert!(!entries.iter().any(|entry| entry.args[0] == json!("k0")));
    }

    #[test]
    fn test_stale_entries_dropped_at_load() {
        let kv = Arc::new(KvSurface::memory());
        let mut old_entry = WalEntry::new(1, "put", vec![json!("old"), json!(1)], WalPriority::Normal);
        old_entry.created_at = now_ms() - 86_400_000; // exactly max age
        let fresh_entry = WalEntry::new(2, "put", vec![json!("new"), json!(2)], WalPriority::Normal);
        kv.set(
            WAL_KEY,
            &serde_json::to_string(&vec![old_entry, fresh_entry]).unwrap(),
        )
        .unwrap();
        kv.set(WAL_SEQ_KEY, "2").unwrap();

        let f = fixture_on(kv, false, true);
        let entries = f.wal.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].args[0], json!("new"));
    }

    #[test]
    fn test_sequence_survives_reload() {
        let kv = Arc::new(KvSurface::memory());
        {
            let f = fixture_on(Arc::clone(&kv), false, true);
            f.wal
                .queue_write("put", vec![json!("a"), json!(1)], WalPriority::Normal)
                .unwrap();
        }
        let f = fixture_on(kv, false, true);
        let queued = f
            .wal
            .queue_write("put", vec![json!("b"), json!(2)], WalPriority::Normal)
            .unwrap();
        assert_eq!(f.wal.entry(&queued.entry_id).unwrap().sequence, 2);
    }

    #[test]
    fn test_handle_settles_on_drain() {
        let f = fixture(false, true);
        let queued = f
            .wal
            .queue_write("put", vec![json!("a"), json!(41)], WalPriority::Normal)
            .unwrap();
        f.gate.set(true);
        f.wal.process_wal().unwrap();
        assert_eq!(
            queued.handle.wait(Duration::from_millis(10)).unwrap(),
            json!("a")
        );
    }
}
