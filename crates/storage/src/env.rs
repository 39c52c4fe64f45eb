//! Primary backend environment
//!
//! The object-store backend is modeled as a process-wide environment:
//! databases are shared across every handle opened on them, so separate
//! handles behave like separate tabs on one origin. Opening at a higher
//! version runs an upgrade; holders of older handles are notified and must
//! close, otherwise the upgrade is blocked. A fault injector on the
//! environment drives unavailability, latency, forced aborts, and the
//! live-index-add capability in tests.

use crate::store::{IndexDef, Store};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{StowageError, StowageResult};
use tracing::{debug, info, warn};

/// Database name used by availability probes.
pub const PROBE_DATABASE: &str = "stowage_probe_db";

/// How long an availability probe waits before declaring the backend down.
pub const PROBE_WATCHDOG: Duration = Duration::from_secs(1);

static GLOBAL: Lazy<Arc<Environment>> = Lazy::new(|| Arc::new(Environment::new()));

/// Fault switches used by tests and the availability probe.
#[derive(Default)]
pub struct FaultInjector {
    unavailable: AtomicBool,
    request_latency_ms: AtomicU64,
    abort_writes: AtomicBool,
    deny_live_index_add: AtomicBool,
    test_env: AtomicBool,
}

impl FaultInjector {
    /// Make every open and probe fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Whether the backend currently refuses opens.
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    /// Impose a fixed latency on every request.
    pub fn set_request_latency(&self, latency: Duration) {
        self.request_latency_ms
            .store(latency.as_millis() as u64, Ordering::Release);
    }

    /// Force every read-write commit to abort.
    pub fn set_abort_writes(&self, abort: bool) {
        self.abort_writes.store(abort, Ordering::Release);
    }

    /// Whether commits are being forced to abort.
    pub fn aborts_writes(&self) -> bool {
        self.abort_writes.load(Ordering::Acquire)
    }

    /// Deny adding an index to an existing store during upgrades.
    pub fn set_deny_live_index_add(&self, deny: bool) {
        self.deny_live_index_add.store(deny, Ordering::Release);
    }

    /// Whether live index adds are denied.
    pub fn denies_live_index_add(&self) -> bool {
        self.deny_live_index_add.load(Ordering::Acquire)
    }

    /// Mark the environment as a known test environment, enabling the
    /// store-recreation migration fallback.
    pub fn set_test_env(&self, test_env: bool) {
        self.test_env.store(test_env, Ordering::Release);
    }

    /// Whether the store-recreation fallback is permitted.
    pub fn is_test_env(&self) -> bool {
        self.test_env.load(Ordering::Acquire)
    }

    pub(crate) fn apply_latency(&self) {
        let latency_ms = self.request_latency_ms.load(Ordering::Acquire);
        if latency_ms > 0 {
            std::thread::sleep(Duration::from_millis(latency_ms));
        }
    }
}

/// Serializes read-write transactions for one database.
#[derive(Default)]
pub(crate) struct WriteGate {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl WriteGate {
    pub(crate) fn acquire(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cond.wait(&mut locked);
        }
        *locked = true;
    }

    pub(crate) fn release(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.cond.notify_one();
    }
}

/// Callback invoked on a handle when a later open requests a higher
/// version; the holder is expected to close its handle.
pub type VersionChangeCallback = Arc<dyn Fn() + Send + Sync>;

struct HandleEntry {
    id: u64,
    on_version_change: Option<VersionChangeCallback>,
}

pub(crate) struct DbState {
    pub(crate) version: u32,
    pub(crate) stores: BTreeMap<String, Store>,
    handles: Vec<HandleEntry>,
}

/// One shared database: version, stores, and the registry of open handles.
pub struct SharedDatabase {
    name: String,
    pub(crate) state: Mutex<DbState>,
    pub(crate) write_gate: WriteGate,
    next_handle_id: AtomicU64,
}

impl SharedDatabase {
    fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(DbState {
                version: 0,
                stores: BTreeMap::new(),
                handles: Vec::new(),
            }),
            write_gate: WriteGate::default(),
            next_handle_id: AtomicU64::new(1),
        }
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Upgrade transaction handed to migration steps.
///
/// Lives for the duration of one `open` that raised the version; any error
/// aborts the whole upgrade and restores the pre-upgrade state.
pub struct UpgradeTxn<'a> {
    state: &'a mut DbState,
    faults: &'a FaultInjector,
    old_version: u32,
    new_version: u32,
    created: std::collections::HashSet<String>,
}

impl UpgradeTxn<'_> {
    /// Version the database had before this upgrade.
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    /// Version the upgrade is moving to.
    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    /// Whether a store exists.
    pub fn has_store(&self, name: &str) -> bool {
        self.state.stores.contains_key(name)
    }

    /// Create a store. Creating an existing store is an error.
    pub fn create_store(&mut self, name: &str, key_field: &str) -> StowageResult<()> {
        if self.state.stores.contains_key(name) {
            return Err(StowageError::Storage(format!(
                "store '{name}' already exists"
            )));
        }
        self.state.stores.insert(name.to_string(), Store::new(key_field));
        self.created.insert(name.to_string());
        Ok(())
    }

    /// Delete a store and its records.
    pub fn delete_store(&mut self, name: &str) -> StowageResult<()> {
        self.state
            .stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StowageError::UnknownStore(name.to_string()))
    }

    /// Add an index to a store.
    ///
    /// Indexes on stores created within this upgrade always work. Adding
    /// one to a pre-existing store fails when the backend denies live
    /// index adds; migration code handles that with the store-recreation
    /// fallback in test environments.
    pub fn add_index(&mut self, store_name: &str, index: IndexDef) -> StowageResult<()> {
        if self.faults.denies_live_index_add() && !self.created.contains(store_name) {
            return Err(StowageError::Storage(format!(
                "backend denies adding index '{}' to existing store '{store_name}'",
                index.name
            )));
        }
        let store = self
            .state
            .stores
            .get_mut(store_name)
            .ok_or_else(|| StowageError::UnknownStore(store_name.to_string()))?;
        store.add_index(index);
        Ok(())
    }

    /// Records of a store (used when recreating a store during migration).
    pub fn store_records(&self, store_name: &str) -> StowageResult<Vec<serde_json::Value>> {
        self.state
            .stores
            .get(store_name)
            .map(Store::get_all)
            .ok_or_else(|| StowageError::UnknownStore(store_name.to_string()))
    }

    /// Insert records into a store, bypassing authority (upgrade context).
    pub fn restore_records(
        &mut self,
        store_name: &str,
        records: Vec<serde_json::Value>,
    ) -> StowageResult<()> {
        let store = self
            .state
            .stores
            .get_mut(store_name)
            .ok_or_else(|| StowageError::UnknownStore(store_name.to_string()))?;
        for record in records {
            let key = store.key_of(store_name, &record)?;
            store.put(store_name, key, record)?;
        }
        Ok(())
    }

    /// Whether the store-recreation fallback may be used.
    pub fn allows_store_recreation(&self) -> bool {
        self.faults.is_test_env()
    }
}

/// Process-wide registry of shared databases.
pub struct Environment {
    databases: Mutex<HashMap<String, Arc<SharedDatabase>>>,
    faults: FaultInjector,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Create an isolated environment (tests embed their own).
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            faults: FaultInjector::default(),
        }
    }

    /// The process-wide shared environment.
    pub fn global() -> Arc<Environment> {
        Arc::clone(&GLOBAL)
    }

    /// Fault switches for this environment.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    fn database(&self, name: &str) -> Arc<SharedDatabase> {
        let mut databases = self.databases.lock();
        Arc::clone(
            databases
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(SharedDatabase::new(name.to_string()))),
        )
    }

    /// Open a handle at `version`, running `upgrade` if the stored version
    /// is lower.
    ///
    /// `on_version_change` fires when a later open wants a higher version;
    /// the holder is expected to close. An upgrade with surviving older
    /// handles fails with `VersionBlocked`.
    pub fn open(
        self: &Arc<Self>,
        name: &str,
        version: u32,
        upgrade: impl FnOnce(&mut UpgradeTxn<'_>) -> StowageResult<()>,
        on_version_change: Option<VersionChangeCallback>,
    ) -> StowageResult<DbHandle> {
        if self.faults.is_unavailable() {
            return Err(StowageError::Unavailable(format!(
                "backend rejected open of '{name}'"
            )));
        }
        self.faults.apply_latency();

        let db = self.database(name);
        let mut state = db.state.lock();

        if version < state.version {
            return Err(StowageError::Storage(format!(
                "requested version {version} below stored version {}",
                state.version
            )));
        }

        if version > state.version {
            if !state.handles.is_empty() {
                // Ask the holders to close, outside the state lock.
                let callbacks: Vec<VersionChangeCallback> = state
                    .handles
                    .iter()
                    .filter_map(|handle| handle.on_version_change.clone())
                    .collect();
                drop(state);
                for callback in callbacks {
                    callback();
                }
                state = db.state.lock();
                if !state.handles.is_empty() {
                    warn!(db = name, requested = version, "upgrade blocked by open handles");
                    return Err(StowageError::VersionBlocked { requested: version });
                }
            }

            let snapshot_version = state.version;
            let snapshot_stores = state.stores.clone();
            let old_version = state.version;
            let mut txn = UpgradeTxn {
                state: &mut state,
                faults: &self.faults,
                old_version,
                new_version: version,
                created: std::collections::HashSet::new(),
            };
            match upgrade(&mut txn) {
                Ok(()) => {
                    state.version = version;
                    info!(db = name, from = old_version, to = version, "upgrade applied");
                }
                Err(e) => {
                    state.version = snapshot_version;
                    state.stores = snapshot_stores;
                    return Err(e);
                }
            }
        }

        let id = db.next_handle_id.fetch_add(1, Ordering::Relaxed);
        state.handles.push(HandleEntry {
            id,
            on_version_change,
        });
        debug!(db = name, handle = id, version = state.version, "handle opened");
        drop(state);

        Ok(DbHandle {
            db,
            env: Arc::clone(self),
            id,
            open: AtomicBool::new(true),
        })
    }

    /// Delete a database. Fails while handles are open on it.
    pub fn delete_database(&self, name: &str) -> StowageResult<()> {
        if self.faults.is_unavailable() {
            return Err(StowageError::Unavailable(format!(
                "backend rejected delete of '{name}'"
            )));
        }
        let mut databases = self.databases.lock();
        if let Some(db) = databases.get(name) {
            if !db.state.lock().handles.is_empty() {
                return Err(StowageError::Storage(format!(
                    "database '{name}' is in use"
                )));
            }
            databases.remove(name);
        }
        Ok(())
    }

    /// Probe availability: open and delete the probe database under a
    /// watchdog. Latency past the watchdog counts as unavailable.
    pub fn probe_available(self: &Arc<Self>) -> bool {
        let env = Arc::clone(self);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = env
                .open(PROBE_DATABASE, 1, |_| Ok(()), None)
                .map(|handle| handle.close())
                .and_then(|_| env.delete_database(PROBE_DATABASE));
            let _ = sender.send(result.is_ok());
        });
        matches!(receiver.recv_timeout(PROBE_WATCHDOG), Ok(true))
    }
}

/// An open handle onto a shared database.
pub struct DbHandle {
    pub(crate) db: Arc<SharedDatabase>,
    pub(crate) env: Arc<Environment>,
    id: u64,
    open: AtomicBool,
}

impl DbHandle {
    /// Whether the handle is still open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the handle. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let mut state = self.db.state.lock();
            state.handles.retain(|handle| handle.id != self.id);
            debug!(db = self.db.name(), handle = self.id, "handle closed");
        }
    }

    /// Stored schema version.
    pub fn version(&self) -> u32 {
        self.db.state.lock().version
    }

    /// Whether a store exists.
    pub fn has_store(&self, name: &str) -> bool {
        self.db.state.lock().stores.contains_key(name)
    }

    /// Names of all stores.
    pub fn store_names(&self) -> Vec<String> {
        self.db.state.lock().stores.keys().cloned().collect()
    }

    fn ensure_open(&self) -> StowageResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StowageError::TransactionAborted(
                "handle is closed".to_string(),
            ))
        }
    }

    /// Begin a transaction.
    pub fn begin(&self, mode: crate::txn::TxnMode) -> StowageResult<crate::txn::Transaction> {
        self.ensure_open()?;
        Ok(crate::txn::Transaction::begin(
            Arc::clone(&self.db),
            Arc::clone(&self.env),
            mode,
        ))
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        self.close();
    }
}
