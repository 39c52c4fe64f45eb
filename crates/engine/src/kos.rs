//! Keyed object store
//!
//! The primitive surface over whichever backend the connection landed on:
//! the primary object-store environment, or the fallback key/value surface
//! when the primary is unavailable. Backend choice is a tagged enum; every
//! primitive dispatches on it.
//!
//! Writes are authority-checked against the tab coordinator and stamped
//! with the writer's vector-clock epoch. Every primary-backend request is
//! wrapped in a cancellable deadline; expiry aborts the owning transaction
//! and surfaces a timeout, exactly once.

use crate::connection::OpenOptions;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use stowage_concurrency::{AuthorityPolicy, VectorClock};
use stowage_core::{
    deep_clone, extract_key, stamp_record, store_spec, EventBus, StowageConfig, StowageError,
    StowageResult, TimerToken, Topic,
};
use stowage_storage::{
    DbHandle, Direction, Environment, FallbackBackend, Transaction, TxnMode,
};
use tracing::{debug, warn};

/// Options for a single `put`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Skip the write-authority check (replay and recovery paths)
    pub bypass_authority: bool,
    /// Do not stamp `writeEpoch` / `writerId`
    pub skip_write_epoch: bool,
}

/// The backend a connection landed on.
pub enum Backend {
    /// Primary object-store environment
    Primary(Arc<DbHandle>),
    /// Fallback key/value surface
    Fallback(Arc<FallbackBackend>),
}

/// The keyed object store.
pub struct ObjectStore {
    backend: Backend,
    env: Arc<Environment>,
    config: StowageConfig,
    bus: EventBus,
    authority: AuthorityPolicy,
    clock: Mutex<VectorClock>,
    writer_id: String,
}

impl ObjectStore {
    pub(crate) fn assemble(backend: Backend, options: &OpenOptions) -> Self {
        Self {
            backend,
            env: Arc::clone(&options.env),
            config: options.config.clone(),
            bus: options.bus.clone(),
            authority: AuthorityPolicy::new(
                options.config.authority.clone(),
                Arc::clone(&options.coordinator),
            ),
            clock: Mutex::new(VectorClock::new(options.writer_id.clone())),
            writer_id: options.writer_id.clone(),
        }
    }

    /// Whether the store is running on the fallback backend.
    pub fn is_fallback(&self) -> bool {
        matches!(self.backend, Backend::Fallback(_))
    }

    /// The fallback backend, when active.
    pub fn fallback(&self) -> Option<&Arc<FallbackBackend>> {
        match &self.backend {
            Backend::Fallback(fb) => Some(fb),
            Backend::Primary(_) => None,
        }
    }

    /// The stable writer id stamped onto records.
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// The environment this store opened against.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// Whether the underlying primary handle is still open. Fallback
    /// stores are always considered connected.
    pub fn is_connected(&self) -> bool {
        match &self.backend {
            Backend::Primary(handle) => handle.is_open(),
            Backend::Fallback(_) => true,
        }
    }

    /// Close the connection.
    pub fn close(&self) {
        if let Backend::Primary(handle) = &self.backend {
            handle.close();
        }
    }

    fn key_field_of(store: &str) -> &'static str {
        store_spec(store).map(|spec| spec.key_field).unwrap_or("id")
    }

    fn token(&self) -> TimerToken {
        TimerToken::after_ms(self.config.request.timeout_ms)
    }

    fn timeout_error(&self, operation: &str) -> StowageError {
        let err = StowageError::Timeout {
            operation: operation.to_string(),
            timeout_ms: self.config.request.timeout_ms,
        };
        self.bus.emit(
            Topic::StorageError,
            serde_json::json!({"operation": operation, "error": err.to_string()}),
        );
        err
    }

    /// Settle a write transaction: the first terminal event wins. An
    /// expired deadline aborts; otherwise the transaction commits.
    fn finish_write<T>(
        &self,
        mut txn: Transaction,
        token: TimerToken,
        operation: &str,
        result: StowageResult<T>,
    ) -> StowageResult<T> {
        match result {
            Ok(value) => {
                if token.expired() {
                    txn.abort();
                    return Err(self.timeout_error(operation));
                }
                token.cancel();
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                token.cancel();
                txn.abort();
                Err(e)
            }
        }
    }

    fn finish_read<T>(
        &self,
        token: TimerToken,
        operation: &str,
        result: StowageResult<T>,
    ) -> StowageResult<T> {
        if token.expired() && result.is_ok() {
            return Err(self.timeout_error(operation));
        }
        token.cancel();
        result
    }

    /// Insert or replace a record; returns its key.
    ///
    /// Stamps `writeEpoch` and `writerId` unless `skip_write_epoch`;
    /// checked against write authority unless bypassed.
    pub fn put(&self, store: &str, mut record: Value, options: PutOptions) -> StowageResult<String> {
        if !self.authority.authorize(store, options.bypass_authority)? {
            // Authority denied outside strict mode: success with no effect.
            return extract_key(&record, Self::key_field_of(store)).ok_or_else(|| {
                StowageError::MissingKey {
                    store: store.to_string(),
                    key_field: Self::key_field_of(store).to_string(),
                }
            });
        }
        if !options.skip_write_epoch {
            let epoch = self.clock.lock().tick();
            stamp_record(&mut record, &epoch.to_json(), &self.writer_id);
        }
        match &self.backend {
            Backend::Primary(handle) => {
                let token = self.token();
                let mut txn = handle.begin(TxnMode::ReadWrite)?;
                let result = (|| {
                    let key = txn.key_of(store, &record)?;
                    txn.put(store, key.clone(), record)?;
                    Ok(key)
                })();
                self.finish_write(txn, token, "put", result)
            }
            Backend::Fallback(fb) => fb.put(store, record),
        }
    }

    /// Read a record by key.
    pub fn get(&self, store: &str, key: &str) -> StowageResult<Option<Value>> {
        match &self.backend {
            Backend::Primary(handle) => {
                let token = self.token();
                let txn = handle.begin(TxnMode::ReadOnly)?;
                let result = txn.get(store, key);
                self.finish_read(token, "get", result)
            }
            Backend::Fallback(fb) => Ok(fb.get(store, key)),
        }
    }

    /// Read every record in a store; order unspecified.
    pub fn get_all(&self, store: &str) -> StowageResult<Vec<Value>> {
        match &self.backend {
            Backend::Primary(handle) => {
                let token = self.token();
                let txn = handle.begin(TxnMode::ReadOnly)?;
                let result = txn.get_all(store);
                self.finish_read(token, "get_all", result)
            }
            Backend::Fallback(fb) => Ok(fb.get_all(store)),
        }
    }

    /// Delete a record. Authority-checked.
    pub fn delete(&self, store: &str, key: &str) -> StowageResult<()> {
        if !self.authority.authorize(store, false)? {
            return Ok(());
        }
        match &self.backend {
            Backend::Primary(handle) => {
                let token = self.token();
                let mut txn = handle.begin(TxnMode::ReadWrite)?;
                let result = txn.delete(store, key.to_string());
                self.finish_write(txn, token, "delete", result)
            }
            Backend::Fallback(fb) => fb.delete(store, key),
        }
    }

    /// Remove every record in a store. Authority-checked.
    pub fn clear(&self, store: &str) -> StowageResult<()> {
        if !self.authority.authorize(store, false)? {
            return Ok(());
        }
        match &self.backend {
            Backend::Primary(handle) => {
                let token = self.token();
                let mut txn = handle.begin(TxnMode::ReadWrite)?;
                let result = txn.clear(store);
                self.finish_write(txn, token, "clear", result)
            }
            Backend::Fallback(fb) => fb.clear(store),
        }
    }

    /// Count records in a store.
    pub fn count(&self, store: &str) -> StowageResult<usize> {
        match &self.backend {
            Backend::Primary(handle) => {
                let token = self.token();
                let txn = handle.begin(TxnMode::ReadOnly)?;
                let result = txn.count(store);
                self.finish_read(token, "count", result)
            }
            Backend::Fallback(fb) => Ok(fb.count(store)),
        }
    }

    /// Read records sorted by an index.
    ///
    /// The primary backend cursors over the declared index; the fallback
    /// sorts in memory by the same-named attribute, whitelisted.
    pub fn get_all_by_index(
        &self,
        store: &str,
        index: &str,
        direction: Direction,
    ) -> StowageResult<Vec<Value>> {
        match &self.backend {
            Backend::Primary(handle) => {
                let token = self.token();
                let txn = handle.begin(TxnMode::ReadOnly)?;
                let result = txn.iter_by_index(store, index, direction);
                self.finish_read(token, "get_all_by_index", result)
            }
            Backend::Fallback(fb) => fb.get_all_sorted(store, index, direction),
        }
    }

    /// Atomic read-modify-write on one key.
    ///
    /// The modifier receives a deep copy of the existing record (or
    /// `None`). A modifier error aborts the transaction and surfaces; the
    /// new value is stamped with a fresh epoch before it is written.
    pub fn atomic_update(
        &self,
        store: &str,
        key: &str,
        modifier: impl FnOnce(Option<Value>) -> StowageResult<Value>,
    ) -> StowageResult<Value> {
        if !self.authority.authorize(store, false)? {
            return Ok(self.get(store, key)?.unwrap_or(Value::Null));
        }
        match &self.backend {
            Backend::Primary(handle) => {
                let token = self.token();
                let mut txn = handle.begin(TxnMode::ReadWrite)?;
                let result = (|| {
                    let existing = txn.get(store, key)?;
                    let mut updated = modifier(existing.as_ref().map(deep_clone))?;
                    let epoch = self.clock.lock().tick();
                    stamp_record(&mut updated, &epoch.to_json(), &self.writer_id);
                    txn.put(store, key.to_string(), updated.clone())?;
                    Ok(updated)
                })();
                self.finish_write(txn, token, "atomic_update", result)
            }
            Backend::Fallback(fb) => {
                let _guard = fb.transaction_guard();
                let existing = fb.get(store, key);
                let mut updated = modifier(existing.as_ref().map(deep_clone))?;
                let epoch = self.clock.lock().tick();
                stamp_record(&mut updated, &epoch.to_json(), &self.writer_id);
                fb.put(store, updated.clone())?;
                Ok(updated)
            }
        }
    }

    /// Run several operations on one store atomically.
    ///
    /// On the primary backend this is a real transaction. On the fallback
    /// it is two-phase best-effort: the store is snapshotted, operations
    /// run directly, and an error rolls the snapshot back; a failing
    /// rollback surfaces `RollbackFailed` with both errors. Fallback
    /// transactions serialize globally.
    pub fn transaction(
        &self,
        store: &str,
        mode: TxnMode,
        operations: impl FnOnce(&mut StoreTxn<'_>) -> StowageResult<()>,
    ) -> StowageResult<()> {
        if mode == TxnMode::ReadWrite && !self.authority.authorize(store, false)? {
            return Ok(());
        }
        match &self.backend {
            Backend::Primary(handle) => {
                let mut txn = handle.begin(mode)?;
                let mut view = StoreTxn::Primary {
                    txn: &mut txn,
                    store,
                };
                match operations(&mut view) {
                    Ok(()) => txn.commit(),
                    Err(e) => {
                        txn.abort();
                        Err(e)
                    }
                }
            }
            Backend::Fallback(fb) => {
                let _guard = fb.transaction_guard();
                let snapshot = fb.get_all(store);
                let mut view = StoreTxn::Fallback {
                    backend: fb.as_ref(),
                    store,
                };
                match operations(&mut view) {
                    Ok(()) => Ok(()),
                    Err(original) => {
                        warn!(store, error = %original, "fallback transaction failed; rolling back");
                        match Self::rollback_fallback(fb, store, snapshot) {
                            Ok(()) => Err(original),
                            Err(rollback) => Err(StowageError::RollbackFailed {
                                original: original.to_string(),
                                rollback: rollback.to_string(),
                            }),
                        }
                    }
                }
            }
        }
    }

    fn rollback_fallback(
        fb: &Arc<FallbackBackend>,
        store: &str,
        snapshot: Vec<Value>,
    ) -> StowageResult<()> {
        fb.clear(store)?;
        for record in snapshot {
            fb.put(store, record)?;
        }
        debug!(store, "fallback transaction rolled back");
        Ok(())
    }
}

/// Store view handed to `transaction` callbacks.
pub enum StoreTxn<'a> {
    /// Real transaction on the primary backend
    Primary {
        /// The underlying transaction
        txn: &'a mut Transaction,
        /// The store the transaction targets
        store: &'a str,
    },
    /// Direct operations on the fallback, guarded by snapshot/rollback
    Fallback {
        /// The fallback backend
        backend: &'a FallbackBackend,
        /// The store the transaction targets
        store: &'a str,
    },
}

impl StoreTxn<'_> {
    /// Insert or replace a record; returns its key.
    pub fn put(&mut self, record: Value) -> StowageResult<String> {
        match self {
            StoreTxn::Primary { txn, store } => {
                let key = txn.key_of(store, &record)?;
                txn.put(store, key.clone(), record)?;
                Ok(key)
            }
            StoreTxn::Fallback { backend, store } => backend.put(store, record),
        }
    }

    /// Read a record.
    pub fn get(&self, key: &str) -> StowageResult<Option<Value>> {
        match self {
            StoreTxn::Primary { txn, store } => txn.get(store, key),
            StoreTxn::Fallback { backend, store } => Ok(backend.get(store, key)),
        }
    }

    /// Delete a record.
    pub fn delete(&mut self, key: &str) -> StowageResult<()> {
        match self {
            StoreTxn::Primary { txn, store } => txn.delete(store, key.to_string()),
            StoreTxn::Fallback { backend, store } => backend.delete(store, key),
        }
    }

    /// Remove every record.
    pub fn clear(&mut self) -> StowageResult<()> {
        match self {
            StoreTxn::Primary { txn, store } => txn.clear(store),
            StoreTxn::Fallback { backend, store } => backend.clear(store),
        }
    }

    /// Count records.
    pub fn count(&self) -> StowageResult<usize> {
        match self {
            StoreTxn::Primary { txn, store } => txn.count(store),
            StoreTxn::Fallback { backend, store } => Ok(backend.count(store)),
        }
    }
}
