//! Transactions over shared databases
//!
//! A read-write transaction holds its database's write gate for its whole
//! lifetime, so two read-modify-write cycles on the same store serialize
//! rather than losing updates. Writes are buffered and applied atomically
//! at commit; a failed validation or a forced abort applies nothing.
//!
//! Terminal events are idempotent: whichever of commit, abort, or drop
//! happens first settles the transaction, and later calls are no-ops or
//! report the settled state.

use crate::env::{Environment, SharedDatabase};
use crate::store::{Direction, Store};
use serde_json::Value;
use std::sync::Arc;
use stowage_core::{StowageError, StowageResult};
use tracing::debug;

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Reads only; never takes the write gate
    ReadOnly,
    /// Buffered writes, exclusive per database
    ReadWrite,
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting operations
    Active,
    /// Applied
    Committed,
    /// Rolled back; no buffered write was applied
    Aborted,
}

enum TxnOp {
    Put {
        store: String,
        key: String,
        record: Value,
    },
    Add {
        store: String,
        key: String,
        record: Value,
    },
    Delete {
        store: String,
        key: String,
    },
    Clear {
        store: String,
    },
}

/// A transaction over one database.
pub struct Transaction {
    db: Arc<SharedDatabase>,
    env: Arc<Environment>,
    mode: TxnMode,
    state: TxnState,
    pending: Vec<TxnOp>,
    gate_held: bool,
}

impl Transaction {
    pub(crate) fn begin(db: Arc<SharedDatabase>, env: Arc<Environment>, mode: TxnMode) -> Self {
        let gate_held = mode == TxnMode::ReadWrite;
        if gate_held {
            db.write_gate.acquire();
        }
        Self {
            db,
            env,
            mode,
            state: TxnState::Active,
            pending: Vec::new(),
            gate_held,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Transaction mode.
    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    fn ensure_active(&self) -> StowageResult<()> {
        match self.state {
            TxnState::Active => Ok(()),
            TxnState::Committed => Err(StowageError::InvalidOperation(
                "transaction already committed".to_string(),
            )),
            TxnState::Aborted => Err(StowageError::TransactionAborted(
                "transaction was aborted".to_string(),
            )),
        }
    }

    fn ensure_writable(&self) -> StowageResult<()> {
        self.ensure_active()?;
        if self.mode == TxnMode::ReadOnly {
            return Err(StowageError::InvalidOperation(
                "write in read-only transaction".to_string(),
            ));
        }
        Ok(())
    }

    /// Store snapshot with this transaction's buffered writes applied, so
    /// reads inside a read-write transaction see their own writes.
    fn materialize(&self, store_name: &str) -> StowageResult<Store> {
        let state = self.db.state.lock();
        let mut store = state
            .stores
            .get(store_name)
            .cloned()
            .ok_or_else(|| StowageError::UnknownStore(store_name.to_string()))?;
        drop(state);
        for op in &self.pending {
            match op {
                TxnOp::Put { store: s, key, record } | TxnOp::Add { store: s, key, record }
                    if s == store_name =>
                {
                    // Overlay ignores validation; commit re-validates.
                    let _ = store.put(store_name, key.clone(), record.clone());
                }
                TxnOp::Delete { store: s, key } if s == store_name => {
                    store.delete(key);
                }
                TxnOp::Clear { store: s } if s == store_name => {
                    store.clear();
                }
                _ => {}
            }
        }
        Ok(store)
    }

    /// Read a record.
    pub fn get(&self, store: &str, key: &str) -> StowageResult<Option<Value>> {
        self.ensure_active()?;
        self.env.faults().apply_latency();
        Ok(self.materialize(store)?.get(key).cloned())
    }

    /// Read all records.
    pub fn get_all(&self, store: &str) -> StowageResult<Vec<Value>> {
        self.ensure_active()?;
        self.env.faults().apply_latency();
        Ok(self.materialize(store)?.get_all())
    }

    /// Count records.
    pub fn count(&self, store: &str) -> StowageResult<usize> {
        self.ensure_active()?;
        self.env.faults().apply_latency();
        Ok(self.materialize(store)?.count())
    }

    /// Cursor over an index.
    pub fn iter_by_index(
        &self,
        store: &str,
        index: &str,
        direction: Direction,
    ) -> StowageResult<Vec<Value>> {
        self.ensure_active()?;
        self.env.faults().apply_latency();
        self.materialize(store)?.iter_by_index(store, index, direction)
    }

    /// Extract a record's primary key per the store's key field.
    pub fn key_of(&self, store: &str, record: &Value) -> StowageResult<String> {
        let state = self.db.state.lock();
        let store_ref = state
            .stores
            .get(store)
            .ok_or_else(|| StowageError::UnknownStore(store.to_string()))?;
        store_ref.key_of(store, record)
    }

    /// Buffer an insert-or-replace.
    pub fn put(&mut self, store: &str, key: String, record: Value) -> StowageResult<()> {
        self.ensure_writable()?;
        self.env.faults().apply_latency();
        self.pending.push(TxnOp::Put {
            store: store.to_string(),
            key,
            record,
        });
        Ok(())
    }

    /// Buffer an insert that rejects duplicate keys at commit.
    pub fn add(&mut self, store: &str, key: String, record: Value) -> StowageResult<()> {
        self.ensure_writable()?;
        self.env.faults().apply_latency();
        self.pending.push(TxnOp::Add {
            store: store.to_string(),
            key,
            record,
        });
        Ok(())
    }

    /// Buffer a delete.
    pub fn delete(&mut self, store: &str, key: String) -> StowageResult<()> {
        self.ensure_writable()?;
        self.env.faults().apply_latency();
        self.pending.push(TxnOp::Delete {
            store: store.to_string(),
            key,
        });
        Ok(())
    }

    /// Buffer a clear.
    pub fn clear(&mut self, store: &str) -> StowageResult<()> {
        self.ensure_writable()?;
        self.env.faults().apply_latency();
        self.pending.push(TxnOp::Clear {
            store: store.to_string(),
        });
        Ok(())
    }

    /// Apply every buffered write atomically.
    ///
    /// Validation failures (unique indexes, duplicate adds) abort the
    /// transaction; nothing is applied.
    pub fn commit(mut self) -> StowageResult<()> {
        self.ensure_active()?;
        if self.env.faults().aborts_writes() && self.mode == TxnMode::ReadWrite {
            self.settle(TxnState::Aborted);
            return Err(StowageError::TransactionAborted(
                "backend aborted the transaction".to_string(),
            ));
        }

        let result = self.apply_pending();
        match result {
            Ok(()) => {
                self.settle(TxnState::Committed);
                Ok(())
            }
            Err(e) => {
                self.settle(TxnState::Aborted);
                Err(e)
            }
        }
    }

    fn apply_pending(&mut self) -> StowageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut state = self.db.state.lock();

        // Stage onto clones; swap in only if every op validates.
        let mut staged: std::collections::BTreeMap<String, Store> = std::collections::BTreeMap::new();
        for op in &self.pending {
            let store_name = match op {
                TxnOp::Put { store, .. }
                | TxnOp::Add { store, .. }
                | TxnOp::Delete { store, .. }
                | TxnOp::Clear { store } => store,
            };
            let store = match staged.entry(store_name.clone()) {
                std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::btree_map::Entry::Vacant(slot) => {
                    let store = state
                        .stores
                        .get(store_name)
                        .cloned()
                        .ok_or_else(|| StowageError::UnknownStore(store_name.clone()))?;
                    slot.insert(store)
                }
            };
            match op {
                TxnOp::Put { store: name, key, record } => {
                    store.put(name, key.clone(), record.clone())?;
                }
                TxnOp::Add { store: name, key, record } => {
                    store.add(name, key.clone(), record.clone())?;
                }
                TxnOp::Delete { key, .. } => {
                    store.delete(key);
                }
                TxnOp::Clear { .. } => {
                    store.clear();
                }
            }
        }
        for (name, store) in staged {
            state.stores.insert(name, store);
        }
        debug!(db = self.db.name(), ops = self.pending.len(), "transaction committed");
        Ok(())
    }

    /// Abort the transaction, discarding buffered writes. Idempotent.
    pub fn abort(&mut self) {
        if self.state == TxnState::Active {
            self.settle(TxnState::Aborted);
        }
    }

    fn settle(&mut self, state: TxnState) {
        self.state = state;
        self.pending.clear();
        if self.gate_held {
            self.gate_held = false;
            self.db.write_gate.release();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            self.settle(TxnState::Aborted);
        }
    }
}
