//! Journaled multi-store batches with compensation
//!
//! A batch of writes across several stores, recorded in the
//! `transaction_journal` store before any write lands. If a step fails,
//! the already-applied steps are undone from captured prior values; an
//! undo that itself fails leaves a row in `transaction_compensation` so
//! the damage is visible and repairable instead of silent.
//!
//! This is best-effort compensation, not isolation: concurrent writers
//! can interleave between steps. It exists for the fallback paths where a
//! real multi-store transaction is unavailable.

use crate::kos::{ObjectStore, PutOptions};
use serde_json::{json, Value};
use std::sync::Arc;
use stowage_core::{now_ms, StowageError, StowageResult};
use tracing::{error, info, warn};

const JOURNAL_STORE: &str = "transaction_journal";
const COMPENSATION_STORE: &str = "transaction_compensation";

/// One step of a journaled batch.
#[derive(Debug, Clone)]
pub enum JournalOp {
    /// Insert or replace a record
    Put {
        /// Target store
        store: String,
        /// The record
        record: Value,
    },
    /// Delete by key
    Delete {
        /// Target store
        store: String,
        /// Primary key
        key: String,
    },
}

enum Undo {
    Restore { store: String, record: Value },
    Remove { store: String, key: String },
    Nothing,
}

/// Journaled batch runner over the object store.
pub struct TransactionJournal {
    store: Arc<ObjectStore>,
}

impl TransactionJournal {
    /// Create a runner over a store handle.
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }

    fn describe(op: &JournalOp) -> Value {
        match op {
            JournalOp::Put { store, record } => json!({"op": "put", "store": store, "record": record}),
            JournalOp::Delete { store, key } => json!({"op": "delete", "store": store, "key": key}),
        }
    }

    /// Run a batch. The journal row is written first, each step captures
    /// the prior value before applying, and the row is removed once the
    /// batch lands (or is fully undone).
    pub fn run(&self, ops: Vec<JournalOp>) -> StowageResult<String> {
        let journal_id = uuid::Uuid::new_v4().to_string();
        let journal_record = json!({
            "id": journal_id,
            "journalTime": now_ms(),
            "operations": ops.iter().map(Self::describe).collect::<Vec<Value>>(),
        });
        self.store
            .put(JOURNAL_STORE, journal_record, PutOptions::default())?;

        let mut undo_stack: Vec<Undo> = Vec::new();
        for (step, op) in ops.iter().enumerate() {
            match self.apply(op, &mut undo_stack) {
                Ok(()) => {}
                Err(e) => {
                    warn!(journal_id = %journal_id, step, error = %e, "journaled batch failed; undoing");
                    self.undo(&journal_id, undo_stack, step, &e)?;
                    self.store.delete(JOURNAL_STORE, &journal_id)?;
                    return Err(e);
                }
            }
        }

        self.store.delete(JOURNAL_STORE, &journal_id)?;
        Ok(journal_id)
    }

    fn apply(&self, op: &JournalOp, undo_stack: &mut Vec<Undo>) -> StowageResult<()> {
        match op {
            JournalOp::Put { store, record } => {
                // Capture the prior value before the put lands.
                let key_field = stowage_core::store_spec(store)
                    .map(|spec| spec.key_field)
                    .unwrap_or("id");
                let key = stowage_core::extract_key(record, key_field).ok_or_else(|| {
                    StowageError::MissingKey {
                        store: store.clone(),
                        key_field: key_field.to_string(),
                    }
                })?;
                let prior = self.store.get(store, &key)?;
                self.store.put(store, record.clone(), PutOptions::default())?;
                undo_stack.push(match prior {
                    Some(record) => Undo::Restore {
                        store: store.clone(),
                        record,
                    },
                    None => Undo::Remove {
                        store: store.clone(),
                        key,
                    },
                });
            }
            JournalOp::Delete { store, key } => {
                match self.store.get(store, key)? {
                    Some(prior) => undo_stack.push(Undo::Restore {
                        store: store.clone(),
                        record: prior,
                    }),
                    None => undo_stack.push(Undo::Nothing),
                }
                self.store.delete(store, key)?;
            }
        }
        Ok(())
    }

    fn undo(
        &self,
        journal_id: &str,
        undo_stack: Vec<Undo>,
        failed_step: usize,
        original: &StowageError,
    ) -> StowageResult<()> {
        for undo in undo_stack.into_iter().rev() {
            let result = match &undo {
                Undo::Restore { store, record } => self
                    .store
                    .put(store, record.clone(), PutOptions::default())
                    .map(|_| ()),
                Undo::Remove { store, key } => self.store.delete(store, key),
                Undo::Nothing => Ok(()),
            };
            if let Err(undo_error) = result {
                error!(journal_id = %journal_id, error = %undo_error, "undo failed; recording compensation");
                let compensation = json!({
                    "id": uuid::Uuid::new_v4().to_string(),
                    "journalId": journal_id,
                    "timestamp": now_ms(),
                    "resolved": false,
                    "failedStep": failed_step,
                    "originalError": original.to_string(),
                    "undoError": undo_error.to_string(),
                });
                self.store
                    .put(COMPENSATION_STORE, compensation, PutOptions::default())?;
            }
        }
        Ok(())
    }

    /// Journal rows left behind by crashed batches.
    pub fn stale_journals(&self) -> StowageResult<Vec<Value>> {
        self.store.get_all(JOURNAL_STORE)
    }

    /// Unresolved compensation rows.
    pub fn unresolved_compensations(&self) -> StowageResult<Vec<Value>> {
        Ok(self
            .store
            .get_all(COMPENSATION_STORE)?
            .into_iter()
            .filter(|record| record.get("resolved") == Some(&Value::Bool(false)))
            .collect())
    }

    /// Mark a compensation row handled.
    pub fn resolve_compensation(&self, id: &str) -> StowageResult<bool> {
        match self.store.get(COMPENSATION_STORE, id)? {
            Some(mut record) => {
                record["resolved"] = Value::Bool(true);
                self.store
                    .put(COMPENSATION_STORE, record, PutOptions::default())?;
                info!(id, "compensation resolved");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{open, OpenOptions};
    use stowage_storage::Environment;

    fn journal() -> (TransactionJournal, Arc<ObjectStore>) {
        let mut options = OpenOptions::new("db");
        options.env = Arc::new(Environment::new());
        let store = Arc::new(open(&options).unwrap());
        (TransactionJournal::new(Arc::clone(&store)), store)
    }

    fn put(store: &str, record: Value) -> JournalOp {
        JournalOp::Put {
            store: store.to_string(),
            record,
        }
    }

    #[test]
    fn test_successful_batch_lands_and_cleans_journal() {
        let (journal, store) = journal();
        journal
            .run(vec![
                put("streams", json!({"id": "s1"})),
                put("settings", json!({"key": "flag", "value": true})),
            ])
            .unwrap();
        assert!(store.get("streams", "s1").unwrap().is_some());
        assert!(store.get("settings", "flag").unwrap().is_some());
        assert!(journal.stale_journals().unwrap().is_empty());
        assert!(journal.unresolved_compensations().unwrap().is_empty());
    }

    #[test]
    fn test_failed_step_undoes_applied_steps() {
        let (journal, store) = journal();
        store
            .put("settings", json!({"key": "flag", "value": "old"}), PutOptions::default())
            .unwrap();

        let err = journal.run(vec![
            put("settings", json!({"key": "flag", "value": "new"})),
            put("streams", json!({"id": "s1"})),
            // Keyless record: the step fails after two applied steps.
            put("streams", json!({"title": "no id"})),
        ]);
        assert!(err.is_err());

        // The overwrite is restored and the insert removed.
        let flag = store.get("settings", "flag").unwrap().unwrap();
        assert_eq!(flag["value"], json!("old"));
        assert!(store.get("streams", "s1").unwrap().is_none());
        assert!(journal.stale_journals().unwrap().is_empty());
        assert!(journal.unresolved_compensations().unwrap().is_empty());
    }

    #[test]
    fn test_delete_step_restores_on_failure() {
        let (journal, store) = journal();
        store
            .put("streams", json!({"id": "victim", "n": 7}), PutOptions::default())
            .unwrap();

        let err = journal.run(vec![
            JournalOp::Delete {
                store: "streams".to_string(),
                key: "victim".to_string(),
            },
            put("streams", json!({"no_key": true})),
        ]);
        assert!(err.is_err());
        let restored = store.get("streams", "victim").unwrap().unwrap();
        assert_eq!(restored["n"], json!(7));
    }

    #[test]
    fn test_journal_write_failure_fails_batch_before_any_step() {
        let (journal, store) = journal();
        let env = Arc::clone(store.environment());
        env.faults().set_abort_writes(true);

        let err = journal.run(vec![put("streams", json!({"id": "s1"}))]);
        assert!(err.is_err());

        env.faults().set_abort_writes(false);
        assert!(store.get("streams", "s1").unwrap().is_none());
        assert!(journal.unresolved_compensations().unwrap().is_empty());
    }

    #[test]
    fn test_resolve_compensation() {
        let (journal, store) = journal();
        store
            .put(
                "transaction_compensation",
                json!({"id": "comp-1", "timestamp": 1, "resolved": false}),
                PutOptions::default(),
            )
            .unwrap();
        assert_eq!(journal.unresolved_compensations().unwrap().len(), 1);
        assert!(journal.resolve_compensation("comp-1").unwrap());
        assert!(journal.unresolved_compensations().unwrap().is_empty());
        assert!(!journal.resolve_compensation("missing").unwrap());
    }
}
