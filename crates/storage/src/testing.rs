//! Test support: a reference model oracle
//!
//! A deliberately simple map-of-maps model of the store semantics.
//! Randomized tests replay the same operation sequence against the real
//! backend and the model and compare observable state; divergence means a
//! bug in the backend (or the model, which is small enough to audit by
//! eye).

use serde_json::Value;
use std::collections::BTreeMap;
use stowage_core::{extract_key, store_spec};

/// An operation both the model and the system under test can apply.
#[derive(Debug, Clone)]
pub enum ModelOp {
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
    /// Remove every record
    Clear {
        /// Target store
        store: String,
    },
}

/// The oracle: plain maps with the same keying rules as the real stores.
#[derive(Debug, Default)]
pub struct ReferenceModel {
    stores: BTreeMap<String, BTreeMap<String, Value>>,
}

impl ReferenceModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    fn key_field(store: &str) -> &'static str {
        store_spec(store).map(|spec| spec.key_field).unwrap_or("id")
    }

    /// Apply one operation. Records without a usable key are ignored,
    /// mirroring a rejected write.
    pub fn apply(&mut self, op: &ModelOp) {
        match op {
            ModelOp::Put { store, record } => {
                if let Some(key) = extract_key(record, Self::key_field(store)) {
                    self.stores
                        .entry(store.clone())
                        .or_default()
                        .insert(key, record.clone());
                }
            }
            ModelOp::Delete { store, key } => {
                if let Some(records) = self.stores.get_mut(store) {
                    records.remove(key);
                }
            }
            ModelOp::Clear { store } => {
                self.stores.remove(store);
            }
        }
    }

    /// Read a record.
    pub fn get(&self, store: &str, key: &str) -> Option<&Value> {
        self.stores.get(store)?.get(key)
    }

    /// All records in key order.
    pub fn get_all(&self, store: &str) -> Vec<Value> {
        self.stores
            .get(store)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Record count.
    pub fn count(&self, store: &str) -> usize {
        self.stores.get(store).map(BTreeMap::len).unwrap_or(0)
    }

    /// Keys present in a store.
    pub fn keys(&self, store: &str) -> Vec<String> {
        self.stores
            .get(store)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_put_replaces() {
        let mut model = ReferenceModel::new();
        model.apply(&ModelOp::Put {
            store: "streams".to_string(),
            record: json!({"id": "a", "n": 1}),
        });
        model.apply(&ModelOp::Put {
            store: "streams".to_string(),
            record: json!({"id": "a", "n": 2}),
        });
        assert_eq!(model.count("streams"), 1);
        assert_eq!(model.get("streams", "a").unwrap()["n"], json!(2));
    }

    #[test]
    fn test_model_respects_key_field() {
        let mut model = ReferenceModel::new();
        model.apply(&ModelOp::Put {
            store: "settings".to_string(),
            record: json!({"key": "theme", "value": "dark"}),
        });
        assert!(model.get("settings", "theme").is_some());
    }

    #[test]
    fn test_model_keyless_record_ignored() {
        let mut model = ReferenceModel::new();
        model.apply(&ModelOp::Put {
            store: "streams".to_string(),
            record: json!({"n": 1}),
        });
        assert_eq!(model.count("streams"), 0);
    }

    #[test]
    fn test_model_clear_and_delete() {
        let mut model = ReferenceModel::new();
        for key in ["a", "b"] {
            model.apply(&ModelOp::Put {
                store: "streams".to_string(),
                record: json!({"id": key}),
            });
        }
        model.apply(&ModelOp::Delete {
            store: "streams".to_string(),
            key: "a".to_string(),
        });
        assert_eq!(model.keys("streams"), vec!["b"]);
        model.apply(&ModelOp::Clear {
            store: "streams".to_string(),
        });
        assert_eq!(model.count("streams"), 0);
    }
}
