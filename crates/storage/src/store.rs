//! Object stores and secondary indexes
//!
//! A store holds JSON records keyed by a single string key extracted from
//! the record's declared key field. Secondary indexes are declared at
//! upgrade time and yield records sorted by the indexed field, ascending or
//! descending. `BTreeMap` keeps primary-key iteration deterministic.

use serde_json::Value;
use std::collections::BTreeMap;
use stowage_core::{compare_index_values, extract_key, StowageError, StowageResult};

/// Cursor direction over an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest index key first
    Ascending,
    /// Largest index key first
    Descending,
}

/// A declared secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// Index name
    pub name: String,
    /// Record field the index is built over
    pub key_field: String,
    /// Whether duplicate index keys are rejected
    pub unique: bool,
}

/// A named store of keyed records.
#[derive(Debug, Clone, Default)]
pub struct Store {
    key_field: String,
    records: BTreeMap<String, Value>,
    indexes: BTreeMap<String, IndexDef>,
}

impl Store {
    /// Create an empty store with the given primary-key field.
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    /// The record field used as the primary key.
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Declare a secondary index. Replacing an existing declaration is
    /// allowed; the index is virtual so no rebuild is needed.
    pub fn add_index(&mut self, index: IndexDef) {
        self.indexes.insert(index.name.clone(), index);
    }

    /// Look up an index declaration.
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.get(name)
    }

    /// Declared index names.
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// Extract the primary key from a record per this store's key field.
    pub fn key_of(&self, store_name: &str, record: &Value) -> StowageResult<String> {
        extract_key(record, &self.key_field).ok_or_else(|| StowageError::MissingKey {
            store: store_name.to_string(),
            key_field: self.key_field.clone(),
        })
    }

    /// Insert or replace a record under `key`.
    ///
    /// Unique indexes reject a record whose indexed value collides with a
    /// different record's.
    pub fn put(&mut self, store_name: &str, key: String, record: Value) -> StowageResult<()> {
        self.check_unique_indexes(store_name, &key, &record)?;
        self.records.insert(key, record);
        Ok(())
    }

    /// Insert a record, rejecting duplicates of the primary key.
    pub fn add(&mut self, store_name: &str, key: String, record: Value) -> StowageResult<()> {
        if self.records.contains_key(&key) {
            return Err(StowageError::ConstraintViolation {
                store: store_name.to_string(),
                key,
            });
        }
        self.put(store_name, key, record)
    }

    fn check_unique_indexes(
        &self,
        store_name: &str,
        key: &str,
        record: &Value,
    ) -> StowageResult<()> {
        for index in self.indexes.values().filter(|index| index.unique) {
            let candidate = record.get(&index.key_field);
            let candidate = match candidate {
                Some(value) if !value.is_null() => value,
                _ => continue,
            };
            let collision = self.records.iter().any(|(other_key, other)| {
                other_key != key && other.get(&index.key_field) == Some(candidate)
            });
            if collision {
                return Err(StowageError::ConstraintViolation {
                    store: store_name.to_string(),
                    key: format!("{}={}", index.name, candidate),
                });
            }
        }
        Ok(())
    }

    /// Read a record by primary key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.records.get(key)
    }

    /// All records in primary-key order.
    pub fn get_all(&self) -> Vec<Value> {
        self.records.values().cloned().collect()
    }

    /// Remove a record by primary key.
    pub fn delete(&mut self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    /// Remove every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of records.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Iterate an index as a cursor would: records sorted by the indexed
    /// field, ties broken by primary key for a stable order.
    pub fn iter_by_index(
        &self,
        store_name: &str,
        index_name: &str,
        direction: Direction,
    ) -> StowageResult<Vec<Value>> {
        let index = self.indexes.get(index_name).ok_or_else(|| {
            StowageError::InvalidOperation(format!(
                "store '{store_name}' has no index '{index_name}'"
            ))
        })?;
        let mut rows: Vec<(&String, &Value)> = self.records.iter().collect();
        rows.sort_by(|(key_a, a), (key_b, b)| {
            let null = Value::Null;
            let value_a = a.get(&index.key_field).unwrap_or(&null);
            let value_b = b.get(&index.key_field).unwrap_or(&null);
            compare_index_values(value_a, value_b).then_with(|| key_a.cmp(key_b))
        });
        if direction == Direction::Descending {
            rows.reverse();
        }
        Ok(rows.into_iter().map(|(_, record)| record.clone()).collect())
    }
}
