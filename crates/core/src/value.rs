//! Record model helpers
//!
//! Stowage records are schemaless JSON documents (`serde_json::Value`
//! objects). This module owns the helpers the engine uses to treat them as
//! store records:
//!
//! - key extraction via the store's declared key field
//! - stamping of the reserved `writeEpoch` / `writerId` fields
//! - ordering of index values for cursor iteration and fallback sorting
//!
//! Readers must tolerate records without the reserved fields (legacy data).

use serde_json::Value;
use std::cmp::Ordering;

/// Reserved field carrying the vector-clock state of the writing process.
pub const WRITE_EPOCH_FIELD: &str = "writeEpoch";

/// Reserved field carrying the stable writer id of the writing process.
pub const WRITER_ID_FIELD: &str = "writerId";

/// Attributes the fallback backend is allowed to sort by when it has no
/// real index to cursor over.
pub const SORTABLE_ATTRIBUTES: &[&str] = &["updatedAt", "timestamp", "startDate"];

/// Get current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Extract a record's key using the store's declared key field.
///
/// String keys are returned as-is; integer keys are rendered in decimal so
/// a record keyed `{"id": 7}` and a lookup for `"7"` agree. Anything else
/// is not a usable key.
pub fn extract_key(record: &Value, key_field: &str) -> Option<String> {
    match record.get(key_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Stamp the reserved write-epoch and writer-id fields onto a record.
///
/// Non-object records are left untouched; the engine only stamps objects.
pub fn stamp_record(record: &mut Value, epoch: &Value, writer_id: &str) {
    if let Value::Object(map) = record {
        map.insert(WRITE_EPOCH_FIELD.to_string(), epoch.clone());
        map.insert(
            WRITER_ID_FIELD.to_string(),
            Value::String(writer_id.to_string()),
        );
    }
}

/// Read a record's write epoch, if present and well-formed.
///
/// A missing or malformed epoch is treated as absent (legacy record).
pub fn write_epoch(record: &Value) -> Option<&serde_json::Map<String, Value>> {
    match record.get(WRITE_EPOCH_FIELD) {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Compare two index values for cursor ordering.
///
/// Orders null < number < string < everything else, numbers numerically and
/// strings lexicographically. Gives every pair a total order so cursors and
/// fallback sorts are deterministic even over mixed data.
pub fn compare_index_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::String(_) => 2,
            _ => 3,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Deep-copy a record.
///
/// This is the copy boundary for user-supplied modifiers and rollback
/// captures. The JSON data model has no Date-like values, so a structural
/// clone preserves everything, including explicit nulls.
pub fn deep_clone(record: &Value) -> Value {
    record.clone()
}
