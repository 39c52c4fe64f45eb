//! WAL entry and result types
//!
//! Entries are the durable records of deferred logical writes; results are
//! the recency-limited record of what each entry produced. Both serialize
//! as JSON with camelCase fields. In-process completion handles are never
//! persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stowage_core::now_ms;

/// Drain priority. Lower drains first; within a priority, sequence order
/// applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalPriority {
    /// Data-loss-preventing writes
    Critical = 0,
    /// User-visible writes
    High = 1,
    /// Default
    Normal = 2,
    /// Housekeeping
    Low = 3,
}

impl Default for WalPriority {
    fn default() -> Self {
        WalPriority::Normal
    }
}

/// Entry lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalStatus {
    /// Waiting to be drained
    Pending,
    /// Picked up by a drain batch
    Processing,
    /// Applied; retained briefly for debugging
    Committed,
    /// Failed; retried until attempts run out
    Failed,
}

/// A durable deferred write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
    /// Unique entry id; the stable handle for post-crash result lookup
    pub id: String,
    /// Monotonic per-process sequence number
    pub sequence: u64,
    /// Registered operation name
    pub operation: String,
    /// Operation arguments
    pub args: Vec<Value>,
    /// Drain priority
    pub priority: WalPriority,
    /// Lifecycle status
    pub status: WalStatus,
    /// Creation time, milliseconds since epoch
    pub created_at: u64,
    /// Last pickup time, milliseconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<u64>,
    /// Drain attempts so far
    #[serde(default)]
    pub attempts: u32,
    /// Last error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WalEntry {
    /// Create a fresh pending entry.
    pub fn new(
        sequence: u64,
        operation: impl Into<String>,
        args: Vec<Value>,
        priority: WalPriority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            operation: operation.into(),
            args,
            priority,
            status: WalStatus::Pending,
            created_at: now_ms(),
            processed_at: None,
            attempts: 0,
            error: None,
        }
    }

    /// Whether this entry still needs draining.
    pub fn needs_drain(&self, max_attempts: u32) -> bool {
        match self.status {
            WalStatus::Pending => true,
            WalStatus::Failed => self.attempts < max_attempts || self.error_is_deferral(),
            _ => false,
        }
    }

    /// Whether this entry is terminally failed.
    pub fn is_terminal_failure(&self, max_attempts: u32) -> bool {
        self.status == WalStatus::Failed
            && self.attempts >= max_attempts
            && !self.error_is_deferral()
    }

    fn error_is_deferral(&self) -> bool {
        self.error
            .as_deref()
            .map(|error| error.starts_with(DEFERRED_ERROR))
            .unwrap_or(false)
    }

    /// Drain ordering key: (priority, sequence) lexicographic.
    pub fn drain_key(&self) -> (WalPriority, u64) {
        (self.priority, self.sequence)
    }
}

/// Error text marking a deferral (precondition still unmet). Deferrals are
/// retried indefinitely and never count as terminal failures.
pub const DEFERRED_ERROR: &str = "deferred: precondition not met";

/// Outcome of one entry, persisted in the recency-limited result window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalResultRecord {
    /// The entry this result belongs to
    pub entry_id: String,
    /// Outcome body
    pub result: WalResultBody,
    /// Completion time, milliseconds since epoch
    pub timestamp: u64,
}

/// Success-or-error body of a result record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalResultBody {
    /// Whether the operation committed
    pub success: bool,
    /// Operation return value on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WalResultRecord {
    /// Record a committed entry.
    pub fn success(entry_id: impl Into<String>, value: Value) -> Self {
        Self {
            entry_id: entry_id.into(),
            result: WalResultBody {
                success: true,
                value: Some(value),
                error: None,
            },
            timestamp: now_ms(),
        }
    }

    /// Record a terminal failure.
    pub fn failure(entry_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            result: WalResultBody {
                success: false,
                value: None,
                error: Some(error.into()),
            },
            timestamp: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_drain_order() {
        assert!(WalPriority::Critical < WalPriority::High);
        assert!(WalPriority::High < WalPriority::Normal);
        assert!(WalPriority::Normal < WalPriority::Low);
    }

    #[test]
    fn test_entry_serde_camel_case() {
        let entry = WalEntry::new(7, "put", vec![json!("streams"), json!({"id": "a"})], WalPriority::High);
        let raw = serde_json::to_value(&entry).unwrap();
        assert_eq!(raw["sequence"], json!(7));
        assert_eq!(raw["priority"], json!("high"));
        assert_eq!(raw["status"], json!("pending"));
        assert!(raw["createdAt"].is_u64());
        assert!(raw.get("processedAt").is_none());

        let back: WalEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(back.operation, "put");
        assert_eq!(back.attempts, 0);
    }

    #[test]
    fn test_needs_drain() {
        let mut entry = WalEntry::new(1, "put", vec![], WalPriority::Normal);
        assert!(entry.needs_drain(3));

        entry.status = WalStatus::Committed;
        assert!(!entry.needs_drain(3));

        entry.status = WalStatus::Failed;
        entry.attempts = 2;
        assert!(entry.needs_drain(3));
        entry.attempts = 3;
        assert!(!entry.needs_drain(3));
        assert!(entry.is_terminal_failure(3));
    }

    #[test]
    fn test_deferral_never_terminal() {
        let mut entry = WalEntry::new(1, "put", vec![], WalPriority::Normal);
        entry.status = WalStatus::Failed;
        entry.attempts = 10;
        entry.error = Some(DEFERRED_ERROR.to_string());
        assert!(entry.needs_drain(3));
        assert!(!entry.is_terminal_failure(3));
    }

    #[test]
    fn test_drain_key_ordering() {
        let critical_late = {
            let mut entry = WalEntry::new(9, "put", vec![], WalPriority::Critical);
            entry.status = WalStatus::Pending;
            entry
        };
        let normal_early = WalEntry::new(1, "put", vec![], WalPriority::Normal);
        assert!(critical_late.drain_key() < normal_early.drain_key());
    }

    #[test]
    fn test_result_record_round_trip() {
        let record = WalResultRecord::success("e1", json!({"key": "a"}));
        let raw = serde_json::to_value(&record).unwrap();
        assert_eq!(raw["entryId"], json!("e1"));
        assert_eq!(raw["result"]["success"], json!(true));
        let back: WalResultRecord = serde_json::from_value(raw).unwrap();
        assert!(back.result.success);
    }
}
