//! Append-only event log
//!
//! A thin facility over the `event_log` and `event_checkpoint` stores:
//! events get a strictly increasing sequence number (enforced by the
//! store's unique index), consumers record how far they have read, and
//! events at or below every consumer's checkpoint can be pruned.
//!
//! Sequence numbers are seeded from the store on first use, so they keep
//! increasing across sessions.

use crate::kos::{ObjectStore, PutOptions};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use stowage_core::{now_ms, StowageResult};
use stowage_storage::Direction;
use tracing::{debug, info};

const EVENT_STORE: &str = "event_log";
const CHECKPOINT_STORE: &str = "event_checkpoint";

/// Append-only log over the object store.
pub struct EventLog {
    store: Arc<ObjectStore>,
    // None until seeded from the store.
    next_sequence: Mutex<Option<u64>>,
}

impl EventLog {
    /// Create a log over a store handle.
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            next_sequence: Mutex::new(None),
        }
    }

    fn seed_sequence(&self) -> StowageResult<u64> {
        let mut next = self.next_sequence.lock();
        if let Some(sequence) = *next {
            return Ok(sequence);
        }
        let highest = self
            .store
            .get_all(EVENT_STORE)?
            .iter()
            .filter_map(|event| event.get("sequenceNumber")?.as_u64())
            .max()
            .unwrap_or(0);
        *next = Some(highest + 1);
        debug!(next = highest + 1, "event log sequence seeded");
        Ok(highest + 1)
    }

    /// Append an event; returns its sequence number.
    pub fn append(&self, event_type: &str, payload: Value) -> StowageResult<u64> {
        let sequence = self.seed_sequence()?;
        let record = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "sequenceNumber": sequence,
            "type": event_type,
            "timestamp": now_ms(),
            "payload": payload,
        });
        self.store.put(EVENT_STORE, record, PutOptions::default())?;
        *self.next_sequence.lock() = Some(sequence + 1);
        Ok(sequence)
    }

    /// Events with sequence number >= `from`, in sequence order.
    pub fn read_from(&self, from: u64) -> StowageResult<Vec<Value>> {
        let events = self
            .store
            .get_all_by_index(EVENT_STORE, "sequenceNumber", Direction::Ascending)?;
        Ok(events
            .into_iter()
            .filter(|event| {
                event
                    .get("sequenceNumber")
                    .and_then(Value::as_u64)
                    .map(|sequence| sequence >= from)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Events of one type, in sequence order.
    pub fn read_by_type(&self, event_type: &str) -> StowageResult<Vec<Value>> {
        let events = self
            .store
            .get_all_by_index(EVENT_STORE, "sequenceNumber", Direction::Ascending)?;
        Ok(events
            .into_iter()
            .filter(|event| event.get("type").and_then(Value::as_str) == Some(event_type))
            .collect())
    }

    /// Record how far a consumer has read.
    pub fn checkpoint(&self, consumer: &str, sequence: u64) -> StowageResult<()> {
        let record = json!({
            "id": consumer,
            "sequenceNumber": sequence,
        });
        // The unique index on sequenceNumber guards distinct consumers
        // from sharing a row, not from advancing their own.
        self.store
            .put(CHECKPOINT_STORE, record, PutOptions::default())?;
        Ok(())
    }

    /// A consumer's checkpoint, if any.
    pub fn checkpoint_of(&self, consumer: &str) -> StowageResult<Option<u64>> {
        Ok(self
            .store
            .get(CHECKPOINT_STORE, consumer)?
            .and_then(|record| record.get("sequenceNumber")?.as_u64()))
    }

    /// Smallest checkpoint across all consumers (None without consumers).
    pub fn low_watermark(&self) -> StowageResult<Option<u64>> {
        Ok(self
            .store
            .get_all(CHECKPOINT_STORE)?
            .iter()
            .filter_map(|record| record.get("sequenceNumber")?.as_u64())
            .min())
    }

    /// Prune events every consumer has seen (sequence <= low watermark).
    /// Returns how many events were removed.
    pub fn prune_consumed(&self) -> StowageResult<usize> {
        let watermark = match self.low_watermark()? {
            Some(watermark) => watermark,
            None => return Ok(0),
        };
        let mut pruned = 0;
        for event in self.store.get_all(EVENT_STORE)? {
            let sequence = event.get("sequenceNumber").and_then(Value::as_u64);
            let id = event.get("id").and_then(Value::as_str);
            if let (Some(sequence), Some(id)) = (sequence, id) {
                if sequence <= watermark {
                    self.store.delete(EVENT_STORE, id)?;
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            info!(pruned, watermark, "pruned consumed events");
        }
        Ok(pruned)
    }
}
