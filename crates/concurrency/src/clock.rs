//! Vector clocks for per-writer logical time
//!
//! Each writing process owns a `VectorClock` keyed by its stable writer id.
//! A clock state is a mapping from writer id to a non-negative counter;
//! `tick()` advances the local counter and returns a snapshot suitable for
//! stamping onto a record. Comparing two states classifies their causal
//! relationship.
//!
//! # Invariants
//!
//! - A writer's own counter never decreases across `tick()` calls.
//! - `tick()` returns a deep copy; later ticks do not mutate earlier
//!   snapshots.
//! - State uses `BTreeMap` so iteration and serialization are
//!   deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relationship between two clock states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every counter in `a` ≤ the counter in `b`, at least one strictly less
    Before,
    /// Every counter in `a` ≥ the counter in `b`, at least one strictly greater
    After,
    /// All counters equal
    Equal,
    /// Neither state is an ancestor of the other
    Concurrent,
}

/// A snapshot of logical time across writers.
///
/// Missing writers are treated as counter 0, so states with different key
/// sets compare sensibly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClockState {
    counts: BTreeMap<String, u64>,
}

impl ClockState {
    /// Empty state (all counters zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from explicit counters.
    pub fn from_counts(counts: BTreeMap<String, u64>) -> Self {
        Self { counts }
    }

    /// Counter for a writer (0 when absent).
    pub fn counter(&self, writer_id: &str) -> u64 {
        self.counts.get(writer_id).copied().unwrap_or(0)
    }

    /// Iterate over (writer, counter) pairs in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counts.iter()
    }

    /// Whether no writer has ever ticked.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Parse a state from a JSON value.
    ///
    /// A missing or malformed value yields `None`; callers treat that as a
    /// legacy record with no epoch.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => {
                let mut counts = BTreeMap::new();
                for (writer, counter) in map {
                    counts.insert(writer.clone(), counter.as_u64()?);
                }
                Some(Self { counts })
            }
            _ => None,
        }
    }

    /// Serialize the state to a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.counts
                .iter()
                .map(|(writer, counter)| (writer.clone(), serde_json::Value::from(*counter)))
                .collect(),
        )
    }

    /// Classify this state against another.
    pub fn compare(&self, other: &ClockState) -> ClockOrdering {
        let mut some_less = false;
        let mut some_greater = false;

        for writer in self.counts.keys().chain(other.counts.keys()) {
            let a = self.counter(writer);
            let b = other.counter(writer);
            if a < b {
                some_less = true;
            } else if a > b {
                some_greater = true;
            }
        }

        match (some_less, some_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }
}

/// Per-writer logical clock.
#[derive(Debug, Clone)]
pub struct VectorClock {
    writer_id: String,
    counts: ClockState,
}

impl VectorClock {
    /// Create a fresh clock for a writer.
    pub fn new(writer_id: impl Into<String>) -> Self {
        Self {
            writer_id: writer_id.into(),
            counts: ClockState::new(),
        }
    }

    /// Reconstruct a clock from a persisted state, for comparison or to
    /// continue ticking from where a previous session left off.
    pub fn from_state(state: ClockState, writer_id: impl Into<String>) -> Self {
        Self {
            writer_id: writer_id.into(),
            counts: state,
        }
    }

    /// The stable writer id this clock ticks for.
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// Current state snapshot without advancing.
    pub fn state(&self) -> &ClockState {
        &self.counts
    }

    /// Advance the local writer's counter and return a snapshot of the new
    /// state.
    pub fn tick(&mut self) -> ClockState {
        let counter = self.counts.counts.entry(self.writer_id.clone()).or_insert(0);
        *counter += 1;
        self.counts.clone()
    }

    /// Merge another state into this clock (pairwise max), so later ticks
    /// dominate everything already observed.
    pub fn observe(&mut self, other: &ClockState) {
        for (writer, &counter) in other.iter() {
            let entry = self.counts.counts.entry(writer.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Classify this clock's state against another state.
    pub fn compare(&self, other: &ClockState) -> ClockOrdering {
        self.counts.compare(other)
    }
}
