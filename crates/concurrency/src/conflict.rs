//! Write-conflict detection over stamped records
//!
//! Given an existing stored record and an incoming candidate, classify the
//! write: does it conflict, which record wins, and why. Detection is a pure
//! function; the store never applies it automatically. Callers opt in when
//! reconciling two candidate values.
//!
//! Records without a well-formed `writeEpoch` are legacy data and never
//! lose to an unstamped incoming write.

use crate::clock::{ClockOrdering, ClockState};
use serde_json::Value;
use stowage_core::value::{write_epoch, WRITER_ID_FIELD};

/// Which record survives the reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    /// The record already in the store wins
    Existing,
    /// The incoming candidate wins
    Incoming,
}

/// Why the winner was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Nothing stored yet
    NoExisting,
    /// Neither record carries an epoch (legacy data)
    LegacyData,
    /// Only the incoming record carries an epoch
    OnlyIncomingStamped,
    /// Only the existing record carries an epoch
    OnlyExistingStamped,
    /// Incoming causally descends from (or equals) existing
    IncomingNewer,
    /// Existing causally descends from incoming
    ExistingNewer,
    /// Divergent writes; winner chosen by writer-id tiebreak
    ConcurrentTiebreak,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConflictReason::NoExisting => "no existing record",
            ConflictReason::LegacyData => "legacy data without epochs",
            ConflictReason::OnlyIncomingStamped => "only incoming carries an epoch",
            ConflictReason::OnlyExistingStamped => "only existing carries an epoch",
            ConflictReason::IncomingNewer => "incoming is causally newer or equal",
            ConflictReason::ExistingNewer => "existing is causally newer",
            ConflictReason::ConcurrentTiebreak => "concurrent writes, writer-id tiebreak",
        };
        f.write_str(text)
    }
}

/// Outcome of conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictOutcome {
    /// Whether the two records genuinely conflict
    pub has_conflict: bool,
    /// Which record should be kept
    pub winner: ConflictWinner,
    /// Why
    pub reason: ConflictReason,
    /// Whether the epochs were concurrent in the vector-clock sense
    pub is_concurrent: bool,
}

fn epoch_of(record: &Value) -> Option<ClockState> {
    write_epoch(record).and_then(|map| ClockState::from_json(&Value::Object(map.clone())))
}

fn writer_of(record: &Value) -> &str {
    record
        .get(WRITER_ID_FIELD)
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Classify an incoming write against the existing stored record.
///
/// Total over well-formed inputs: always returns exactly one outcome and
/// never fails. Malformed epochs are treated as absent.
pub fn detect_conflict(existing: Option<&Value>, incoming: &Value) -> ConflictOutcome {
    let existing = match existing {
        None => {
            return ConflictOutcome {
                has_conflict: false,
                winner: ConflictWinner::Incoming,
                reason: ConflictReason::NoExisting,
                is_concurrent: false,
            }
        }
        Some(record) => record,
    };

    let existing_epoch = epoch_of(existing);
    let incoming_epoch = epoch_of(incoming);

    match (existing_epoch, incoming_epoch) {
        (None, None) => ConflictOutcome {
            has_conflict: false,
            winner: ConflictWinner::Incoming,
            reason: ConflictReason::LegacyData,
            is_concurrent: false,
        },
        (None, Some(_)) => ConflictOutcome {
            has_conflict: false,
            winner: ConflictWinner::Incoming,
            reason: ConflictReason::OnlyIncomingStamped,
            is_concurrent: false,
        },
        (Some(_), None) => ConflictOutcome {
            // A stamped record never silently loses to an unstamped write.
            has_conflict: true,
            winner: ConflictWinner::Existing,
            reason: ConflictReason::OnlyExistingStamped,
            is_concurrent: false,
        },
        (Some(existing_state), Some(incoming_state)) => {
            match existing_state.compare(&incoming_state) {
                ClockOrdering::Equal | ClockOrdering::Before => ConflictOutcome {
                    has_conflict: false,
                    winner: ConflictWinner::Incoming,
                    reason: ConflictReason::IncomingNewer,
                    is_concurrent: false,
                },
                ClockOrdering::After => ConflictOutcome {
                    has_conflict: true,
                    winner: ConflictWinner::Existing,
                    reason: ConflictReason::ExistingNewer,
                    is_concurrent: false,
                },
                ClockOrdering::Concurrent => {
                    // Deterministic tiebreak: smaller writer id wins.
                    let winner = if writer_of(existing) <= writer_of(incoming) {
                        ConflictWinner::Existing
                    } else {
                        ConflictWinner::Incoming
                    };
                    ConflictOutcome {
                        has_conflict: true,
                        winner,
                        reason: ConflictReason::ConcurrentTiebreak,
                        is_concurrent: true,
                    }
                }
            }
        }
    }
}
