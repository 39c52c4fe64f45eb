//! Concurrency primitives for stowage
//!
//! - Vector clocks tracking per-writer logical time
//! - Conflict detection over epoch-stamped records
//! - Write-authority policy enforcement

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod authority;
pub mod clock;
pub mod conflict;

pub use authority::{AuthorityPolicy, WriteDecision};
pub use clock::{ClockOrdering, ClockState, VectorClock};
pub use conflict::{detect_conflict, ConflictOutcome, ConflictReason, ConflictWinner};
