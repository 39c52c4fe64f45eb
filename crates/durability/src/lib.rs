//! Write-ahead log for stowage
//!
//! Durable, prioritized, crash-recoverable deferral of writes:
//! - `WalEntry` / `WalResultRecord`: the persisted formats
//! - `WriteAheadLog`: enqueue, drain, replay, result window, cross-tab
//!   gating
//! - `OperationRegistry`: named operations with the replay idempotency
//!   adapter
//! - `Precondition`: the gate that decides direct-run versus deferral
//! - `EntryHandle`: in-process completion waiters

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod gate;
pub mod handle;
pub mod registry;
pub mod wal;

pub use entry::{
    WalEntry, WalPriority, WalResultBody, WalResultRecord, WalStatus, DEFERRED_ERROR,
};
pub use gate::{AlwaysMet, Precondition, TogglePrecondition};
pub use handle::{EntryHandle, EntryWaiter};
pub use registry::{OpHandler, OperationRegistry, ADD_OPERATION, PUT_OPERATION};
pub use wal::{
    QueuedWrite, WriteAheadLog, COMMITTED_RETENTION_MS, CRASHED_PROCESSING_MS, REPLAY_WAIT_MS,
    WAL_KEY, WAL_RESULTS_KEY, WAL_SEQ_KEY,
};
