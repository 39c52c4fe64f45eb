//! Stowage engine
//!
//! Connection lifecycle with retry/backoff and fallback activation,
//! schema migrations with a store safety net, the keyed object store
//! primitives, the append-only event log, journaled batches with
//! compensation, the emergency backup slot, the maintenance scheduler,
//! the worker-pool interface, and the assembled `Stowage` handle.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod connection;
pub mod event_log;
pub mod journal;
pub mod kos;
pub mod migrations;
pub mod scheduler;
pub mod stowage;
pub mod worker;

pub use backup::{
    EmergencyBackup, EmergencyBackupSlot, BACKUP_MAX_AGE_MS, BACKUP_MAX_MESSAGES,
    EMERGENCY_BACKUP_KEY,
};
pub use connection::{open, open_with_retry, OpenOptions};
pub use event_log::EventLog;
pub use journal::{JournalOp, TransactionJournal};
pub use kos::{Backend, ObjectStore, PutOptions, StoreTxn};
pub use migrations::{ensure_stores, run_migrations};
pub use scheduler::{MaintenanceScheduler, MaintenanceTask};
pub use stowage::{Stowage, StowageOptions};
pub use worker::{
    BackpressureListener, BackpressureWatermarks, PendingRequests, ResultCounter, WorkerHeartbeat,
    WorkerResponse, WorkerTask,
};
