//! Storage backends for stowage
//!
//! - `KvSurface`: flat durable (or volatile) string key/value surface with
//!   quota accounting; the substrate for the fallback backend, the WAL,
//!   and the emergency backup slot
//! - `Environment` / `DbHandle` / `Transaction`: the primary object-store
//!   backend with named stores, secondary indexes, versioned upgrades,
//!   version-change notification, and per-database write serialization
//! - `FallbackBackend`: the persistent-or-memory downgrade surface

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod env;
pub mod fallback;
pub mod kv;
pub mod store;
pub mod testing;
pub mod txn;

pub use env::{
    DbHandle, Environment, FaultInjector, SharedDatabase, UpgradeTxn, VersionChangeCallback,
    PROBE_DATABASE, PROBE_WATCHDOG,
};
pub use fallback::{FallbackBackend, FallbackMode, FALLBACK_NAMESPACE};
pub use kv::{FileKv, KvSurface, MemoryKv};
pub use store::{Direction, IndexDef, Store};
pub use txn::{Transaction, TxnMode, TxnState};
