//! Stowage is an embedded, multi-tab-safe client-side storage engine.
//!
//! Four tightly coupled subsystems over an object-store backend:
//!
//! - **Keyed object store**: primitive CRUD over named stores with indexed
//!   cursors, atomic read-modify-write, and vector-clock conflict
//!   detection ([`ObjectStore`], [`detect_conflict`])
//! - **Fallback backend**: transparent downgrade to a persistent or
//!   in-memory key/value surface when the primary backend is unavailable
//!   ([`FallbackBackend`])
//! - **Write-ahead log**: a durable, prioritized, crash-recoverable queue
//!   of deferred writes with replay-safe idempotent operations
//!   ([`WriteAheadLog`])
//! - **Vector cache**: in-process LRU with pinning, asynchronous
//!   persistence with a retry queue, and quota-driven auto-sizing
//!   ([`VectorCache`])
//!
//! [`Stowage::open`] assembles all four over one configuration.
//!
//! ```no_run
//! use stowage::{Stowage, StowageOptions, PutOptions};
//!
//! let engine = Stowage::open(StowageOptions::new("my-app")).unwrap();
//! engine
//!     .store()
//!     .put(
//!         "streams",
//!         serde_json::json!({"id": "s1", "title": "hello"}),
//!         PutOptions::default(),
//!     )
//!     .unwrap();
//! ```

// Core types
pub use stowage_core::{
    AuthorityConfig, ConnectionConfig, EventBus, RequestConfig, SharedCoordinator, StowageConfig,
    StowageError, StowageResult, Subscription, TabCoordinator, TimerToken, Topic,
    VectorCacheConfig, WalConfig, CURRENT_SCHEMA_VERSION, DECLARED_STORES,
};

// Concurrency: clocks, conflicts, authority
pub use stowage_concurrency::{
    detect_conflict, AuthorityPolicy, ClockOrdering, ClockState, ConflictOutcome, ConflictReason,
    ConflictWinner, VectorClock, WriteDecision,
};

// Storage backends
pub use stowage_storage::{
    Direction, Environment, FallbackBackend, FallbackMode, KvSurface, TxnMode,
};

// Write-ahead log
pub use stowage_durability::{
    AlwaysMet, EntryHandle, Precondition, QueuedWrite, TogglePrecondition, WalEntry, WalPriority,
    WalResultRecord, WalStatus, WriteAheadLog,
};

// Vector cache
pub use stowage_cache::{
    CacheEntry, CacheStats, FixedEstimator, MemoryVectorPersistence, PersistedVector,
    QuotaEstimate, StorageEstimator, VectorCache, VectorPersistence,
};

// Engine
pub use stowage_engine::{
    open, open_with_retry, Backend, EmergencyBackup, EmergencyBackupSlot, EventLog, JournalOp,
    ObjectStore, OpenOptions, PutOptions, Stowage, StowageOptions, StoreTxn, TransactionJournal,
};
