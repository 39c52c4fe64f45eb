//! Vector cache for stowage
//!
//! - `VectorCache`: LRU with pinning, miss/hit/eviction accounting, and
//!   quota-driven auto-sizing
//! - `VectorPersistence` / `PersistenceQueue`: asynchronous persistence
//!   with a retry queue and exponential backoff
//! - `StorageEstimator`: injected device storage estimates

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod lru;
pub mod persistence;
pub mod quota;

pub use cache::{
    CacheEntry, CacheStats, DimensionStats, LruStats, RetryStats, StorageStats, VectorCache,
};
pub use lru::RecencyList;
pub use persistence::{
    MemoryVectorPersistence, PersistTask, PersistedVector, PersistenceQueue, RetryQueueStats,
    VectorPersistence, RETRY_BASE_DELAY,
};
pub use quota::{
    cap_from_estimate, FixedEstimator, QuotaEstimate, StorageEstimator, UnavailableEstimator,
    PER_VECTOR_FALLBACK_BYTES,
};
