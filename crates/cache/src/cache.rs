//! Vector cache
//!
//! In-process cache for high-dimensional vectors: a recency index drives
//! LRU eviction, pinned entries are never evicted and never have their
//! recency disturbed by reads, and every mutation feeds the asynchronous
//! persistence queue. Capacity can be fixed or derived from the device
//! storage estimate.
//!
//! Eviction is triggered by total size exceeding the cap and always picks
//! the least-recently-used unpinned entry; when only pinned entries
//! remain the cache is allowed to overflow, so the unpinned population
//! never exceeds the cap.

use crate::lru::RecencyList;
use crate::persistence::{
    PersistTask, PersistedVector, PersistenceQueue, RetryQueueStats, VectorPersistence,
};
use crate::quota::{cap_from_estimate, StorageEstimator, PER_VECTOR_FALLBACK_BYTES};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use stowage_core::{StowageResult, VectorCacheConfig};
use tracing::{debug, info, warn};

/// A cached vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Embedding values
    pub vector: Vec<f32>,
    /// Opaque caller payload
    pub payload: Value,
    /// Whether the entry bypasses eviction and recency updates
    pub pinned: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    recency: RecencyList,
    pinned: HashSet<String>,
}

/// Dimension spread across cached vectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DimensionStats {
    /// Smallest vector length
    pub min: usize,
    /// Largest vector length
    pub max: usize,
    /// Mean vector length
    pub avg: f64,
}

/// Approximate memory held by cached vectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageStats {
    /// Bytes held by vector data
    pub bytes: u64,
    /// The same, in megabytes
    pub megabytes: f64,
}

/// Hit/miss and eviction accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LruStats {
    /// Reads that found an entry
    pub hits: u64,
    /// Reads that found nothing
    pub misses: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
    /// Entries evicted so far
    pub eviction_count: u64,
    /// Whether capacity tracks the storage estimate
    pub auto_scale_enabled: bool,
    /// Currently pinned entries
    pub pinned_count: usize,
}

/// Retry queue view in stats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    /// Tasks waiting to be retried
    pub size: usize,
    /// Age of the oldest stuck task, milliseconds
    pub oldest_age: u64,
    /// Retry attempts before a task is dropped
    pub max_retries: u32,
}

/// Full cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Cached entries
    pub count: usize,
    /// count / maxVectors
    pub utilization: f64,
    /// Dimension spread
    pub dimensions: DimensionStats,
    /// Approximate memory held
    pub storage: StorageStats,
    /// Hit/miss/eviction accounting
    pub lru: LruStats,
    /// Persistence retry queue
    pub retry_queue: RetryStats,
}

/// The vector cache.
pub struct VectorCache {
    config: VectorCacheConfig,
    max_vectors: AtomicUsize,
    auto_scale: AtomicBool,
    state: Mutex<CacheState>,
    queue: PersistenceQueue,
    persistence: Arc<dyn VectorPersistence>,
    estimator: Arc<dyn StorageEstimator>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl VectorCache {
    /// Create a cache over a persistence sink and a storage estimator.
    pub fn new(
        config: VectorCacheConfig,
        persistence: Arc<dyn VectorPersistence>,
        estimator: Arc<dyn StorageEstimator>,
    ) -> Self {
        let max_vectors = config.max_vectors;
        let auto_scale = config.auto_scale;
        let queue = PersistenceQueue::new(config.persist_max_retries);
        let cache = Self {
            config,
            max_vectors: AtomicUsize::new(max_vectors),
            auto_scale: AtomicBool::new(auto_scale),
            state: Mutex::new(CacheState::default()),
            queue,
            persistence,
            estimator,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        };
        if auto_scale {
            cache.apply_auto_scale();
        }
        cache
    }

    /// Load persisted vectors into the cache, up to the capacity. Returns
    /// how many were loaded.
    pub fn init(&self) -> StowageResult<usize> {
        let persisted = self.persistence.load_all()?;
        let cap = self.max_vectors();
        let mut state = self.state.lock();
        let mut loaded = 0;
        for entry in persisted {
            if loaded >= cap {
                break;
            }
            if entry.pinned {
                state.pinned.insert(entry.id.clone());
            }
            state.recency.touch(&entry.id);
            state.entries.insert(
                entry.id.clone(),
                CacheEntry {
                    vector: entry.vector,
                    payload: entry.payload,
                    pinned: entry.pinned,
                },
            );
            loaded += 1;
        }
        info!(loaded, cap, "vector cache initialized from persistence");
        Ok(loaded)
    }

    /// Current capacity.
    pub fn max_vectors(&self) -> usize {
        self.max_vectors.load(Ordering::Acquire)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an id is cached.
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    fn evict_over_cap(&self, state: &mut CacheState, protect: Option<&str>) {
        let cap = self.max_vectors();
        while state.entries.len() > cap {
            let victim = {
                let pinned = &state.pinned;
                state.recency.least_recent_where(|id| {
                    !pinned.contains(id) && Some(id) != protect
                })
            };
            match victim {
                Some(id) => {
                    state.entries.remove(&id);
                    state.recency.remove(&id);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %id, "evicted least-recent unpinned vector");
                }
                // Only pinned entries left; overflow is allowed.
                None => break,
            }
        }
    }

    fn enqueue_save(&self, id: &str, entry: &CacheEntry) {
        self.queue.enqueue(PersistTask::Save(PersistedVector {
            id: id.to_string(),
            vector: entry.vector.clone(),
            payload: entry.payload.clone(),
            pinned: entry.pinned,
        }));
    }

    /// Insert or overwrite a vector. Overwrites keep the pinned flag.
    pub fn upsert(&self, id: &str, vector: Vec<f32>, payload: Value) {
        let mut state = self.state.lock();
        let pinned = state.pinned.contains(id);
        let entry = CacheEntry {
            vector,
            payload,
            pinned,
        };
        state.entries.insert(id.to_string(), entry.clone());
        state.recency.touch(id);
        self.evict_over_cap(&mut state, Some(id));
        drop(state);
        self.enqueue_save(id, &entry);
    }

    /// Bulk upsert; one recency update per entry.
    pub fn upsert_batch(&self, items: Vec<(String, Vec<f32>, Value)>) {
        for (id, vector, payload) in items {
            self.upsert(&id, vector, payload);
        }
    }

    /// Read an entry, promoting it to most-recent unless pinned. A miss
    /// bumps the miss counter.
    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        match state.entries.get(id).cloned() {
            Some(entry) => {
                if !entry.pinned {
                    state.recency.touch(id);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remove an entry from cache and persistence; cancels any retrying
    /// persistence task for it.
    pub fn delete(&self, id: &str) {
        let mut state = self.state.lock();
        state.entries.remove(id);
        state.recency.remove(id);
        state.pinned.remove(id);
        drop(state);
        self.queue.cancel(id);
        self.queue.enqueue(PersistTask::Delete(id.to_string()));
    }

    /// Drop all cache state and the retry queue, and clear persistence.
    pub fn clear(&self) -> StowageResult<()> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
        state.pinned.clear();
        drop(state);
        self.queue.clear();
        self.persistence.clear()
    }

    /// Pin an entry. Returns whether it was found.
    pub fn pin(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(id) {
            Some(entry) => {
                entry.pinned = true;
                let entry = entry.clone();
                state.pinned.insert(id.to_string());
                drop(state);
                self.enqueue_save(id, &entry);
                true
            }
            None => false,
        }
    }

    /// Unpin an entry, making it evictable again. Returns whether it was
    /// found.
    pub fn unpin(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(id) {
            Some(entry) => {
                entry.pinned = false;
                let entry = entry.clone();
                state.pinned.remove(id);
                self.evict_over_cap(&mut state, None);
                drop(state);
                self.enqueue_save(id, &entry);
                true
            }
            None => false,
        }
    }

    /// Change the capacity, clamped to the floor. Lowering it below the
    /// current population evicts least-recent unpinned entries in batches.
    pub fn set_max_vectors(&self, max_vectors: usize) {
        let clamped = max_vectors.max(self.config.floor);
        self.max_vectors.store(clamped, Ordering::Release);
        let mut state = self.state.lock();
        self.evict_over_cap(&mut state, None);
    }

    /// Toggle auto-scaling. Enabling consults the storage estimator; on
    /// failure the current capacity is retained.
    pub fn enable_auto_scale(&self, enabled: bool) {
        self.auto_scale.store(enabled, Ordering::Release);
        if enabled {
            self.apply_auto_scale();
        }
    }

    fn apply_auto_scale(&self) {
        match self.estimator.estimate() {
            Ok(estimate) => {
                let per_vector = self.observed_per_vector_bytes();
                let cap = cap_from_estimate(estimate, per_vector, &self.config);
                info!(cap, free_bytes = estimate.free_bytes, "auto-scaled vector cache capacity");
                self.max_vectors.store(cap, Ordering::Release);
                let mut state = self.state.lock();
                self.evict_over_cap(&mut state, None);
            }
            Err(e) => {
                warn!(error = %e, "storage estimate failed; keeping current capacity");
            }
        }
    }

    fn observed_per_vector_bytes(&self) -> u64 {
        let state = self.state.lock();
        if state.entries.is_empty() {
            return PER_VECTOR_FALLBACK_BYTES;
        }
        let total_dims: usize = state.entries.values().map(|entry| entry.vector.len()).sum();
        let avg_dims = total_dims / state.entries.len();
        (avg_dims as u64) * 4 + 512
    }

    /// Drain the persistence queue through the sink. Returns tasks
    /// accepted.
    pub fn flush(&self) -> usize {
        self.queue.flush(self.persistence.as_ref())
    }

    /// Retry eligible failed persistence tasks.
    pub fn flush_retries(&self) -> usize {
        self.queue.flush_retries(self.persistence.as_ref())
    }

    /// Retry queue snapshot.
    pub fn retry_queue_stats(&self) -> RetryQueueStats {
        self.queue.retry_stats()
    }

    /// Full statistics snapshot.
    pub fn get_stats(&self) -> CacheStats {
        let state = self.state.lock();
        let count = state.entries.len();
        let dims: Vec<usize> = state.entries.values().map(|entry| entry.vector.len()).collect();
        let bytes: u64 = dims.iter().map(|len| (*len as u64) * 4).sum();
        let pinned_count = state.pinned.len();
        drop(state);

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let retry = self.queue.retry_stats();
        let max_vectors = self.max_vectors();

        CacheStats {
            count,
            utilization: if max_vectors == 0 {
                0.0
            } else {
                count as f64 / max_vectors as f64
            },
            dimensions: DimensionStats {
                min: dims.iter().copied().min().unwrap_or(0),
                max: dims.iter().copied().max().unwrap_or(0),
                avg: if dims.is_empty() {
                    0.0
                } else {
                    dims.iter().sum::<usize>() as f64 / dims.len() as f64
                },
            },
            storage: StorageStats {
                bytes,
                megabytes: bytes as f64 / (1024.0 * 1024.0),
            },
            lru: LruStats {
                hits,
                misses,
                hit_rate: if lookups == 0 {
                    0.0
                } else {
                    hits as f64 / lookups as f64
                },
                eviction_count: self.evictions.load(Ordering::Relaxed),
                auto_scale_enabled: self.auto_scale.load(Ordering::Acquire),
                pinned_count,
            },
            retry_queue: RetryStats {
                size: retry.size,
                oldest_age: retry.oldest_age_ms,
                max_retries: retry.max_retries,
            },
        }
    }
}
