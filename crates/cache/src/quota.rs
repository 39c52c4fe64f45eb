//! Storage quota estimation for auto-sizing
//!
//! When auto-scaling is enabled the cache asks an estimator how much
//! storage is free and derives its capacity from that, clamped to a sane
//! range. The estimator is injected; the flagship deployment wraps the
//! platform's storage estimate API.

use stowage_core::{StowageResult, VectorCacheConfig};

/// Bytes one cached vector is assumed to occupy when the cache is empty
/// and has no observed dimensionality yet (1536 dims of f32 plus payload
/// overhead).
pub const PER_VECTOR_FALLBACK_BYTES: u64 = 6_656;

/// A device storage estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEstimate {
    /// Bytes still free for this origin
    pub free_bytes: u64,
    /// Total bytes granted to this origin
    pub total_bytes: u64,
}

/// Source of storage estimates.
pub trait StorageEstimator: Send + Sync {
    /// Ask the device how much storage is available.
    fn estimate(&self) -> StowageResult<QuotaEstimate>;
}

/// Fixed estimate, for tests and platforms without an estimate API.
pub struct FixedEstimator {
    estimate: QuotaEstimate,
}

impl FixedEstimator {
    /// Create an estimator that always reports the given numbers.
    pub fn new(free_bytes: u64, total_bytes: u64) -> Self {
        Self {
            estimate: QuotaEstimate {
                free_bytes,
                total_bytes,
            },
        }
    }
}

impl StorageEstimator for FixedEstimator {
    fn estimate(&self) -> StowageResult<QuotaEstimate> {
        Ok(self.estimate)
    }
}

/// An estimator that always fails; auto-scale keeps the current cap.
pub struct UnavailableEstimator;

impl StorageEstimator for UnavailableEstimator {
    fn estimate(&self) -> StowageResult<QuotaEstimate> {
        Err(stowage_core::StowageError::Storage(
            "storage estimate unavailable".to_string(),
        ))
    }
}

/// Derive a vector cap from an estimate, clamped to the configured range.
pub fn cap_from_estimate(
    estimate: QuotaEstimate,
    per_vector_bytes: u64,
    config: &VectorCacheConfig,
) -> usize {
    let per_vector = per_vector_bytes.max(1);
    let raw = (estimate.free_bytes / per_vector) as usize;
    raw.clamp(config.min_cap, config.max_cap)
}
