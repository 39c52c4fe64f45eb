//! Engine configuration
//!
//! Plain config structs with serde support, grouped the way callers tune
//! them: connection retry, write authority, request timeouts, the WAL, and
//! the vector cache. Defaults match the documented engine behavior; override
//! individual sections when embedding.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Connection retry/backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Maximum open attempts before giving up (and falling back, if enabled)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier applied per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether the fallback backend may be activated on final failure
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            enable_fallback: true,
        }
    }
}

impl ConnectionConfig {
    /// Backoff delay before the given attempt (1-based), capped at the ceiling.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1);
        let delay = (self.base_delay_ms as f64) * self.backoff_multiplier.powi(exp as i32);
        (delay as u64).min(self.max_delay_ms)
    }
}

/// Write-authority enforcement settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorityConfig {
    /// Whether writes are gated on tab write authority at all
    #[serde(default = "default_true")]
    pub enforce_write_authority: bool,
    /// Stores exempt from the authority check (e.g. migration bookkeeping)
    #[serde(default)]
    pub exempt_stores: HashSet<String>,
    /// Strict mode surfaces denials as errors; otherwise they no-op
    #[serde(default)]
    pub strict_mode: bool,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        let mut exempt_stores = HashSet::new();
        exempt_stores.insert("migration".to_string());
        Self {
            enforce_write_authority: true,
            exempt_stores,
            strict_mode: false,
        }
    }
}

/// Per-request timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestConfig {
    /// Timeout applied to every wrapped backend request, in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Write-ahead log settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalConfig {
    /// Maximum persisted non-committed entries; newest-first trimming beyond this
    #[serde(default = "default_wal_max_size")]
    pub max_size: usize,
    /// Entries older than this are dropped at load time
    #[serde(default = "default_wal_max_age_ms")]
    pub max_age_ms: u64,
    /// Result records older than this are dropped at load time
    #[serde(default = "default_wal_results_max_age_ms")]
    pub results_max_age_ms: u64,
    /// Minimum interval between replays
    #[serde(default = "default_replay_delay_ms")]
    pub replay_delay_ms: u64,
    /// Entries drained per processing batch
    #[serde(default = "default_wal_batch_size")]
    pub batch_size: usize,
    /// Attempts before an entry becomes terminally failed
    #[serde(default = "default_wal_max_attempts")]
    pub max_attempts: u32,
}

fn default_wal_max_size() -> usize {
    100
}
fn default_wal_max_age_ms() -> u64 {
    86_400_000
}
fn default_wal_results_max_age_ms() -> u64 {
    300_000
}
fn default_replay_delay_ms() -> u64 {
    1000
}
fn default_wal_batch_size() -> usize {
    10
}
fn default_wal_max_attempts() -> u32 {
    3
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_size: default_wal_max_size(),
            max_age_ms: default_wal_max_age_ms(),
            results_max_age_ms: default_wal_results_max_age_ms(),
            replay_delay_ms: default_replay_delay_ms(),
            batch_size: default_wal_batch_size(),
            max_attempts: default_wal_max_attempts(),
        }
    }
}

/// Vector cache sizing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorCacheConfig {
    /// Cap on non-pinned cached vectors
    #[serde(default = "default_max_vectors")]
    pub max_vectors: usize,
    /// Whether the cap is derived from the device storage estimate
    #[serde(default)]
    pub auto_scale: bool,
    /// Lower clamp applied when auto-scaling
    #[serde(default = "default_min_cap")]
    pub min_cap: usize,
    /// Upper clamp applied when auto-scaling
    #[serde(default = "default_max_cap")]
    pub max_cap: usize,
    /// Absolute floor for `set_max_vectors`
    #[serde(default = "default_floor")]
    pub floor: usize,
    /// Persistence retry attempts before a task is dropped
    #[serde(default = "default_persist_max_retries")]
    pub persist_max_retries: u32,
}

fn default_max_vectors() -> usize {
    10_000
}
fn default_min_cap() -> usize {
    1_000
}
fn default_max_cap() -> usize {
    50_000
}
fn default_floor() -> usize {
    100
}
fn default_persist_max_retries() -> u32 {
    3
}

impl Default for VectorCacheConfig {
    fn default() -> Self {
        Self {
            max_vectors: default_max_vectors(),
            auto_scale: false,
            min_cap: default_min_cap(),
            max_cap: default_max_cap(),
            floor: default_floor(),
            persist_max_retries: default_persist_max_retries(),
        }
    }
}

/// Aggregate configuration for the whole engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StowageConfig {
    /// Connection retry/backoff
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Write-authority enforcement
    #[serde(default)]
    pub authority: AuthorityConfig,
    /// Request timeouts
    #[serde(default)]
    pub request: RequestConfig,
    /// Write-ahead log tuning
    #[serde(default)]
    pub wal: WalConfig,
    /// Vector cache sizing
    #[serde(default)]
    pub vector_cache: VectorCacheConfig,
}
