//! Error types for the stowage engine
//!
//! This module defines the unified error type used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Error Categories
//!
//! - **Authority**: write attempted without tab write authority
//! - **Timeout**: a wrapped request exceeded its deadline and the owning
//!   transaction was aborted
//! - **Transaction**: backend-level aborts and fallback rollback failures
//! - **Quota**: the persistent key/value surface ran out of space
//! - **Schema**: version upgrades blocked or applied by another tab
//! - **Storage**: low-level backend failures

use std::io;
use thiserror::Error;

/// Result type alias for stowage operations
pub type StowageResult<T> = std::result::Result<T, StowageError>;

/// Unified error type for the stowage engine
#[derive(Debug, Error)]
pub enum StowageError {
    /// Write attempted without write authority (strict mode only)
    #[error("write authority denied for store '{store}'")]
    WriteAuthorityDenied {
        /// Store the write targeted
        store: String,
    },

    /// Request did not complete within its timeout; transaction aborted
    #[error("request timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Backend aborted the transaction (version change, constraint, engine abort)
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    /// Write failed because the storage quota is exhausted
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Fallback transactional rollback failed after an operation error.
    /// Carries both the original error and the rollback error.
    #[error("rollback failed: original error: {original}; rollback error: {rollback}")]
    RollbackFailed {
        /// The error that triggered the rollback
        original: String,
        /// The error raised while rolling back
        rollback: String,
    },

    /// Unique-index duplicate
    #[error("constraint violation on store '{store}': duplicate key '{key}'")]
    ConstraintViolation {
        /// Store holding the violated index
        store: String,
        /// Offending key
        key: String,
    },

    /// Schema upgrade blocked by other open handles
    #[error("version upgrade to {requested} blocked by other open connections")]
    VersionBlocked {
        /// The version the open requested
        requested: u32,
    },

    /// Schema upgrade applied by another tab; the local handle must close
    #[error("database version changed by another connection")]
    VersionChange,

    /// Worker pool terminated while a request was in flight
    #[error("worker pool terminated: {0}")]
    PoolTerminated(String),

    /// WAL replay did not complete within the bounded wait window
    #[error("replay did not complete within {waited_ms}ms")]
    ReplayTimeout {
        /// How long the waiter blocked before giving up
        waited_ms: u64,
    },

    /// Primary backend is unavailable (probe failed or open rejected)
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Requested store does not exist
    #[error("unknown store: {0}")]
    UnknownStore(String),

    /// Record is missing its key field or the key field is not a string
    #[error("record has no usable key for store '{store}' (key field '{key_field}')")]
    MissingKey {
        /// Store the record was written to
        store: String,
        /// The store's declared key field
        key_field: String,
    },

    /// Invalid operation or state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A migration step failed; the open is aborted
    #[error("migration to version {version} failed: {reason}")]
    MigrationFailed {
        /// Target version of the failing step
        version: u32,
        /// Why the step failed
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Low-level storage failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for StowageError {
    fn from(e: serde_json::Error) -> Self {
        StowageError::Serialization(e.to_string())
    }
}

impl StowageError {
    /// Check if this error is a quota failure
    ///
    /// Used by the fallback backend to decide on a memory-mode downgrade.
    pub fn is_quota(&self) -> bool {
        matches!(self, StowageError::QuotaExceeded(_))
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, StowageError::Timeout { .. })
    }

    /// Check if this error is transient and worth retrying
    ///
    /// Connection retry and WAL re-processing only retry these.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StowageError::Unavailable(_)
                | StowageError::Timeout { .. }
                | StowageError::TransactionAborted(_)
        )
    }

    /// Check if this error means the local handle must be closed and reopened
    pub fn is_version_event(&self) -> bool {
        matches!(
            self,
            StowageError::VersionBlocked { .. } | StowageError::VersionChange
        )
    }
}
