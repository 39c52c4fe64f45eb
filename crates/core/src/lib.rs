//! Core types and traits for stowage
//!
//! This crate defines the foundations used throughout the system:
//! - StowageError: unified error type hierarchy
//! - StowageConfig: the engine configuration surface
//! - EventBus / Topic: lifecycle pub/sub over a closed topic set
//! - TabCoordinator: injected view of multi-tab write authority
//! - Record helpers: key extraction, reserved-field stamping, index ordering
//! - Store catalog: declared stores, key fields, and indexes
//! - TimerToken: cancellable deadlines

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod timer;
pub mod value;

// Re-export commonly used types
pub use catalog::{
    is_list_style, store_spec, IndexSpec, StoreSpec, CURRENT_SCHEMA_VERSION, DECLARED_STORES,
    LIST_STYLE_STORES,
};
pub use config::{
    AuthorityConfig, ConnectionConfig, RequestConfig, StowageConfig, VectorCacheConfig, WalConfig,
};
pub use coordinator::{AuthorityListener, SharedCoordinator, TabCoordinator};
pub use error::{StowageError, StowageResult};
pub use events::{EventBus, Subscription, Topic};
pub use timer::TimerToken;
pub use value::{
    compare_index_values, deep_clone, extract_key, now_ms, stamp_record, write_epoch,
    SORTABLE_ATTRIBUTES, WRITER_ID_FIELD, WRITE_EPOCH_FIELD,
};
