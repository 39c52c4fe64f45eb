//! Shared helpers for workspace integration tests.

use std::sync::Arc;
use stowage::{ConnectionConfig, Stowage, StowageOptions};
use stowage_storage::Environment;

/// Engine options wired to an isolated environment with fast retry
/// backoff and manual maintenance, so tests stay deterministic.
pub fn fast_options(db_name: &str) -> StowageOptions {
    let mut options = StowageOptions::new(db_name);
    options.open.env = Arc::new(Environment::new());
    options.open.config.connection = ConnectionConfig {
        base_delay_ms: 1,
        max_delay_ms: 2,
        ..ConnectionConfig::default()
    };
    options.start_maintenance = false;
    options
}

/// An opened engine on an isolated environment.
pub fn engine(db_name: &str) -> Stowage {
    Stowage::open(fast_options(db_name)).unwrap()
}
