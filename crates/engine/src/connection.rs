//! Connection lifecycle
//!
//! `open` makes a single attempt against the primary backend, running
//! migrations if the schema is behind. `open_with_retry` wraps it in
//! exponential backoff and, when every attempt fails, activates the
//! fallback backend instead of failing the caller.
//!
//! A version-change notification from another connection closes the local
//! handle and invokes the caller's callback; a blocked upgrade publishes
//! `storage:connection_blocked`.

use crate::kos::{Backend, ObjectStore};
use crate::migrations::run_migrations;
use parking_lot::Mutex;
use std::sync::Arc;
use stowage_core::{
    EventBus, SharedCoordinator, StowageConfig, StowageError, StowageResult, TabCoordinator,
    Topic, CURRENT_SCHEMA_VERSION,
};
use stowage_storage::{DbHandle, Environment, FallbackBackend, KvSurface, VersionChangeCallback};
use tracing::{info, warn};

/// Everything an open needs.
pub struct OpenOptions {
    /// Database name in the environment
    pub db_name: String,
    /// Engine configuration
    pub config: StowageConfig,
    /// Backend environment; defaults to the process-wide one
    pub env: Arc<Environment>,
    /// Key/value surface for the fallback backend, the WAL, and backups
    pub kv: Arc<KvSurface>,
    /// Lifecycle event bus
    pub bus: EventBus,
    /// Tab coordinator
    pub coordinator: Arc<dyn TabCoordinator>,
    /// Stable writer id for epoch stamping
    pub writer_id: String,
    /// Invoked after the local handle closes on a version change
    pub on_version_change: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl OpenOptions {
    /// Defaults: global environment, volatile key/value surface, a fresh
    /// bus, a primary single-tab coordinator, and a random writer id.
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            config: StowageConfig::default(),
            env: Environment::global(),
            kv: Arc::new(KvSurface::memory()),
            bus: EventBus::new(),
            coordinator: SharedCoordinator::new(true),
            writer_id: uuid::Uuid::new_v4().to_string(),
            on_version_change: None,
        }
    }
}

/// One open attempt against the primary backend.
pub fn open(options: &OpenOptions) -> StowageResult<ObjectStore> {
    let holder: Arc<Mutex<Option<Arc<DbHandle>>>> = Arc::new(Mutex::new(None));
    let callback_holder = Arc::clone(&holder);
    let user_callback = options.on_version_change.clone();
    let bus = options.bus.clone();
    let callback: VersionChangeCallback = Arc::new(move || {
        if let Some(handle) = callback_holder.lock().take() {
            warn!("version change from another connection; closing local handle");
            handle.close();
        }
        bus.emit(Topic::StorageError, serde_json::json!({
            "operation": "open",
            "error": StowageError::VersionChange.to_string(),
        }));
        if let Some(callback) = &user_callback {
            callback();
        }
    });

    let handle = options.env.open(
        &options.db_name,
        CURRENT_SCHEMA_VERSION,
        run_migrations,
        Some(callback),
    )?;
    let handle = Arc::new(handle);
    *holder.lock() = Some(Arc::clone(&handle));

    info!(db = %options.db_name, version = CURRENT_SCHEMA_VERSION, "connection established");
    options.bus.emit(
        Topic::ConnectionEstablished,
        serde_json::json!({
            "db": options.db_name,
            "version": CURRENT_SCHEMA_VERSION,
        }),
    );
    Ok(ObjectStore::assemble(Backend::Primary(handle), options))
}

/// Open with retry/backoff, falling back when the primary stays down.
pub fn open_with_retry(options: &OpenOptions) -> StowageResult<ObjectStore> {
    let connection = &options.config.connection;
    let mut last_error: Option<StowageError> = None;

    for attempt in 1..=connection.max_retries {
        match open(options) {
            Ok(store) => return Ok(store),
            Err(e) => {
                if matches!(e, StowageError::VersionBlocked { .. }) {
                    options.bus.emit(
                        Topic::ConnectionBlocked,
                        serde_json::json!({
                            "db": options.db_name,
                            "requestedVersion": CURRENT_SCHEMA_VERSION,
                        }),
                    );
                }
                let delay_ms = connection.delay_for_attempt(attempt);
                warn!(attempt, delay_ms, error = %e, "open attempt failed");
                options.bus.emit(
                    Topic::ConnectionRetry,
                    serde_json::json!({
                        "attempt": attempt,
                        "maxRetries": connection.max_retries,
                        "delayMs": delay_ms,
                        "error": e.to_string(),
                    }),
                );
                last_error = Some(e);
                if attempt < connection.max_retries {
                    std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                }
            }
        }
    }

    let error_text = last_error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    options.bus.emit(
        Topic::ConnectionFailed,
        serde_json::json!({"db": options.db_name, "error": error_text}),
    );

    if !connection.enable_fallback {
        return Err(last_error.unwrap_or_else(|| {
            StowageError::Unavailable("connection failed with no recorded error".to_string())
        }));
    }

    warn!(db = %options.db_name, "all open attempts failed; activating fallback backend");
    options.bus.emit(
        Topic::FallbackActivated,
        serde_json::json!({"db": options.db_name, "reason": error_text}),
    );
    let fallback = FallbackBackend::init(&options.env, Arc::clone(&options.kv), options.bus.clone());
    Ok(ObjectStore::assemble(
        Backend::Fallback(Arc::new(fallback)),
        options,
    ))
}
