//! Assembled engine
//!
//! `Stowage` wires the subsystems together: the keyed object store over
//! whichever backend the connection landed on, the write-ahead log with
//! the store's primitives registered as operations, the vector cache
//! persisting through the `embeddings` store, the emergency backup slot,
//! and the maintenance scheduler driving deferred work.

use crate::backup::EmergencyBackupSlot;
use crate::connection::{open_with_retry, OpenOptions};
use crate::kos::{ObjectStore, PutOptions};
use crate::scheduler::{MaintenanceScheduler, MaintenanceTask};
use serde_json::Value;
use std::sync::Arc;
use stowage_cache::{
    FixedEstimator, PersistedVector, StorageEstimator, VectorCache, VectorPersistence,
};
use stowage_core::{EventBus, StowageError, StowageResult};
use stowage_durability::{AlwaysMet, Precondition, QueuedWrite, WalPriority, WriteAheadLog};
use std::time::Duration;
use tracing::{info, warn};

/// Store the vector cache persists through.
const EMBEDDINGS_STORE: &str = "embeddings";

/// Default maintenance tick.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

/// Options for assembling the engine.
pub struct StowageOptions {
    /// Connection options
    pub open: OpenOptions,
    /// The WAL precondition gate
    pub precondition: Arc<dyn Precondition>,
    /// Storage estimator for cache auto-sizing
    pub estimator: Arc<dyn StorageEstimator>,
    /// Start the background maintenance thread (tests drive manually)
    pub start_maintenance: bool,
}

impl StowageOptions {
    /// Defaults: gate always open, a generous fixed storage estimate, and
    /// background maintenance on.
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            open: OpenOptions::new(db_name),
            precondition: Arc::new(AlwaysMet),
            estimator: Arc::new(FixedEstimator::new(
                8 * 1024 * 1024 * 1024,
                64 * 1024 * 1024 * 1024,
            )),
            start_maintenance: true,
        }
    }
}

/// The assembled storage engine.
pub struct Stowage {
    store: Arc<ObjectStore>,
    wal: Arc<WriteAheadLog>,
    vectors: Arc<VectorCache>,
    backup: EmergencyBackupSlot,
    scheduler: MaintenanceScheduler,
    bus: EventBus,
}

impl Stowage {
    /// Open the engine: connect (with retry and fallback), register the
    /// store primitives as WAL operations, replay the WAL, and wire the
    /// vector cache and the emergency backup slot.
    pub fn open(options: StowageOptions) -> StowageResult<Self> {
        let store = Arc::new(open_with_retry(&options.open)?);

        let wal = WriteAheadLog::new(
            Arc::clone(&options.open.kv),
            options.open.config.wal.clone(),
            options.open.bus.clone(),
            Arc::clone(&options.open.coordinator),
            Arc::clone(&options.precondition),
        );
        register_store_operations(&wal, &store)?;

        let persistence: Arc<dyn VectorPersistence> = Arc::new(StorePersistence {
            store: Arc::clone(&store),
        });
        let vectors = Arc::new(VectorCache::new(
            options.open.config.vector_cache.clone(),
            persistence,
            Arc::clone(&options.estimator),
        ));

        let backup = EmergencyBackupSlot::new(
            Arc::clone(&options.open.kv),
            Arc::clone(&options.open.coordinator),
        );

        // Crash recovery before anything else enqueues.
        if let Err(e) = wal.replay_wal() {
            warn!(error = %e, "WAL replay failed during open");
        }

        let tasks = maintenance_tasks(&wal, &vectors);
        let scheduler = if options.start_maintenance {
            MaintenanceScheduler::start(MAINTENANCE_INTERVAL, tasks)
        } else {
            MaintenanceScheduler::manual(tasks)
        };

        info!(fallback = store.is_fallback(), "stowage engine opened");
        Ok(Self {
            store,
            wal,
            vectors,
            backup,
            scheduler,
            bus: options.open.bus.clone(),
        })
    }

    /// The keyed object store.
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// The write-ahead log.
    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    /// The vector cache.
    pub fn vectors(&self) -> &Arc<VectorCache> {
        &self.vectors
    }

    /// The emergency backup slot.
    pub fn backup(&self) -> &EmergencyBackupSlot {
        &self.backup
    }

    /// The lifecycle event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Queue a write through the WAL (direct when the gate is open).
    pub fn queue_write(
        &self,
        operation: &str,
        args: Vec<Value>,
        priority: WalPriority,
    ) -> StowageResult<QueuedWrite> {
        self.wal.queue_write(operation, args, priority)
    }

    /// Drive one maintenance pass on the calling thread.
    pub fn run_maintenance(&self) {
        self.scheduler.run_once();
    }

    /// Shut down maintenance and close the connection.
    pub fn close(&self) {
        self.scheduler.shutdown();
        self.vectors.flush();
        self.store.close();
    }
}

fn maintenance_tasks(wal: &Arc<WriteAheadLog>, vectors: &Arc<VectorCache>) -> Vec<MaintenanceTask> {
    let wal_task = Arc::clone(wal);
    let flush_task = Arc::clone(vectors);
    let retry_task = Arc::clone(vectors);
    vec![
        MaintenanceTask {
            name: "wal-run-due",
            run: Box::new(move || {
                if let Err(e) = wal_task.run_due() {
                    warn!(error = %e, "scheduled WAL processing failed");
                }
            }),
        },
        MaintenanceTask {
            name: "vector-flush",
            run: Box::new(move || {
                flush_task.flush();
            }),
        },
        MaintenanceTask {
            name: "vector-flush-retries",
            run: Box::new(move || {
                retry_task.flush_retries();
            }),
        },
    ]
}

fn arg_str(args: &[Value], index: usize, operation: &str) -> StowageResult<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            StowageError::InvalidOperation(format!(
                "operation '{operation}' missing string argument {index}"
            ))
        })
}

fn arg_value(args: &[Value], index: usize, operation: &str) -> StowageResult<Value> {
    args.get(index).cloned().ok_or_else(|| {
        StowageError::InvalidOperation(format!(
            "operation '{operation}' missing argument {index}"
        ))
    })
}

/// Register the store primitives as WAL operations. Replayed writes
/// bypass the authority check: only the primary tab drains, and the drain
/// itself is the authority gate.
fn register_store_operations(
    wal: &Arc<WriteAheadLog>,
    store: &Arc<ObjectStore>,
) -> StowageResult<()> {
    let put_store = Arc::clone(store);
    wal.register_operation(
        "put",
        true,
        false,
        Arc::new(move |args| {
            let store_name = arg_str(args, 0, "put")?;
            let record = arg_value(args, 1, "put")?;
            let key = put_store.put(
                &store_name,
                record,
                PutOptions {
                    bypass_authority: true,
                    skip_write_epoch: false,
                },
            )?;
            Ok(Value::String(key))
        }),
    )?;

    let add_store = Arc::clone(store);
    wal.register_operation(
        "add",
        false,
        false,
        Arc::new(move |args| {
            let store_name = arg_str(args, 0, "add")?;
            let record = arg_value(args, 1, "add")?;
            let key_field = stowage_core::store_spec(&store_name)
                .map(|spec| spec.key_field)
                .unwrap_or("id");
            let key = stowage_core::extract_key(&record, key_field).ok_or_else(|| {
                StowageError::MissingKey {
                    store: store_name.clone(),
                    key_field: key_field.to_string(),
                }
            })?;
            if add_store.get(&store_name, &key)?.is_some() {
                return Err(StowageError::ConstraintViolation {
                    store: store_name,
                    key,
                });
            }
            let key = add_store.put(
                &store_name,
                record,
                PutOptions {
                    bypass_authority: true,
                    skip_write_epoch: false,
                },
            )?;
            Ok(Value::String(key))
        }),
    )?;

    let delete_store = Arc::clone(store);
    wal.register_operation(
        "delete",
        true,
        false,
        Arc::new(move |args| {
            let store_name = arg_str(args, 0, "delete")?;
            let key = arg_str(args, 1, "delete")?;
            delete_store.delete(&store_name, &key)?;
            Ok(Value::Null)
        }),
    )?;

    let clear_store = Arc::clone(store);
    wal.register_operation(
        "clear",
        true,
        false,
        Arc::new(move |args| {
            let store_name = arg_str(args, 0, "clear")?;
            clear_store.clear(&store_name)?;
            Ok(Value::Null)
        }),
    )?;

    Ok(())
}

/// Vector persistence through the `embeddings` store.
struct StorePersistence {
    store: Arc<ObjectStore>,
}

impl VectorPersistence for StorePersistence {
    fn save(&self, entry: &PersistedVector) -> StowageResult<()> {
        let record = serde_json::json!({
            "id": entry.id,
            "vector": entry.vector,
            "payload": entry.payload,
            "pinned": entry.pinned,
        });
        self.store.put(
            EMBEDDINGS_STORE,
            record,
            PutOptions {
                bypass_authority: true,
                skip_write_epoch: true,
            },
        )?;
        Ok(())
    }

    fn delete(&self, id: &str) -> StowageResult<()> {
        self.store.delete(EMBEDDINGS_STORE, id)
    }

    fn load_all(&self) -> StowageResult<Vec<PersistedVector>> {
        let records = self.store.get_all(EMBEDDINGS_STORE)?;
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let id = record.get("id")?.as_str()?.to_string();
                let vector = record
                    .get("vector")?
                    .as_array()?
                    .iter()
                    .map(|v| v.as_f64().map(|f| f as f32))
                    .collect::<Option<Vec<f32>>>()?;
                Some(PersistedVector {
                    id,
                    vector,
                    payload: record.get("payload").cloned().unwrap_or(Value::Null),
                    pinned: record
                        .get("pinned")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
            })
            .collect())
    }

    fn clear(&self) -> StowageResult<()> {
        self.store.clear(EMBEDDINGS_STORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stowage_core::ConnectionConfig;
    use stowage_durability::TogglePrecondition;
    use stowage_storage::Environment;

    fn engine_options(db_name: &str) -> StowageOptions {
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

    #[test]
    fn test_open_assembles_primary_engine() {
        let engine = Stowage::open(engine_options("db")).unwrap();
        assert!(!engine.store().is_fallback());
        engine.close();
    }

    #[test]
    fn test_queue_write_direct_applies_to_store() {
        let engine = Stowage::open(engine_options("db")).unwrap();
        let queued = engine
            .queue_write(
                "put",
                vec![json!("streams"), json!({"id": "s1", "n": 1})],
                WalPriority::Normal,
            )
            .unwrap();
        assert!(!queued.deferred);
        let record = engine.store().get("streams", "s1").unwrap().unwrap();
        assert_eq!(record["n"], json!(1));
        // Records written through the WAL carry the reserved stamps
        assert!(record.get("writeEpoch").is_some());
        engine.close();
    }

    #[test]
    fn test_deferred_write_applies_after_gate_opens() {
        let gate = Arc::new(TogglePrecondition::new(false));
        let mut options = engine_options("db");
        options.precondition = Arc::clone(&gate) as Arc<dyn Precondition>;
        let engine = Stowage::open(options).unwrap();

        let queued = engine
            .queue_write(
                "put",
                vec![json!("streams"), json!({"id": "s1"})],
                WalPriority::High,
            )
            .unwrap();
        assert!(queued.deferred);
        assert!(engine.store().get("streams", "s1").unwrap().is_none());

        gate.set(true);
        engine.run_maintenance();
        assert!(engine.store().get("streams", "s1").unwrap().is_some());
        engine.close();
    }

    #[test]
    fn test_vectors_persist_through_embeddings_store() {
        let env = Arc::new(Environment::new());
        let kv = Arc::new(stowage_storage::KvSurface::memory());
        {
            let mut options = engine_options("db");
            options.open.env = Arc::clone(&env);
            options.open.kv = Arc::clone(&kv);
            let engine = Stowage::open(options).unwrap();
            engine.vectors().upsert("v1", vec![0.1, 0.2], json!({"tag": "a"}));
            engine.vectors().flush();
            assert_eq!(engine.store().count(EMBEDDINGS_STORE).unwrap(), 1);
            engine.close();
        }
        // A second engine over the same environment reloads the vectors.
        let mut options = engine_options("db");
        options.open.env = env;
        options.open.kv = kv;
        let engine = Stowage::open(options).unwrap();
        assert_eq!(engine.vectors().init().unwrap(), 1);
        let entry = engine.vectors().get("v1").unwrap();
        assert_eq!(entry.vector, vec![0.1, 0.2]);
        engine.close();
    }

    #[test]
    fn test_add_rejects_duplicate_live_but_replays_idempotently() {
        let engine = Stowage::open(engine_options("db")).unwrap();
        engine
            .queue_write(
                "add",
                vec![json!("streams"), json!({"id": "s1"})],
                WalPriority::Normal,
            )
            .unwrap()
            .handle
            .wait(Duration::from_millis(100))
            .unwrap();

        // A live duplicate add fails with a constraint violation.
        let queued = engine
            .queue_write(
                "add",
                vec![json!("streams"), json!({"id": "s1"})],
                WalPriority::Normal,
            )
            .unwrap();
        assert!(queued.handle.wait(Duration::from_millis(100)).is_err());
        engine.close();
    }
}
