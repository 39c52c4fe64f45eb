//! Schema migrations
//!
//! Each step moves the database one version forward; `run_migrations`
//! applies every step between the stored version and the requested one in
//! order, inside the open's upgrade transaction. A failing step aborts the
//! whole open with the error surfaced to the caller.
//!
//! After the steps, `ensure_stores` runs as a safety net and creates any
//! store missing from the declared catalog.

use stowage_core::{StowageError, StowageResult, DECLARED_STORES};
use stowage_storage::{IndexDef, UpgradeTxn};
use tracing::{info, warn};

fn index(name: &str) -> IndexDef {
    IndexDef {
        name: name.to_string(),
        key_field: name.to_string(),
        unique: false,
    }
}

fn unique_index(name: &str) -> IndexDef {
    IndexDef {
        name: name.to_string(),
        key_field: name.to_string(),
        unique: true,
    }
}

/// Apply every migration step from the stored version up to the requested
/// version, then run the store safety net.
pub fn run_migrations(txn: &mut UpgradeTxn<'_>) -> StowageResult<()> {
    let from = txn.old_version();
    let to = txn.new_version();
    for version in (from + 1)..=to {
        apply_step(txn, version).map_err(|e| StowageError::MigrationFailed {
            version,
            reason: e.to_string(),
        })?;
        info!(version, "migration step applied");
    }
    ensure_stores(txn)?;
    Ok(())
}

fn apply_step(txn: &mut UpgradeTxn<'_>, version: u32) -> StowageResult<()> {
    match version {
        1 => {
            txn.create_store("streams", "id")?;
            txn.create_store("chunks", "id")?;
            txn.add_index("chunks", index("type"))?;
            txn.add_index("chunks", index("startDate"))?;
            txn.create_store("embeddings", "id")?;
            txn.create_store("personality", "id")?;
            txn.create_store("settings", "key")?;
        }
        2 => {
            txn.create_store("chat_sessions", "id")?;
            txn.add_index("chat_sessions", index("updatedAt"))?;
            txn.create_store("config", "key")?;
            txn.create_store("tokens", "key")?;
        }
        3 => {
            txn.create_store("migration", "id")?;
        }
        4 => {
            txn.create_store("event_log", "id")?;
            txn.add_index("event_log", unique_index("sequenceNumber"))?;
            txn.add_index("event_log", index("type"))?;
            txn.add_index("event_log", index("timestamp"))?;
            txn.create_store("event_checkpoint", "id")?;
            txn.add_index("event_checkpoint", unique_index("sequenceNumber"))?;
        }
        5 => {
            txn.create_store("demo_streams", "id")?;
            txn.add_index("demo_streams", index("timestamp"))?;
            txn.add_index("demo_streams", index("type"))?;
            txn.create_store("demo_patterns", "id")?;
            txn.add_index("demo_patterns", index("timestamp"))?;
            txn.create_store("demo_personality", "id")?;
        }
        6 => {
            txn.create_store("transaction_journal", "id")?;
            txn.add_index("transaction_journal", index("journalTime"))?;
            txn.create_store("transaction_compensation", "id")?;
            txn.add_index("transaction_compensation", index("timestamp"))?;
            txn.add_index("transaction_compensation", index("resolved"))?;
        }
        7 => {
            add_index_with_recreation(txn, "chunks", index("streamId"))?;
        }
        8 => {
            // Catalog-completeness bump; ensure_stores fills any gap.
        }
        other => {
            return Err(StowageError::InvalidOperation(format!(
                "no migration step for version {other}"
            )));
        }
    }
    Ok(())
}

/// Add an index to an existing store, recreating the store when the
/// backend refuses live index adds. Recreation is only permitted in known
/// test environments; anywhere else the original error surfaces.
fn add_index_with_recreation(
    txn: &mut UpgradeTxn<'_>,
    store: &str,
    new_index: IndexDef,
) -> StowageResult<()> {
    match txn.add_index(store, new_index.clone()) {
        Ok(()) => Ok(()),
        Err(e) if txn.allows_store_recreation() => {
            warn!(store, index = %new_index.name, error = %e, "live index add refused; recreating store");
            let records = txn.store_records(store)?;
            let spec = stowage_core::store_spec(store)
                .ok_or_else(|| StowageError::UnknownStore(store.to_string()))?;
            txn.delete_store(store)?;
            txn.create_store(store, spec.key_field)?;
            for declared in spec.indexes {
                txn.add_index(
                    store,
                    IndexDef {
                        name: declared.name.to_string(),
                        key_field: declared.key_field.to_string(),
                        unique: declared.unique,
                    },
                )?;
            }
            txn.restore_records(store, records)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Create every declared store the database is missing.
pub fn ensure_stores(txn: &mut UpgradeTxn<'_>) -> StowageResult<()> {
    for spec in DECLARED_STORES {
        if !txn.has_store(spec.name) {
            warn!(store = spec.name, "safety net creating missing store");
            txn.create_store(spec.name, spec.key_field)?;
            for declared in spec.indexes {
                txn.add_index(
                    spec.name,
                    IndexDef {
                        name: declared.name.to_string(),
                        key_field: declared.key_field.to_string(),
                        unique: declared.unique,
                    },
                )?;
            }
        }
    }
    Ok(())
}
