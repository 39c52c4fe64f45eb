//! Fallback backend
//!
//! When the primary object-store backend is unavailable, reads and writes
//! fall through to this surface: a namespaced slice of the key/value
//! surface when it round-trips, a volatile in-memory map otherwise.
//!
//! List-style stores (streams, chunks, embeddings) serialize as one
//! namespaced key holding an array of `{id, data, savedAt}` rows;
//! map-style stores serialize as one namespaced key holding a
//! `recordKey -> record` object.
//!
//! Quota behavior:
//! - quota exhaustion during a put silently downgrades the backend to
//!   memory mode for subsequent writes and publishes a one-time warning;
//! - quota exhaustion during a delete restores the pre-delete state from a
//!   clone and rethrows, so no partial deletion is ever visible.

use crate::env::Environment;
use crate::kv::KvSurface;
use crate::store::Direction;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stowage_core::{
    compare_index_values, is_list_style, now_ms, store_spec, EventBus, StowageError,
    StowageResult, Topic, SORTABLE_ATTRIBUTES,
};
use tracing::{info, warn};

/// Key prefix for every fallback entry on the key/value surface.
pub const FALLBACK_NAMESPACE: &str = "stowage_fb_";

/// Active fallback mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    /// Backed by the persistent key/value surface
    PersistentKv,
    /// Volatile in-memory maps
    Memory,
}

impl FallbackMode {
    /// Wire name used in event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackMode::PersistentKv => "persistent-kv",
            FallbackMode::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ListRow {
    id: String,
    data: Value,
    #[serde(rename = "savedAt")]
    saved_at: u64,
}

#[derive(Debug, Clone)]
enum StoreData {
    List(Vec<ListRow>),
    Map(BTreeMap<String, Value>),
}

impl StoreData {
    fn empty_for(store: &str) -> Self {
        if is_list_style(store) {
            StoreData::List(Vec::new())
        } else {
            StoreData::Map(BTreeMap::new())
        }
    }

    fn parse(store: &str, raw: &str) -> Self {
        if is_list_style(store) {
            serde_json::from_str(raw)
                .map(StoreData::List)
                .unwrap_or_else(|_| StoreData::empty_for(store))
        } else {
            serde_json::from_str(raw)
                .map(StoreData::Map)
                .unwrap_or_else(|_| StoreData::empty_for(store))
        }
    }

    fn serialize(&self) -> StowageResult<String> {
        let raw = match self {
            StoreData::List(rows) => serde_json::to_string(rows)?,
            StoreData::Map(map) => serde_json::to_string(map)?,
        };
        Ok(raw)
    }

    fn count(&self) -> usize {
        match self {
            StoreData::List(rows) => rows.len(),
            StoreData::Map(map) => map.len(),
        }
    }
}

fn key_field_for(store: &str) -> &'static str {
    store_spec(store).map(|spec| spec.key_field).unwrap_or("id")
}

/// Persistent-or-memory key/value surface standing in for the primary
/// backend.
pub struct FallbackBackend {
    kv: Arc<KvSurface>,
    mode: Mutex<FallbackMode>,
    cache: Mutex<HashMap<String, StoreData>>,
    bus: EventBus,
    primary_available: bool,
    quota_warned: AtomicBool,
    txn_lock: Mutex<()>,
}

impl FallbackBackend {
    /// Probe the environment and the key/value surface, pick a mode, and
    /// publish `storage:fallback_active`.
    pub fn init(env: &Arc<Environment>, kv: Arc<KvSurface>, bus: EventBus) -> Self {
        let primary_available = env.probe_available();
        let kv_usable = kv.probe_round_trip();
        let mode = if kv_usable {
            FallbackMode::PersistentKv
        } else {
            FallbackMode::Memory
        };
        // A dead persistent surface alongside a dead primary is the
        // signature of private browsing.
        let is_private = !kv_usable && !primary_available;
        info!(mode = mode.as_str(), is_private, "fallback backend active");
        bus.emit(
            Topic::FallbackActive,
            serde_json::json!({
                "mode": mode.as_str(),
                "isPrivate": is_private,
                "message": match mode {
                    FallbackMode::PersistentKv =>
                        "Storage is degraded; data is being kept in a simplified persistent area.",
                    FallbackMode::Memory =>
                        "Storage is unavailable; data is being kept in memory and will not survive a reload.",
                },
            }),
        );
        Self {
            kv,
            mode: Mutex::new(mode),
            cache: Mutex::new(HashMap::new()),
            bus,
            primary_available,
            quota_warned: AtomicBool::new(false),
            txn_lock: Mutex::new(()),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> FallbackMode {
        *self.mode.lock()
    }

    /// Whether the primary backend answered the init probe.
    pub fn primary_available(&self) -> bool {
        self.primary_available
    }

    /// Serialize fallback transactions; the engine holds this guard for
    /// the duration of a fallback transaction.
    pub fn transaction_guard(&self) -> MutexGuard<'_, ()> {
        self.txn_lock.lock()
    }

    fn namespaced(store: &str) -> String {
        format!("{FALLBACK_NAMESPACE}{store}")
    }

    fn load(&self, cache: &mut HashMap<String, StoreData>, store: &str) -> StoreData {
        if let Some(data) = cache.get(store) {
            return data.clone();
        }
        let data = if *self.mode.lock() == FallbackMode::PersistentKv {
            match self.kv.get(&Self::namespaced(store)) {
                Some(raw) => StoreData::parse(store, &raw),
                None => StoreData::empty_for(store),
            }
        } else {
            StoreData::empty_for(store)
        };
        cache.insert(store.to_string(), data.clone());
        data
    }

    fn persist(&self, store: &str, data: &StoreData) -> StowageResult<()> {
        if *self.mode.lock() == FallbackMode::Memory {
            return Ok(());
        }
        self.kv.set(&Self::namespaced(store), &data.serialize()?)
    }

    /// Pull every persisted store into the cache, making it authoritative
    /// before a downgrade to memory mode.
    fn absorb_persistent_state(&self, cache: &mut HashMap<String, StoreData>) {
        for key in self.kv.keys_with_prefix(FALLBACK_NAMESPACE) {
            let store = key[FALLBACK_NAMESPACE.len()..].to_string();
            if !cache.contains_key(&store) {
                if let Some(raw) = self.kv.get(&key) {
                    cache.insert(store.clone(), StoreData::parse(&store, &raw));
                }
            }
        }
    }

    fn downgrade_to_memory(&self, cache: &mut HashMap<String, StoreData>) {
        self.absorb_persistent_state(cache);
        *self.mode.lock() = FallbackMode::Memory;
        if !self.quota_warned.swap(true, Ordering::AcqRel) {
            warn!("storage quota exceeded; fallback downgraded to memory mode");
            self.bus.emit(
                Topic::FallbackWarning,
                serde_json::json!({
                    "reason": "quota_exceeded",
                    "message": "Storage is full; new data is being kept in memory only.",
                }),
            );
        }
    }

    /// Insert or replace a record; returns the record key.
    pub fn put(&self, store: &str, record: Value) -> StowageResult<String> {
        let key_field = key_field_for(store);
        let key = stowage_core::extract_key(&record, key_field).ok_or_else(|| {
            StowageError::MissingKey {
                store: store.to_string(),
                key_field: key_field.to_string(),
            }
        })?;

        let mut cache = self.cache.lock();
        let mut data = self.load(&mut cache, store);
        match &mut data {
            StoreData::List(rows) => {
                let row = ListRow {
                    id: key.clone(),
                    data: record,
                    saved_at: now_ms(),
                };
                match rows.iter_mut().find(|existing| existing.id == key) {
                    Some(existing) => *existing = row,
                    None => rows.push(row),
                }
            }
            StoreData::Map(map) => {
                map.insert(key.clone(), record);
            }
        }

        match self.persist(store, &data) {
            Ok(()) => {}
            Err(e) if e.is_quota() => {
                cache.insert(store.to_string(), data);
                self.downgrade_to_memory(&mut cache);
                return Ok(key);
            }
            Err(e) => return Err(e),
        }
        cache.insert(store.to_string(), data);
        Ok(key)
    }

    /// Read a record by key.
    pub fn get(&self, store: &str, key: &str) -> Option<Value> {
        let mut cache = self.cache.lock();
        match self.load(&mut cache, store) {
            StoreData::List(rows) => rows
                .into_iter()
                .find(|row| row.id == key)
                .map(|row| row.data),
            StoreData::Map(map) => map.get(key).cloned(),
        }
    }

    /// Read all records.
    pub fn get_all(&self, store: &str) -> Vec<Value> {
        let mut cache = self.cache.lock();
        match self.load(&mut cache, store) {
            StoreData::List(rows) => rows.into_iter().map(|row| row.data).collect(),
            StoreData::Map(map) => map.into_values().collect(),
        }
    }

    /// Read all records sorted in memory by a whitelisted attribute.
    pub fn get_all_sorted(
        &self,
        store: &str,
        attribute: &str,
        direction: Direction,
    ) -> StowageResult<Vec<Value>> {
        if !SORTABLE_ATTRIBUTES.contains(&attribute) {
            return Err(StowageError::InvalidOperation(format!(
                "attribute '{attribute}' is not sortable in fallback mode"
            )));
        }
        let mut records = self.get_all(store);
        records.sort_by(|a, b| {
            let null = Value::Null;
            compare_index_values(
                a.get(attribute).unwrap_or(&null),
                b.get(attribute).unwrap_or(&null),
            )
        });
        if direction == Direction::Descending {
            records.reverse();
        }
        Ok(records)
    }

    /// Delete a record by key.
    ///
    /// On a persist failure the pre-delete state is restored from a clone
    /// and the error rethrown; no partial deletion is visible.
    pub fn delete(&self, store: &str, key: &str) -> StowageResult<()> {
        let mut cache = self.cache.lock();
        let before = self.load(&mut cache, store);
        let mut data = before.clone();
        let removed = match &mut data {
            StoreData::List(rows) => {
                let len = rows.len();
                rows.retain(|row| row.id != key);
                rows.len() != len
            }
            StoreData::Map(map) => map.remove(key).is_some(),
        };
        if !removed {
            return Ok(());
        }
        match self.persist(store, &data) {
            Ok(()) => {
                cache.insert(store.to_string(), data);
                Ok(())
            }
            Err(e) => {
                cache.insert(store.to_string(), before);
                Err(e)
            }
        }
    }

    /// Remove every record in a store.
    pub fn clear(&self, store: &str) -> StowageResult<()> {
        let mut cache = self.cache.lock();
        let data = StoreData::empty_for(store);
        if *self.mode.lock() == FallbackMode::PersistentKv {
            self.kv.remove(&Self::namespaced(store))?;
        }
        cache.insert(store.to_string(), data);
        Ok(())
    }

    /// Count records in a store.
    pub fn count(&self, store: &str) -> usize {
        let mut cache = self.cache.lock();
        self.load(&mut cache, store).count()
    }

    /// Remove every namespaced entry. Keys are enumerated into a snapshot
    /// before any removal.
    pub fn clear_all(&self) -> StowageResult<()> {
        let mut cache = self.cache.lock();
        cache.clear();
        self.kv.remove_prefix(FALLBACK_NAMESPACE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn memory_backend() -> FallbackBackend {
        let env = Arc::new(Environment::new());
        FallbackBackend::init(&env, Arc::new(KvSurface::memory()), EventBus::new())
    }

    fn file_backend(dir: &TempDir, quota: Option<usize>) -> FallbackBackend {
        let env = Arc::new(Environment::new());
        let kv = Arc::new(KvSurface::open_file(dir.path().join("fb.json"), quota).unwrap());
        FallbackBackend::init(&env, kv, EventBus::new())
    }

    #[test]
    fn test_init_picks_persistent_when_round_trip_works() {
        let backend = memory_backend();
        assert_eq!(backend.mode(), FallbackMode::PersistentKv);
    }

    #[test]
    fn test_init_picks_memory_when_surface_unusable() {
        let dir = TempDir::new().unwrap();
        let backend = file_backend(&dir, Some(0));
        assert_eq!(backend.mode(), FallbackMode::Memory);
    }

    #[test]
    fn test_init_publishes_fallback_active() {
        let env = Arc::new(Environment::new());
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = bus.on(Topic::FallbackActive, move |payload| {
            seen_clone.lock().push(payload.clone());
        });
        let _backend = FallbackBackend::init(&env, Arc::new(KvSurface::memory()), bus);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["mode"], json!("persistent-kv"));
    }

    #[test]
    fn test_map_style_put_get_delete() {
        let backend = memory_backend();
        backend
            .put("settings", json!({"key": "theme", "value": "dark"}))
            .unwrap();
        assert_eq!(
            backend.get("settings", "theme").unwrap()["value"],
            json!("dark")
        );
        backend.delete("settings", "theme").unwrap();
        assert!(backend.get("settings", "theme").is_none());
    }

    #[test]
    fn test_list_style_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        {
            let backend = file_backend(&dir, None);
            backend.put("streams", json!({"id": "s1", "n": 1})).unwrap();
            backend.put("streams", json!({"id": "s2", "n": 2})).unwrap();
            // overwrite s1
            backend.put("streams", json!({"id": "s1", "n": 3})).unwrap();
        }
        let backend = file_backend(&dir, None);
        assert_eq!(backend.count("streams"), 2);
        assert_eq!(backend.get("streams", "s1").unwrap()["n"], json!(3));
    }

    #[test]
    fn test_list_style_wraps_rows() {
        let dir = TempDir::new().unwrap();
        let backend = file_backend(&dir, None);
        backend.put("streams", json!({"id": "s1"})).unwrap();
        let raw = backend.kv.get("stowage_fb_streams").unwrap();
        let rows: Vec<Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(rows[0]["id"], json!("s1"));
        assert!(rows[0]["savedAt"].is_u64());
        assert_eq!(rows[0]["data"], json!({"id": "s1"}));
    }

    #[test]
    fn test_quota_on_put_downgrades_with_one_warning() {
        let dir = TempDir::new().unwrap();
        let env = Arc::new(Environment::new());
        let kv = Arc::new(KvSurface::open_file(dir.path().join("fb.json"), None).unwrap());
        let bus = EventBus::new();
        let warnings = Arc::new(Mutex::new(0usize));
        let warnings_clone = Arc::clone(&warnings);
        let _sub = bus.on(Topic::FallbackWarning, move |_| {
            *warnings_clone.lock() += 1;
        });
        let backend = FallbackBackend::init(&env, kv, bus);
        backend.put("settings", json!({"key": "a"})).unwrap();

        if let KvSurface::File(file) = backend.kv.as_ref() {
            file.set_quota(Some(0));
        }
        backend.put("settings", json!({"key": "b"})).unwrap();
        backend.put("settings", json!({"key": "c"})).unwrap();

        assert_eq!(backend.mode(), FallbackMode::Memory);
        assert_eq!(*warnings.lock(), 1);
        // All three records visible after the downgrade
        assert_eq!(backend.count("settings"), 3);
    }

    #[test]
    fn test_quota_on_delete_rolls_back() {
        let dir = TempDir::new().unwrap();
        let backend = file_backend(&dir, None);
        for key in ["a", "b", "c"] {
            backend
                .put("settings", json!({"key": key, "n": 1}))
                .unwrap();
        }
        if let KvSurface::File(file) = backend.kv.as_ref() {
            file.set_quota(Some(0));
        }
        let err = backend.delete("settings", "b").unwrap_err();
        assert!(err.is_quota());
        // No partial deletion visible in memory...
        assert_eq!(backend.count("settings"), 3);
        assert!(backend.get("settings", "b").is_some());
        // ...and none on disk either
        let raw = backend.kv.get("stowage_fb_settings").unwrap();
        let map: BTreeMap<String, Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_get_all_sorted_whitelist() {
        let backend = memory_backend();
        backend
            .put("chat_sessions", json!({"id": "a", "updatedAt": 3}))
            .unwrap();
        backend
            .put("chat_sessions", json!({"id": "b", "updatedAt": 1}))
            .unwrap();
        backend
            .put("chat_sessions", json!({"id": "c", "updatedAt": 2}))
            .unwrap();

        let sorted = backend
            .get_all_sorted("chat_sessions", "updatedAt", Direction::Ascending)
            .unwrap();
        let ids: Vec<&str> = sorted.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        assert!(backend
            .get_all_sorted("chat_sessions", "secret", Direction::Ascending)
            .is_err());
    }

    #[test]
    fn test_clear_all_snapshots_keys() {
        let dir = TempDir::new().unwrap();
        let backend = file_backend(&dir, None);
        backend.put("settings", json!({"key": "a"})).unwrap();
        backend.put("streams", json!({"id": "s"})).unwrap();
        backend.kv.set("unrelated", "keep").unwrap();

        backend.clear_all().unwrap();
        assert_eq!(backend.count("settings"), 0);
        assert_eq!(backend.count("streams"), 0);
        assert_eq!(backend.kv.get("unrelated"), Some("keep".to_string()));
    }
}
