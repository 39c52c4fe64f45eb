//! Flat key/value surface
//!
//! The durable string-to-string surface beneath the fallback backend, the
//! WAL, and the emergency backup slot. Two variants:
//!
//! - `File`: a single JSON file persisted with the temp-file + rename
//!   pattern, with quota accounting. Writes that would grow the surface
//!   past the quota fail with `QuotaExceeded` and leave the previous state
//!   untouched on disk.
//! - `Memory`: volatile map for environments without usable persistence.
//!
//! Enumeration snapshots keys before removal so bulk clears never mutate
//! the index they iterate.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use stowage_core::{StowageError, StowageResult};
use tracing::{debug, warn};

const PROBE_KEY: &str = "stowage_probe";

/// Key/value surface variants.
pub enum KvSurface {
    /// File-backed persistent surface
    File(FileKv),
    /// Volatile in-memory surface
    Memory(MemoryKv),
}

impl KvSurface {
    /// Open a file-backed surface, loading existing entries.
    pub fn open_file(path: impl AsRef<Path>, quota_bytes: Option<usize>) -> StowageResult<Self> {
        Ok(KvSurface::File(FileKv::open(path, quota_bytes)?))
    }

    /// Create a volatile surface.
    pub fn memory() -> Self {
        KvSurface::Memory(MemoryKv::default())
    }

    /// Whether this surface persists across restarts.
    pub fn is_persistent(&self) -> bool {
        matches!(self, KvSurface::File(_))
    }

    /// Store a value. Fails with `QuotaExceeded` when the write would grow
    /// the surface past its quota; the stored state is unchanged on failure.
    pub fn set(&self, key: &str, value: &str) -> StowageResult<()> {
        match self {
            KvSurface::File(kv) => kv.set(key, value),
            KvSurface::Memory(kv) => {
                kv.entries.lock().insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    /// Read a value.
    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            KvSurface::File(kv) => kv.entries.lock().get(key).cloned(),
            KvSurface::Memory(kv) => kv.entries.lock().get(key).cloned(),
        }
    }

    /// Remove a value. Missing keys are fine.
    pub fn remove(&self, key: &str) -> StowageResult<()> {
        match self {
            KvSurface::File(kv) => kv.remove(key),
            KvSurface::Memory(kv) => {
                kv.entries.lock().remove(key);
                Ok(())
            }
        }
    }

    /// Snapshot all keys with the given prefix.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let entries = match self {
            KvSurface::File(kv) => kv.entries.lock(),
            KvSurface::Memory(kv) => kv.entries.lock(),
        };
        entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Remove every key with the given prefix. Keys are enumerated into a
    /// snapshot first, then removed.
    pub fn remove_prefix(&self, prefix: &str) -> StowageResult<()> {
        let keys = self.keys_with_prefix(prefix);
        for key in keys {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        match self {
            KvSurface::File(kv) => kv.entries.lock().len(),
            KvSurface::Memory(kv) => kv.entries.lock().len(),
        }
    }

    /// Whether the surface is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Small write/read/delete round-trip used for mode selection.
    pub fn probe_round_trip(&self) -> bool {
        let token = "1";
        if self.set(PROBE_KEY, token).is_err() {
            return false;
        }
        let read_back = self.get(PROBE_KEY);
        let _ = self.remove(PROBE_KEY);
        read_back.as_deref() == Some(token)
    }
}

/// File-backed variant.
pub struct FileKv {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
    quota_bytes: Mutex<Option<usize>>,
}

impl FileKv {
    fn open(path: impl AsRef<Path>, quota_bytes: Option<usize>) -> StowageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content).unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "discarding unreadable kv file");
                    BTreeMap::new()
                })
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "opened kv surface");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            quota_bytes: Mutex::new(quota_bytes),
        })
    }

    /// Adjust the quota. Existing data over the new quota stays readable;
    /// only growth is checked.
    pub fn set_quota(&self, quota_bytes: Option<usize>) {
        *self.quota_bytes.lock() = quota_bytes;
    }

    /// Approximate stored size in bytes (keys + values).
    pub fn used_bytes(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }

    fn set(&self, key: &str, value: &str) -> StowageResult<()> {
        let mut entries = self.entries.lock();
        let current: usize = entries
            .iter()
            .filter(|(existing, _)| existing.as_str() != key)
            .map(|(existing, existing_value)| existing.len() + existing_value.len())
            .sum();
        if let Some(quota) = *self.quota_bytes.lock() {
            if current + key.len() + value.len() > quota {
                return Err(StowageError::QuotaExceeded(format!(
                    "write of {} bytes exceeds quota of {} bytes",
                    key.len() + value.len(),
                    quota
                )));
            }
        }
        let previous = entries.insert(key.to_string(), value.to_string());
        match self.persist(&entries) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Keep memory and disk consistent on failed persist.
                match previous {
                    Some(old) => entries.insert(key.to_string(), old),
                    None => entries.remove(key),
                };
                Err(e)
            }
        }
    }

    fn remove(&self, key: &str) -> StowageResult<()> {
        let mut entries = self.entries.lock();
        if let Some(previous) = entries.remove(key) {
            if let Err(e) = self.persist(&entries) {
                entries.insert(key.to_string(), previous);
                return Err(e);
            }
        }
        Ok(())
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StowageResult<()> {
        let serialized = serde_json::to_string(entries)?;
        let temp_path = self.path.with_extension("kv.tmp");
        fs::write(&temp_path, serialized.as_bytes())?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// In-memory variant.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_set_get_remove() {
        let kv = KvSurface::memory();
        kv.set("a", "1").unwrap();
        assert_eq!(kv.get("a"), Some("1".to_string()));
        kv.remove("a").unwrap();
        assert_eq!(kv.get("a"), None);
    }

    #[test]
    fn test_file_round_trip_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("surface.json");
        {
            let kv = KvSurface::open_file(&path, None).unwrap();
            kv.set("stowage_fb_settings", r#"{"theme":"dark"}"#).unwrap();
        }
        let kv = KvSurface::open_file(&path, None).unwrap();
        assert_eq!(
            kv.get("stowage_fb_settings"),
            Some(r#"{"theme":"dark"}"#.to_string())
        );
    }

    #[test]
    fn test_quota_exceeded_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("surface.json");
        let kv = KvSurface::open_file(&path, Some(20)).unwrap();
        kv.set("k", "small").unwrap();

        let err = kv.set("big", &"x".repeat(100)).unwrap_err();
        assert!(err.is_quota());
        assert_eq!(kv.get("k"), Some("small".to_string()));
        assert_eq!(kv.get("big"), None);

        // And disk agrees after reopen
        drop(kv);
        let kv = KvSurface::open_file(&path, Some(20)).unwrap();
        assert_eq!(kv.get("k"), Some("small".to_string()));
        assert_eq!(kv.get("big"), None);
    }

    #[test]
    fn test_quota_lowered_below_current_blocks_all_writes() {
        let dir = TempDir::new().unwrap();
        let kv = FileKv::open(dir.path().join("surface.json"), None).unwrap();
        kv.set("a", "payload").unwrap();
        kv.set_quota(Some(0));
        assert!(kv.set("b", "x").unwrap_err().is_quota());
        // Existing data still readable
        assert_eq!(kv.entries.lock().get("a").map(String::as_str), Some("payload"));
    }

    #[test]
    fn test_keys_with_prefix_and_remove_prefix() {
        let kv = KvSurface::memory();
        kv.set("stowage_fb_a", "1").unwrap();
        kv.set("stowage_fb_b", "2").unwrap();
        kv.set("other", "3").unwrap();

        let mut keys = kv.keys_with_prefix("stowage_fb_");
        keys.sort();
        assert_eq!(keys, vec!["stowage_fb_a", "stowage_fb_b"]);

        kv.remove_prefix("stowage_fb_").unwrap();
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get("other"), Some("3".to_string()));
    }

    #[test]
    fn test_probe_round_trip() {
        let kv = KvSurface::memory();
        assert!(kv.probe_round_trip());
        // probe key is cleaned up
        assert!(kv.get("stowage_probe").is_none());
    }

    #[test]
    fn test_probe_fails_on_zero_quota() {
        let dir = TempDir::new().unwrap();
        let kv = KvSurface::open_file(dir.path().join("surface.json"), Some(0)).unwrap();
        assert!(!kv.probe_round_trip());
    }

    #[test]
    fn test_overwrite_same_key_within_quota() {
        let dir = TempDir::new().unwrap();
        let kv = KvSurface::open_file(dir.path().join("surface.json"), Some(32)).unwrap();
        kv.set("key", &"a".repeat(20)).unwrap();
        // Replacing the value does not double-count the old value
        kv.set("key", &"b".repeat(20)).unwrap();
        assert_eq!(kv.get("key"), Some("b".repeat(20)));
    }

    #[test]
    fn test_corrupt_file_discarded_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("surface.json");
        fs::write(&path, "not json at all").unwrap();
        let kv = KvSurface::open_file(&path, None).unwrap();
        assert!(kv.is_empty());
    }
}
