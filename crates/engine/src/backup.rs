//! Emergency backup slot
//!
//! A single namespaced key on the key/value surface holding the most
//! recent conversation messages, written opportunistically so a crashed
//! session can restore them on the next start. Only the authoritative tab
//! writes the slot; every tab may read it. Stale or unreadable backups
//! are discarded at load.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use stowage_core::{now_ms, StowageResult, TabCoordinator};
use stowage_storage::KvSurface;
use tracing::{debug, info};

/// The namespaced key the backup lives under.
pub const EMERGENCY_BACKUP_KEY: &str = "stowage_emergency_backup";

/// Most recent messages kept in a backup.
pub const BACKUP_MAX_MESSAGES: usize = 100;

/// Backups older than this are discarded at load.
pub const BACKUP_MAX_AGE_MS: u64 = 3_600_000;

/// The persisted backup document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyBackup {
    /// Session the messages belong to
    pub session_id: String,
    /// When the session started, milliseconds since epoch
    pub created_at: u64,
    /// The most recent messages, oldest first
    pub messages: Vec<Value>,
    /// When the backup was written, milliseconds since epoch
    pub timestamp: u64,
}

/// Reader/writer for the emergency backup slot.
pub struct EmergencyBackupSlot {
    kv: Arc<KvSurface>,
    coordinator: Arc<dyn TabCoordinator>,
}

impl EmergencyBackupSlot {
    /// Create a slot over the key/value surface.
    pub fn new(kv: Arc<KvSurface>, coordinator: Arc<dyn TabCoordinator>) -> Self {
        Self { kv, coordinator }
    }

    /// Write a backup. Non-authoritative tabs silently skip the write;
    /// returns whether the slot was written.
    pub fn write(
        &self,
        session_id: &str,
        created_at: u64,
        messages: &[Value],
    ) -> StowageResult<bool> {
        if !self.coordinator.is_write_allowed() {
            debug!("skipping emergency backup; tab lacks write authority");
            return Ok(false);
        }
        let start = messages.len().saturating_sub(BACKUP_MAX_MESSAGES);
        let backup = EmergencyBackup {
            session_id: session_id.to_string(),
            created_at,
            messages: messages[start..].to_vec(),
            timestamp: now_ms(),
        };
        self.kv
            .set(EMERGENCY_BACKUP_KEY, &serde_json::to_string(&backup)?)?;
        debug!(session_id, messages = backup.messages.len(), "emergency backup written");
        Ok(true)
    }

    /// Load the backup, discarding invalid JSON and anything older than
    /// an hour.
    pub fn load(&self) -> Option<EmergencyBackup> {
        let raw = self.kv.get(EMERGENCY_BACKUP_KEY)?;
        let backup: EmergencyBackup = match serde_json::from_str(&raw) {
            Ok(backup) => backup,
            Err(_) => {
                info!("discarding unreadable emergency backup");
                return None;
            }
        };
        if now_ms().saturating_sub(backup.timestamp) > BACKUP_MAX_AGE_MS {
            info!("discarding stale emergency backup");
            return None;
        }
        Some(backup)
    }

    /// Remove the backup.
    pub fn clear(&self) -> StowageResult<()> {
        self.kv.remove(EMERGENCY_BACKUP_KEY)
    }
}
