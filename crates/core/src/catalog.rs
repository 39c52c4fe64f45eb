//! Declared store catalog
//!
//! The fixed set of logical stores at the current schema version, with
//! their primary-key fields and secondary indexes. Migrations build this
//! catalog up step by step; the safety-net store creator and the fallback
//! backend's keying both consult it.

/// Current schema version. Opens request this version; migrations apply
/// every step from the stored version up to it.
pub const CURRENT_SCHEMA_VERSION: u32 = 8;

/// A declared secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name (matches the indexed record field)
    pub name: &'static str,
    /// Record field the index is built over
    pub key_field: &'static str,
    /// Whether duplicate index keys are rejected
    pub unique: bool,
}

impl IndexSpec {
    const fn plain(name: &'static str) -> Self {
        Self {
            name,
            key_field: name,
            unique: false,
        }
    }

    const fn unique(name: &'static str) -> Self {
        Self {
            name,
            key_field: name,
            unique: true,
        }
    }
}

/// A declared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSpec {
    /// Store name
    pub name: &'static str,
    /// Record field used as the primary key
    pub key_field: &'static str,
    /// Declared secondary indexes
    pub indexes: &'static [IndexSpec],
}

/// Stores whose fallback representation is a single wrapped list row
/// rather than a key-to-record map.
pub const LIST_STYLE_STORES: &[&str] = &["streams", "chunks", "embeddings"];

/// The full catalog at `CURRENT_SCHEMA_VERSION`.
pub const DECLARED_STORES: &[StoreSpec] = &[
    StoreSpec {
        name: "streams",
        key_field: "id",
        indexes: &[],
    },
    StoreSpec {
        name: "chunks",
        key_field: "id",
        indexes: &[
            IndexSpec::plain("type"),
            IndexSpec::plain("startDate"),
            IndexSpec::plain("streamId"),
        ],
    },
    StoreSpec {
        name: "embeddings",
        key_field: "id",
        indexes: &[],
    },
    StoreSpec {
        name: "personality",
        key_field: "id",
        indexes: &[],
    },
    StoreSpec {
        name: "settings",
        key_field: "key",
        indexes: &[],
    },
    StoreSpec {
        name: "chat_sessions",
        key_field: "id",
        indexes: &[IndexSpec::plain("updatedAt")],
    },
    StoreSpec {
        name: "config",
        key_field: "key",
        indexes: &[],
    },
    StoreSpec {
        name: "tokens",
        key_field: "key",
        indexes: &[],
    },
    StoreSpec {
        name: "migration",
        key_field: "id",
        indexes: &[],
    },
    StoreSpec {
        name: "event_log",
        key_field: "id",
        indexes: &[
            IndexSpec::unique("sequenceNumber"),
            IndexSpec::plain("type"),
            IndexSpec::plain("timestamp"),
        ],
    },
    StoreSpec {
        name: "event_checkpoint",
        key_field: "id",
        indexes: &[IndexSpec::unique("sequenceNumber")],
    },
    StoreSpec {
        name: "demo_streams",
        key_field: "id",
        indexes: &[IndexSpec::plain("timestamp"), IndexSpec::plain("type")],
    },
    StoreSpec {
        name: "demo_patterns",
        key_field: "id",
        indexes: &[IndexSpec::plain("timestamp")],
    },
    StoreSpec {
        name: "demo_personality",
        key_field: "id",
        indexes: &[],
    },
    StoreSpec {
        name: "transaction_journal",
        key_field: "id",
        indexes: &[IndexSpec::plain("journalTime")],
    },
    StoreSpec {
        name: "transaction_compensation",
        key_field: "id",
        indexes: &[IndexSpec::plain("timestamp"), IndexSpec::plain("resolved")],
    },
];

/// Look up a store's declaration by name.
pub fn store_spec(name: &str) -> Option<&'static StoreSpec> {
    DECLARED_STORES.iter().find(|spec| spec.name == name)
}

/// Whether the store serializes list-style in the fallback backend.
pub fn is_list_style(store: &str) -> bool {
    LIST_STYLE_STORES.contains(&store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_has_all_declared_stores() {
        let names: Vec<&str> = DECLARED_STORES.iter().map(|s| s.name).collect();
        for expected in [
            "streams",
            "chunks",
            "embeddings",
            "personality",
            "settings",
            "chat_sessions",
            "config",
            "tokens",
            "migration",
            "event_log",
            "event_checkpoint",
            "demo_streams",
            "demo_patterns",
            "demo_personality",
            "transaction_journal",
            "transaction_compensation",
        ] {
            assert!(names.contains(&expected), "missing store {expected}");
        }
        assert_eq!(names.len(), 16);
    }

    #[test]
    fn test_key_fields() {
        assert_eq!(store_spec("settings").unwrap().key_field, "key");
        assert_eq!(store_spec("config").unwrap().key_field, "key");
        assert_eq!(store_spec("tokens").unwrap().key_field, "key");
        assert_eq!(store_spec("streams").unwrap().key_field, "id");
    }

    #[test]
    fn test_unique_indexes() {
        let event_log = store_spec("event_log").unwrap();
        let seq = event_log
            .indexes
            .iter()
            .find(|i| i.name == "sequenceNumber")
            .unwrap();
        assert!(seq.unique);
        let ty = event_log.indexes.iter().find(|i| i.name == "type").unwrap();
        assert!(!ty.unique);
    }

    #[test]
    fn test_chunks_has_stream_id_index() {
        let chunks = store_spec("chunks").unwrap();
        assert!(chunks.indexes.iter().any(|i| i.name == "streamId"));
    }

    #[test]
    fn test_list_style_classification() {
        assert!(is_list_style("streams"));
        assert!(is_list_style("embeddings"));
        assert!(!is_list_style("settings"));
        assert!(!is_list_style("chat_sessions"));
    }

    #[test]
    fn test_unknown_store() {
        assert!(store_spec("nope").is_none());
    }
}
