//! Contract tests: invariants, round-trip laws, and boundary behaviors
//! across the assembled engine.

mod common;

use common::engine;
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use stowage::{
    detect_conflict, ClockOrdering, EventBus, FixedEstimator, KvSurface,
    MemoryVectorPersistence, Precondition, PutOptions, SharedCoordinator, TogglePrecondition,
    VectorCache, VectorCacheConfig, VectorClock, WalPriority, WriteAheadLog,
};
use stowage_core::{now_ms, TabCoordinator, WalConfig};
use stowage_durability::{WalEntry, WalStatus, WAL_KEY, WAL_SEQ_KEY};

// ============================================================================
// P1: last put wins
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_last_put_wins(values in proptest::collection::vec(0i64..1000, 1..8)) {
        let engine = engine("db");
        let last = *values.last().unwrap();
        for value in &values {
            engine
                .store()
                .put("settings", json!({"key": "k", "n": value}), PutOptions::default())
                .unwrap();
        }
        let record = engine.store().get("settings", "k").unwrap().unwrap();
        prop_assert_eq!(record["n"].clone(), json!(last));
        engine.close();
    }

    // P4: WAL drain order respects (priority, sequence)
    #[test]
    fn prop_wal_drain_order(priorities in proptest::collection::vec(0u8..4, 1..12)) {
        let gate = Arc::new(TogglePrecondition::new(false));
        let wal = WriteAheadLog::new(
            Arc::new(KvSurface::memory()),
            WalConfig::default(),
            EventBus::new(),
            SharedCoordinator::new(true) as Arc<dyn TabCoordinator>,
            Arc::clone(&gate) as Arc<dyn Precondition>,
        );
        let applied: Arc<Mutex<Vec<(u8, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let applied_clone = Arc::clone(&applied);
        wal.register_operation(
            "record",
            true,
            false,
            Arc::new(move |args: &[Value]| {
                applied_clone.lock().push((
                    args[0].as_u64().unwrap() as u8,
                    args[1].as_u64().unwrap(),
                ));
                Ok(Value::Null)
            }),
        )
        .unwrap();

        for (sequence, priority) in priorities.iter().enumerate() {
            let wal_priority = match priority {
                0 => WalPriority::Critical,
                1 => WalPriority::High,
                2 => WalPriority::Normal,
                _ => WalPriority::Low,
            };
            wal.queue_write(
                "record",
                vec![json!(priority), json!(sequence as u64 + 1)],
                wal_priority,
            )
            .unwrap();
        }

        gate.set(true);
        wal.process_wal().unwrap();

        let applied = applied.lock();
        prop_assert_eq!(applied.len(), priorities.len());
        // (priority, sequence) lexicographic order is non-decreasing
        for window in applied.windows(2) {
            prop_assert!(window[0] <= window[1], "out of order: {:?}", &*applied);
        }
    }
}

// ============================================================================
// P2/P3: conflict detection totality and divergence
// ============================================================================

#[test]
fn test_detect_conflict_total_on_degenerate_inputs() {
    // Never panics, always one outcome, on any well-formed shape.
    let shapes = [
        json!({}),
        json!({"writeEpoch": {}}),
        json!({"writeEpoch": null}),
        json!({"writeEpoch": {"w": 0}}),
        json!({"writeEpoch": "garbage", "writerId": 7}),
    ];
    for existing in &shapes {
        for incoming in &shapes {
            let _ = detect_conflict(Some(existing), incoming);
            let _ = detect_conflict(None, incoming);
        }
    }
}

#[test]
fn test_divergent_clocks_compare_concurrent() {
    let mut writer_a = VectorClock::new("a");
    let ancestor = writer_a.tick();
    let mut writer_b = VectorClock::from_state(ancestor, "b");

    let state_a = writer_a.tick();
    let state_b = writer_b.tick();
    assert_eq!(state_a.compare(&state_b), ClockOrdering::Concurrent);
}

// ============================================================================
// P5: crash reload classification
// ============================================================================

#[test]
fn test_committed_entries_stay_out_of_the_drain_set_after_reload() {
    let kv = Arc::new(KvSurface::memory());
    let mut committed = WalEntry::new(1, "toy", vec![], WalPriority::Normal);
    committed.status = WalStatus::Committed;
    committed.processed_at = Some(now_ms());
    let mut crashed = WalEntry::new(2, "toy", vec![], WalPriority::Normal);
    crashed.status = WalStatus::Processing;
    crashed.processed_at = Some(now_ms() - 90_000);
    let pending = WalEntry::new(3, "toy", vec![], WalPriority::Normal);
    kv.set(
        WAL_KEY,
        &serde_json::to_string(&vec![committed, crashed, pending]).unwrap(),
    )
    .unwrap();
    kv.set(WAL_SEQ_KEY, "3").unwrap();

    // Gate closed so the replay classifies without draining.
    let wal = WriteAheadLog::new(
        kv,
        WalConfig::default(),
        EventBus::new(),
        SharedCoordinator::new(true) as Arc<dyn TabCoordinator>,
        Arc::new(TogglePrecondition::new(false)) as Arc<dyn Precondition>,
    );
    wal.replay_wal().unwrap();

    let entries = wal.entries();
    assert_eq!(entries[0].status, WalStatus::Committed);
    assert_ne!(entries[1].status, WalStatus::Committed);
    assert_eq!(wal.pending_count(), 2);
}

// ============================================================================
// P6: no lost updates under concurrent atomic_update
// ============================================================================

#[test]
fn test_concurrent_atomic_updates_lose_nothing() {
    let engine = Arc::new(engine("db"));
    engine
        .store()
        .put("settings", json!({"key": "counter", "n": 0}), PutOptions::default())
        .unwrap();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                engine
                    .store()
                    .atomic_update("settings", "counter", |existing| {
                        let record = existing.unwrap();
                        let n = record["n"].as_i64().unwrap();
                        Ok(json!({"key": "counter", "n": n + 1}))
                    })
                    .unwrap();
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let record = engine.store().get("settings", "counter").unwrap().unwrap();
    assert_eq!(record["n"], json!(8));
    engine.close();
}

// ============================================================================
// P7: pinned entries survive; unpinned survivors are a recency suffix
// ============================================================================

#[test]
fn test_pinned_survive_and_unpinned_survivors_are_most_recent() {
    let cache = VectorCache::new(
        VectorCacheConfig {
            max_vectors: 4,
            ..VectorCacheConfig::default()
        },
        Arc::new(MemoryVectorPersistence::new()),
        Arc::new(FixedEstimator::new(0, 0)),
    );
    for i in 0..4 {
        cache.upsert(&format!("p{i}"), vec![0.0], json!({}));
        cache.pin(&format!("p{i}"));
    }
    for i in 0..6 {
        cache.upsert(&format!("u{i}"), vec![0.0], json!({}));
    }
    for i in 0..4 {
        assert!(cache.contains(&format!("p{i}")));
    }
    // Whatever unpinned entries survived form a suffix of insertion order.
    let survivors: Vec<usize> = (0..6)
        .filter(|i| cache.contains(&format!("u{i}")))
        .collect();
    if let Some(first) = survivors.first() {
        let expected: Vec<usize> = (*first..6).collect();
        assert_eq!(survivors, expected);
    }
}

// ============================================================================
// P8: emergency backup round trip
// ============================================================================

#[test]
fn test_emergency_backup_round_trip_within_window() {
    let engine = engine("db");
    let messages: Vec<Value> = (0..120).map(|i| json!({"seq": i})).collect();
    assert!(engine.backup().write("session", 1, &messages).unwrap());

    let restored = engine.backup().load().unwrap();
    assert_eq!(restored.messages.len(), 100);
    assert_eq!(restored.messages[0]["seq"], json!(20));
    assert_eq!(restored.messages[99]["seq"], json!(119));
    engine.close();
}

// ============================================================================
// L1-L3: round-trip and idempotence laws
// ============================================================================

#[test]
fn test_put_delete_get_yields_nothing() {
    let engine = engine("db");
    engine
        .store()
        .put("streams", json!({"id": "s1"}), PutOptions::default())
        .unwrap();
    engine.store().delete("streams", "s1").unwrap();
    assert!(engine.store().get("streams", "s1").unwrap().is_none());
    engine.close();
}

#[test]
fn test_replaying_committed_add_leaves_store_identical() {
    let gate = Arc::new(TogglePrecondition::new(false));
    let mut options = common::fast_options("db");
    options.precondition = Arc::clone(&gate) as Arc<dyn Precondition>;
    let engine = stowage::Stowage::open(options).unwrap();

    // The add's effect is already in the store, as if it committed right
    // before a crash that lost the WAL status update.
    engine
        .store()
        .put("streams", json!({"id": "s1", "n": 1}), PutOptions::default())
        .unwrap();
    engine
        .queue_write("add", vec![json!("streams"), json!({"id": "s1", "n": 1})], WalPriority::Normal)
        .unwrap();

    gate.set(true);
    engine.run_maintenance();

    let records = engine.store().get_all("streams").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["n"], json!(1));
    assert_eq!(engine.wal().pending_count(), 0);
    engine.close();
}

#[test]
fn test_clear_empties_store() {
    let engine = engine("db");
    for i in 0..3 {
        engine
            .store()
            .put("streams", json!({"id": format!("s{i}")}), PutOptions::default())
            .unwrap();
    }
    engine.store().clear("streams").unwrap();
    assert!(engine.store().get_all("streams").unwrap().is_empty());
    assert_eq!(engine.store().count("streams").unwrap(), 0);
    engine.close();
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[test]
fn test_cache_at_exact_capacity_does_not_evict() {
    let cache = VectorCache::new(
        VectorCacheConfig {
            max_vectors: 3,
            ..VectorCacheConfig::default()
        },
        Arc::new(MemoryVectorPersistence::new()),
        Arc::new(FixedEstimator::new(0, 0)),
    );
    for i in 0..3 {
        cache.upsert(&format!("v{i}"), vec![0.0], json!({}));
    }
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.get_stats().lru.eviction_count, 0);
}

#[test]
fn test_processing_entry_at_exactly_sixty_seconds_is_reset() {
    let kv = Arc::new(KvSurface::memory());
    let mut stuck = WalEntry::new(1, "toy", vec![], WalPriority::Normal);
    stuck.status = WalStatus::Processing;
    stuck.processed_at = Some(now_ms() - 60_000);
    kv.set(WAL_KEY, &serde_json::to_string(&vec![stuck]).unwrap())
        .unwrap();

    let wal = WriteAheadLog::new(
        kv,
        WalConfig::default(),
        EventBus::new(),
        SharedCoordinator::new(true) as Arc<dyn TabCoordinator>,
        Arc::new(TogglePrecondition::new(false)) as Arc<dyn Precondition>,
    );
    wal.replay_wal().unwrap();
    // Classified as crashed: back in the drain set, no longer processing.
    assert_eq!(wal.pending_count(), 1);
    assert_ne!(wal.entries()[0].status, WalStatus::Processing);
    assert_ne!(wal.entries()[0].status, WalStatus::Committed);
}

// ============================================================================
// Index cursors across both backends
// ============================================================================

#[test]
fn test_get_all_by_index_primary_and_fallback() {
    use stowage::Direction;

    let engine = engine("db");
    for (id, updated) in [("a", 3), ("b", 1), ("c", 2)] {
        engine
            .store()
            .put(
                "chat_sessions",
                json!({"id": id, "updatedAt": updated}),
                PutOptions::default(),
            )
            .unwrap();
    }
    let ascending = engine
        .store()
        .get_all_by_index("chat_sessions", "updatedAt", Direction::Ascending)
        .unwrap();
    let ids: Vec<&str> = ascending.iter().map(|r| r["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["b", "c", "a"]);
    engine.close();

    // Fallback path: force the connection down, then sort in memory.
    let mut options = common::fast_options("db2");
    options.open.env.faults().set_unavailable(true);
    let engine = stowage::Stowage::open(options).unwrap();
    assert!(engine.store().is_fallback());
    for (id, updated) in [("a", 3), ("b", 1), ("c", 2)] {
        engine
            .store()
            .put(
                "chat_sessions",
                json!({"id": id, "updatedAt": updated}),
                PutOptions::default(),
            )
            .unwrap();
    }
    let descending = engine
        .store()
        .get_all_by_index("chat_sessions", "updatedAt", Direction::Descending)
        .unwrap();
    let ids: Vec<&str> = descending.iter().map(|r| r["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["a", "c", "b"]);
    engine.close();
}
