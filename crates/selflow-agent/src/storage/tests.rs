//! Unit tests for the DuckDB event store
//!
//! Tests cover:
//! - Idempotent inserts on content hash
//! - Per-row rejection inside an otherwise committed batch
//! - Inline vs compressed payloads
//! - Query ordering and filters
//! - Corrupt rows isolated to their own result slot
//! - Retention deletes and on-disk persistence

use chrono::{Duration, Utc};
use selflow_common::{
    ActivityAction, ActivityKind, AppAction, EventKind, EventPayload, EventQuery, FileAction,
    FileOpPayload, RawEvent,
};
use tempfile::TempDir;

use super::*;

// ============================================================================
// Test Fixtures
// ============================================================================

fn file_event(path: &str) -> RawEvent {
    RawEvent::file_op("fs", FileAction::Create, path)
}

fn events_at_offsets(offsets_secs: &[i64]) -> Vec<RawEvent> {
    let base = Utc::now();
    offsets_secs
        .iter()
        .enumerate()
        .map(|(i, off)| file_event(&format!("/home/user/f{}.txt", i)).at(base + Duration::seconds(*off)))
        .collect()
}

fn ok_rows(results: Vec<StorageResult<PersistedEvent>>) -> Vec<PersistedEvent> {
    results.into_iter().map(|r| r.unwrap()).collect()
}

// ============================================================================
// Insert Tests
// ============================================================================

#[test]
fn test_insert_returns_monotonic_ids() {
    let store = Storage::open_in_memory().unwrap();
    let outcome = store.insert_batch(&events_at_offsets(&[0, 1, 2])).unwrap();

    assert_eq!(outcome.inserted_ids.len(), 3);
    assert!(outcome.inserted_ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(outcome.duplicates, 0);
    assert!(outcome.rejected.is_empty());
}

#[test]
fn test_same_event_twice_yields_one_row() {
    let store = Storage::open_in_memory().unwrap();
    let event = file_event("/home/user/once.txt");

    let first = store.insert_batch(std::slice::from_ref(&event)).unwrap();
    let second = store.insert_batch(std::slice::from_ref(&event)).unwrap();

    assert_eq!(first.inserted_ids.len(), 1);
    assert!(second.inserted_ids.is_empty());
    assert_eq!(second.duplicates, 1);

    let rows = ok_rows(store.query(&EventQuery::new()).unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content_hash, selflow_common::content_hash(&event).unwrap());
}

#[test]
fn test_duplicates_within_one_batch() {
    let store = Storage::open_in_memory().unwrap();
    let event = file_event("/home/user/dup.txt");

    let outcome = store
        .insert_batch(&[event.clone(), event.clone(), event])
        .unwrap();

    assert_eq!(outcome.inserted_ids.len(), 1);
    assert_eq!(outcome.duplicates, 2);
    assert_eq!(store.stats().unwrap().row_count, 1);
}

#[test]
fn test_malformed_row_skipped_rest_committed() {
    let store = Storage::open_in_memory().unwrap();
    let mut events = events_at_offsets(&[0, 1]);
    events.insert(
        1,
        RawEvent::new("fs", EventPayload::FileOp(FileOpPayload::new(FileAction::Create, ""))),
    );

    let outcome = store.insert_batch(&events).unwrap();

    assert_eq!(outcome.inserted_ids.len(), 2);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].index, 1);
    assert_eq!(store.stats().unwrap().row_count, 2);
}

#[test]
fn test_empty_batch_is_noop() {
    let store = Storage::open_in_memory().unwrap();
    let outcome = store.insert_batch(&[]).unwrap();
    assert_eq!(outcome, InsertOutcome::default());
}

// ============================================================================
// Compression Tests
// ============================================================================

#[test]
fn test_compressed_payload_round_trip() {
    let store = Storage::open_in_memory().unwrap();
    let long = format!("/home/user/{}/big.txt", "nested/".repeat(300));
    let small = file_event("/home/user/small.txt").at(Utc::now() - Duration::seconds(1));
    let big = file_event(&long);

    store.insert_batch(&[small.clone(), big.clone()]).unwrap();

    let rows = ok_rows(store.query(&EventQuery::new()).unwrap());
    assert_eq!(rows.len(), 2);
    // newest first
    assert!(rows[0].compressed);
    assert_eq!(rows[0].payload, big.payload);
    assert!(!rows[1].compressed);
    assert_eq!(rows[1].payload, small.payload);
}

#[test]
fn test_threshold_is_configurable() {
    let config = StorageConfig {
        compression_threshold_bytes: 8,
        ..StorageConfig::default()
    };
    let store = Storage::open(config).unwrap();
    store.insert_batch(&[file_event("/a/b.txt")]).unwrap();

    let rows = ok_rows(store.query(&EventQuery::new()).unwrap());
    assert!(rows[0].compressed);
}

// ============================================================================
// Query Tests
// ============================================================================

#[test]
fn test_query_orders_by_timestamp_desc() {
    let store = Storage::open_in_memory().unwrap();
    // inserted out of timestamp order on purpose
    store.insert_batch(&events_at_offsets(&[5, -5, 0])).unwrap();

    let rows = ok_rows(store.query(&EventQuery::new()).unwrap());
    assert_eq!(rows.len(), 3);
    assert!(rows.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
}

#[test]
fn test_unbounded_limit_returns_everything() {
    let store = Storage::open_in_memory().unwrap();
    store.insert_batch(&events_at_offsets(&[0, 1, 2, 3])).unwrap();

    let rows = ok_rows(store.query(&EventQuery::new().limit(usize::MAX)).unwrap());
    assert_eq!(rows.len(), 4);
}

#[test]
fn test_query_filters() {
    let store = Storage::open_in_memory().unwrap();
    let now = Utc::now();
    let events = vec![
        file_event("/a/old.txt").at(now - Duration::hours(2)),
        file_event("/a/new.txt").at(now),
        RawEvent::app_event("app_mon", AppAction::Launch, "firefox").at(now),
        RawEvent::system_activity("sys_mon", ActivityKind::Idle, ActivityAction::UserAway)
            .at(now - Duration::minutes(1)),
    ];
    store.insert_batch(&events).unwrap();

    let files = ok_rows(store.query(&EventQuery::new().kind(EventKind::FileOp)).unwrap());
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|e| e.kind == EventKind::FileOp));

    let recent = ok_rows(
        store
            .query(&EventQuery::new().since(now - Duration::hours(1)))
            .unwrap(),
    );
    assert_eq!(recent.len(), 3);

    let window = ok_rows(
        store
            .query(
                &EventQuery::new()
                    .since(now - Duration::hours(3))
                    .until(now - Duration::hours(1)),
            )
            .unwrap(),
    );
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].action, "create");

    let apps = ok_rows(store.query(&EventQuery::new().source("app_mon")).unwrap());
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].kind, EventKind::AppEvent);

    let limited = ok_rows(store.query(&EventQuery::new().limit(2)).unwrap());
    assert_eq!(limited.len(), 2);
}

#[test]
fn test_corrupt_row_fails_alone() {
    let store = Storage::open_in_memory().unwrap();
    let now = Utc::now();
    store
        .insert_batch(&[file_event("/a/good.txt").at(now - Duration::seconds(10))])
        .unwrap();

    {
        let conn = store.conn.lock();
        conn.execute(
            "INSERT INTO events (timestamp, kind, action, source, payload, payload_compressed, content_hash) VALUES (?, 'file_op', 'create', 'fs', NULL, ?, 'deadbeef')",
            params![now.timestamp_micros(), vec![1u8, 2, 3, 4]],
        )
        .unwrap();
    }

    let results = store.query(&EventQuery::new()).unwrap();
    assert_eq!(results.len(), 2);
    assert!(matches!(
        results[0],
        Err(StorageError::CorruptPayload { .. })
    ));
    assert!(results[1].is_ok());
}

// ============================================================================
// Retention and Persistence Tests
// ============================================================================

#[test]
fn test_delete_older_than_keeps_newer() {
    let store = Storage::open_in_memory().unwrap();
    let now = Utc::now();
    let events = vec![
        file_event("/a/1.txt").at(now - Duration::days(40)),
        file_event("/a/2.txt").at(now - Duration::days(31)),
        file_event("/a/3.txt").at(now - Duration::days(29)),
        file_event("/a/4.txt").at(now),
    ];
    store.insert_batch(&events).unwrap();

    let removed = store.delete_older_than(now - Duration::days(30)).unwrap();
    assert_eq!(removed, 2);

    let rows = ok_rows(store.query(&EventQuery::new()).unwrap());
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|e| e.timestamp >= now - Duration::days(30)));
}

#[test]
fn test_file_store_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("events.duckdb");
    let config = StorageConfig {
        db_path: Some(path.clone()),
        ..StorageConfig::default()
    };

    {
        let store = Storage::open(config.clone()).unwrap();
        store.insert_batch(&events_at_offsets(&[0, 1, 2])).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.row_count, 3);
        assert!(stats.size_bytes > 0);
    }

    let reopened = Storage::open(config).unwrap();
    assert_eq!(reopened.stats().unwrap().row_count, 3);

    // ids keep increasing after reopen
    let before: Vec<i64> = ok_rows(reopened.query(&EventQuery::new()).unwrap())
        .iter()
        .map(|e| e.id)
        .collect();
    let outcome = reopened
        .insert_batch(&[file_event("/after/reopen.txt")])
        .unwrap();
    assert!(outcome.inserted_ids[0] > *before.iter().max().unwrap());
}

#[test]
fn test_newer_schema_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("events.duckdb");
    let config = StorageConfig {
        db_path: Some(path),
        ..StorageConfig::default()
    };

    {
        let store = Storage::open(config.clone()).unwrap();
        let conn = store.conn.lock();
        conn.execute(
            "INSERT INTO schema_meta (version) VALUES (?)",
            params![schema::latest_version() + 1],
        )
        .unwrap();
    }

    assert!(matches!(Storage::open(config), Err(StorageError::Open(_))));
}

#[test]
fn test_stats_report_time_range() {
    let store = Storage::open_in_memory().unwrap();
    assert_eq!(store.stats().unwrap(), StoreStats::default());

    let events = events_at_offsets(&[-10, 10]);
    store.insert_batch(&events).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.row_count, 2);
    assert_eq!(
        stats.oldest.map(|t| t.timestamp_micros()),
        Some(events[0].timestamp_micros())
    );
    assert_eq!(
        stats.newest.map(|t| t.timestamp_micros()),
        Some(events[1].timestamp_micros())
    );
}

#[test]
fn test_error_classification() {
    assert!(StorageError::Transient("database is locked".into()).is_transient());
    assert!(!StorageError::Query("syntax".into()).is_transient());
    assert!(!StorageError::Permanent("bad row".into()).is_transient());
}
