//! Unit tests for the persistence manager
//!
//! Tests cover:
//! - Normal writes, chunking by write_batch_max and duplicate accounting
//! - Transient failure retry and exhaustion
//! - Permanent row errors
//! - Queue overflow and shutdown draining/timeouts
//! - Retention cleanup, including failures

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use selflow_common::{
    Batch, EventPayload, EventQuery, FileAction, FileOpPayload, PersistedEvent, RawEvent,
};

use super::*;
use crate::storage::Storage;

// ============================================================================
// Fault-injecting store
// ============================================================================

/// Real in-memory store with injectable failures and latency
struct FlakyStore {
    inner: Storage,
    transient_failures: AtomicU32,
    insert_calls: AtomicU32,
    insert_sizes: Mutex<Vec<usize>>,
    insert_delay: Mutex<Option<Duration>>,
    fail_cleanup: AtomicBool,
}

impl FlakyStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Storage::open_in_memory().unwrap(),
            transient_failures: AtomicU32::new(0),
            insert_calls: AtomicU32::new(0),
            insert_sizes: Mutex::new(Vec::new()),
            insert_delay: Mutex::new(None),
            fail_cleanup: AtomicBool::new(false),
        })
    }

    fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    fn rows(&self) -> u64 {
        self.inner.stats().unwrap().row_count
    }
}

impl EventStore for FlakyStore {
    fn insert_batch(&self, events: &[RawEvent]) -> StorageResult<InsertOutcome> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.insert_sizes.lock().push(events.len());

        let delay = *self.insert_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::Transient("database is locked".to_string()));
        }
        self.inner.insert_batch(events)
    }

    fn query(&self, query: &EventQuery) -> StorageResult<Vec<StorageResult<PersistedEvent>>> {
        self.inner.query(query)
    }

    fn stats(&self) -> StorageResult<StoreStats> {
        self.inner.stats()
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(StorageError::Transient("io error: disk busy".to_string()));
        }
        self.inner.delete_older_than(cutoff)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn fast_config() -> PersistenceConfig {
    PersistenceConfig {
        retry_base_delay: Duration::from_millis(1),
        retry_max_delay: Duration::from_millis(4),
        retention: RetentionPolicy {
            cleanup_on_start: false,
            ..RetentionPolicy::default()
        },
        ..PersistenceConfig::default()
    }
}

fn manager(
    store: Arc<FlakyStore>,
    config: PersistenceConfig,
) -> (Arc<PersistenceManager>, Arc<PipelineMetrics>) {
    let metrics = Arc::new(PipelineMetrics::new());
    let manager = PersistenceManager::new(store, config, Arc::clone(&metrics));
    (manager, metrics)
}

fn batch(range: std::ops::Range<usize>) -> Batch {
    let events = range
        .map(|i| RawEvent::file_op("fs", FileAction::Create, format!("/data/file{}.txt", i)))
        .collect();
    Batch::new("fs", events).unwrap()
}

const DRAIN: Duration = Duration::from_secs(5);

// ============================================================================
// Write Path Tests
// ============================================================================

#[tokio::test]
async fn test_submitted_batches_are_persisted() {
    let store = FlakyStore::new();
    let (manager, metrics) = manager(store.clone(), fast_config());
    manager.start();

    manager.submit(batch(0..10));
    manager.submit(batch(10..15));

    let report = manager.shutdown(DRAIN).await;
    assert_eq!(report, DrainReport { flushed: 15, lost: 0 });
    assert_eq!(store.rows(), 15);
    assert_eq!(metrics.persisted.get(), 15);
    assert_eq!(metrics.dropped.get(), 0);
    assert!(metrics.write_latency_ms.count() >= 1);
}

#[tokio::test]
async fn test_writes_chunked_by_write_batch_max() {
    let store = FlakyStore::new();
    let (manager, metrics) = manager(store.clone(), fast_config());

    // queued before the writer exists, so chunk boundaries are deterministic
    manager.submit(batch(0..250));
    manager.start();
    manager.shutdown(DRAIN).await;

    assert_eq!(*store.insert_sizes.lock(), vec![100, 100, 50]);
    assert_eq!(metrics.batches_written.get(), 3);
    assert_eq!(store.rows(), 250);
}

#[tokio::test]
async fn test_resubmitted_events_count_as_duplicates() {
    let store = FlakyStore::new();
    let (manager, metrics) = manager(store.clone(), fast_config());

    let b = batch(0..3);
    manager.submit(b.clone());
    manager.submit(b);
    manager.start();
    manager.shutdown(DRAIN).await;

    assert_eq!(store.rows(), 3);
    assert_eq!(metrics.persisted.get(), 3);
    assert_eq!(metrics.duplicates.get(), 3);
}

#[tokio::test]
async fn test_permanent_row_error_skips_only_that_row() {
    let store = FlakyStore::new();
    let (manager, metrics) = manager(store.clone(), fast_config());

    let mut events = batch(0..4).into_events();
    events.insert(
        2,
        RawEvent::new("fs", EventPayload::FileOp(FileOpPayload::new(FileAction::Modify, ""))),
    );
    manager.submit_events(events);
    manager.start();
    manager.shutdown(DRAIN).await;

    assert_eq!(store.rows(), 4);
    assert_eq!(metrics.write_errors.get(), 1);
    assert_eq!(metrics.dropped.get(), 0);
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = FlakyStore::new();
    store.fail_next(2);
    let (manager, metrics) = manager(store.clone(), fast_config());

    manager.submit(batch(0..5));
    manager.start();
    manager.shutdown(DRAIN).await;

    assert_eq!(store.insert_calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.retries.get(), 2);
    assert_eq!(metrics.persisted.get(), 5);
    assert_eq!(metrics.dropped.get(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_drop_the_batch() {
    let store = FlakyStore::new();
    store.fail_next(100);
    let config = PersistenceConfig {
        retry_attempts: 2,
        ..fast_config()
    };
    let (manager, metrics) = manager(store.clone(), config);

    manager.submit(batch(0..5));
    manager.start();
    let report = manager.shutdown(DRAIN).await;

    assert_eq!(store.insert_calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.retries.get(), 2);
    assert_eq!(metrics.dropped.get(), 5);
    assert_eq!(metrics.persisted.get(), 0);
    assert_eq!(report.lost, 0);
}

#[test]
fn test_backoff_doubles_and_caps() {
    let config = PersistenceConfig {
        retry_base_delay: Duration::from_millis(100),
        retry_max_delay: Duration::from_millis(500),
        ..PersistenceConfig::default()
    };
    assert_eq!(config.backoff(0), Duration::from_millis(100));
    assert_eq!(config.backoff(1), Duration::from_millis(200));
    assert_eq!(config.backoff(2), Duration::from_millis(400));
    assert_eq!(config.backoff(3), Duration::from_millis(500));
    assert_eq!(config.backoff(40), Duration::from_millis(500));
}

// ============================================================================
// Overflow and Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_queue_overflow_drops_oldest() {
    let store = FlakyStore::new();
    let config = PersistenceConfig {
        queue_capacity: 5,
        ..fast_config()
    };
    let (manager, metrics) = manager(store.clone(), config);

    manager.submit(batch(0..8));
    assert_eq!(manager.queue_depth(), 5);
    assert_eq!(metrics.dropped.get(), 3);

    manager.start();
    manager.shutdown(DRAIN).await;

    let rows = store.inner.query(&EventQuery::new()).unwrap();
    let mut paths: Vec<String> = rows
        .into_iter()
        .map(|r| match r.unwrap().payload {
            EventPayload::FileOp(p) => p.path,
            _ => String::new(),
        })
        .collect();
    paths.sort();
    let expected: Vec<String> = (3..8).map(|i| format!("/data/file{}.txt", i)).collect();
    assert_eq!(paths, expected);
}

#[tokio::test]
async fn test_shutdown_timeout_counts_lost_events() {
    let store = FlakyStore::new();
    *store.insert_delay.lock() = Some(Duration::from_millis(500));
    let config = PersistenceConfig {
        write_batch_max: 2,
        ..fast_config()
    };
    let (manager, metrics) = manager(store.clone(), config);

    manager.start();
    manager.submit(batch(0..6));
    tokio::time::sleep(Duration::from_millis(20)).await;

    // First chunk of 2 is inside the store; the other 4 never leave the queue
    let report = manager.shutdown(Duration::from_millis(100)).await;
    assert_eq!(report.lost, 4);
    assert_eq!(report.flushed, 0);
    assert_eq!(metrics.lost_on_shutdown.get(), 4);

    // The running insert still commits and is counted as persisted
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(store.rows(), 2);
    assert_eq!(metrics.persisted.get(), 2);
    assert_eq!(metrics.dropped.get(), 4);
    assert_eq!(report.lost + store.rows(), 6);
}

#[tokio::test]
async fn test_abandoned_insert_failure_counts_as_lost() {
    let store = FlakyStore::new();
    *store.insert_delay.lock() = Some(Duration::from_millis(300));
    store.fail_next(10);
    let config = PersistenceConfig {
        write_batch_max: 2,
        ..fast_config()
    };
    let (manager, metrics) = manager(store.clone(), config);

    manager.start();
    manager.submit(batch(0..6));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = manager.shutdown(Duration::from_millis(50)).await;
    assert_eq!(report.lost, 4);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.rows(), 0);
    assert_eq!(store.insert_calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.lost_on_shutdown.get(), 6);
    assert_eq!(metrics.dropped.get(), 6);
}

#[tokio::test]
async fn test_shutdown_during_backoff_counts_chunk_lost() {
    let store = FlakyStore::new();
    store.fail_next(1);
    let config = PersistenceConfig {
        write_batch_max: 2,
        retry_base_delay: Duration::from_secs(2),
        retry_max_delay: Duration::from_secs(2),
        ..fast_config()
    };
    let (manager, metrics) = manager(store.clone(), config);

    manager.start();
    manager.submit(batch(0..6));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = manager.shutdown(Duration::from_millis(100)).await;
    assert_eq!(report.lost, 6);
    assert_eq!(metrics.retries.get(), 1);
    assert_eq!(metrics.lost_on_shutdown.get(), 6);
    assert_eq!(store.rows(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_at_insert_boundary_counts_each_event_once() {
    // Deadlines land around the moment one insert finishes and the writer
    // takes the next chunk
    for i in 0..12u64 {
        let store = FlakyStore::new();
        *store.insert_delay.lock() = Some(Duration::from_millis(40));
        let config = PersistenceConfig {
            write_batch_max: 2,
            ..fast_config()
        };
        let (manager, metrics) = manager(store.clone(), config);

        manager.start();
        manager.submit(batch(0..6));

        let report = manager.shutdown(Duration::from_millis(30 + i * 5)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let rows = store.rows();
        assert_eq!(metrics.persisted.get(), rows, "iteration {}", i);
        assert_eq!(
            metrics.lost_on_shutdown.get() + rows,
            6,
            "iteration {}: report {:?}",
            i,
            report
        );
        assert_eq!(metrics.dropped.get(), metrics.lost_on_shutdown.get());
        assert!(report.lost <= metrics.lost_on_shutdown.get());
    }
}

#[tokio::test]
async fn test_submit_after_shutdown_is_dropped() {
    let store = FlakyStore::new();
    let (manager, metrics) = manager(store.clone(), fast_config());
    manager.start();
    manager.shutdown(DRAIN).await;

    manager.submit(batch(0..4));
    assert_eq!(metrics.dropped.get(), 4);
    assert_eq!(manager.queue_depth(), 0);
}

// ============================================================================
// Retention Tests
// ============================================================================

fn seed_ages(store: &FlakyStore, ages_days: &[i64]) {
    let now = Utc::now();
    let events: Vec<RawEvent> = ages_days
        .iter()
        .enumerate()
        .map(|(i, age)| {
            RawEvent::file_op("fs", FileAction::Create, format!("/old/file{}.txt", i))
                .at(now - ChronoDuration::days(*age))
        })
        .collect();
    store.inner.insert_batch(&events).unwrap();
}

#[tokio::test]
async fn test_cleanup_removes_only_expired_events() {
    let store = FlakyStore::new();
    seed_ages(&store, &[90, 45, 31, 29, 1, 0]);
    let (manager, metrics) = manager(store.clone(), fast_config());

    let removed = manager.run_cleanup().await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(store.rows(), 3);
    assert_eq!(metrics.cleanup_runs.get(), 1);
    assert_eq!(metrics.events_removed.get(), 3);

    let cutoff = Utc::now() - ChronoDuration::days(30);
    let remaining = manager.get_events(EventQuery::new()).await.unwrap();
    assert!(remaining
        .into_iter()
        .all(|e| e.unwrap().timestamp > cutoff));
}

#[tokio::test]
async fn test_cleanup_failure_is_not_fatal() {
    let store = FlakyStore::new();
    seed_ages(&store, &[60]);
    store.fail_cleanup.store(true, Ordering::SeqCst);
    let (manager, metrics) = manager(store.clone(), fast_config());

    assert!(manager.run_cleanup().await.is_err());
    assert_eq!(metrics.cleanup_failures.get(), 1);

    // next cycle succeeds
    store.fail_cleanup.store(false, Ordering::SeqCst);
    assert_eq!(manager.run_cleanup().await.unwrap(), 1);
}

#[tokio::test]
async fn test_cleanup_runs_on_start() {
    let store = FlakyStore::new();
    seed_ages(&store, &[45, 0]);
    let config = PersistenceConfig {
        retention: RetentionPolicy {
            cleanup_on_start: true,
            ..RetentionPolicy::default()
        },
        ..fast_config()
    };
    let (manager, metrics) = manager(store.clone(), config);
    manager.start();

    for _ in 0..200 {
        if metrics.cleanup_runs.get() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(metrics.cleanup_runs.get(), 1);
    assert_eq!(store.rows(), 1);

    manager.shutdown(DRAIN).await;
}

#[tokio::test]
async fn test_out_of_range_retention_keeps_job_alive() {
    let store = FlakyStore::new();
    seed_ages(&store, &[45]);
    let config = PersistenceConfig {
        retention: RetentionPolicy {
            retention_days: u32::MAX,
            cleanup_interval: Duration::MAX,
            cleanup_on_start: true,
        },
        ..fast_config()
    };
    let (manager, metrics) = manager(store.clone(), config);
    manager.start();

    for _ in 0..200 {
        if metrics.cleanup_failures.get() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(metrics.cleanup_failures.get(), 1);
    assert_eq!(metrics.cleanup_runs.get(), 0);
    assert_eq!(store.rows(), 1);

    // The job is still waiting for its next tick and writes go through
    let job_alive = manager
        .tasks
        .lock()
        .retention
        .as_ref()
        .map(|job| !job.is_finished())
        .unwrap_or(false);
    assert!(job_alive);

    manager.submit(batch(0..3));
    let report = manager.shutdown(DRAIN).await;
    assert_eq!(report.flushed, 3);
}

#[tokio::test]
async fn test_store_stats_delegates() {
    let store = FlakyStore::new();
    seed_ages(&store, &[0, 1]);
    let (manager, _metrics) = manager(store, fast_config());

    let stats = manager.store_stats().await.unwrap();
    assert_eq!(stats.row_count, 2);
}
