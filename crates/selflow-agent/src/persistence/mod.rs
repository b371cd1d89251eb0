//! Persistence manager: the single writer in front of the event store
//!
//! Batches from every source land in one bounded queue. One writer task
//! drains it in chunks of `write_batch_max`, running each store transaction
//! on the blocking pool. Transient store failures are retried with capped
//! exponential backoff; everything else is counted and logged, never
//! surfaced to producers.

mod queue;
mod retention;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use selflow_common::{Batch, EventQuery, PersistedEvent, RawEvent};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batcher::BatchSink;
use crate::observability::PipelineMetrics;
use crate::storage::{EventStore, InsertOutcome, StorageError, StorageResult, StoreStats};

use queue::PersistQueue;

pub use retention::{RetentionPolicy, MAX_CLEANUP_INTERVAL};

/// Persistence manager configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Queue capacity, counted in events
    pub queue_capacity: usize,
    /// Most events written in one transaction
    pub write_batch_max: usize,
    /// Retries after the first failed attempt
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retention: RetentionPolicy,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            write_batch_max: 100,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            retention: RetentionPolicy::default(),
        }
    }
}

impl PersistenceConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

/// What happened during [`PersistenceManager::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Events the writer accounted for while draining
    pub flushed: u64,
    /// Events never handed to the store before the timeout hit
    pub lost: u64,
}

/// The chunk the writer currently owns
#[derive(Default)]
struct InFlight {
    events: usize,
    /// A blocking insert for this chunk is running and will settle it
    writing: bool,
    /// The writer was aborted; a failing insert must account for its chunk
    abandoned: bool,
}

#[derive(Default)]
struct Tasks {
    writer: Option<JoinHandle<()>>,
    retention: Option<JoinHandle<()>>,
}

/// Owner of the event store and its single write path
pub struct PersistenceManager {
    store: Arc<dyn EventStore>,
    config: PersistenceConfig,
    queue: PersistQueue,
    metrics: Arc<PipelineMetrics>,
    tasks: Mutex<Tasks>,
    retention_stop: Notify,
    in_flight: Mutex<InFlight>,
}

impl PersistenceManager {
    pub fn new(
        store: Arc<dyn EventStore>,
        config: PersistenceConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: PersistQueue::new(config.queue_capacity),
            store,
            config,
            metrics,
            tasks: Mutex::new(Tasks::default()),
            retention_stop: Notify::new(),
            in_flight: Mutex::new(InFlight::default()),
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Spawn the writer and retention tasks; a second call is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.writer.is_some() {
            return;
        }

        let writer = Arc::clone(self);
        tasks.writer = Some(tokio::spawn(async move { writer.write_loop().await }));

        let cleaner = Arc::clone(self);
        tasks.retention = Some(tokio::spawn(retention::run(cleaner)));

        info!(
            "Persistence started (queue {} events, {} per write, retention {} days)",
            self.queue.capacity(),
            self.config.write_batch_max,
            self.config.retention.retention_days
        );
    }

    /// Enqueue events without a batch wrapper
    pub fn submit_events(&self, events: Vec<RawEvent>) {
        let count = events.len() as u64;
        let dropped = self.queue.push_all(events) as u64;
        self.metrics.enqueued.inc_by(count);
        self.metrics.persist_queue_depth.set(self.queue.len() as u64);

        if dropped > 0 {
            self.metrics.dropped.inc_by(dropped);
            warn!("Persistence queue full or closed, dropped {} events", dropped);
        }
    }

    /// Events waiting for the writer
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    async fn write_loop(self: Arc<Self>) {
        while let Some(events) = self.queue.next(self.config.write_batch_max).await {
            self.metrics.persist_queue_depth.set(self.queue.len() as u64);
            self.write_with_retry(events).await;
        }
        debug!("Persistence writer finished");
    }

    async fn write_with_retry(self: &Arc<Self>, events: Vec<RawEvent>) {
        let count = events.len();
        let events = Arc::new(events);
        let mut attempt: u32 = 0;

        loop {
            // Hand the chunk to the insert in one step, so shutdown sees it
            // either as waiting (and counts it) or as being written
            {
                let mut flight = self.in_flight.lock();
                if attempt == 0 {
                    flight.events = count;
                }
                if flight.abandoned {
                    let lost = std::mem::take(&mut flight.events);
                    self.record_lost(lost, "writer abandoned");
                    return;
                }
                flight.writing = true;
            }

            let manager = Arc::clone(self);
            let batch = Arc::clone(&events);
            let timer = self.metrics.write_timer();

            // The insert cannot be cancelled once started, so it settles its
            // own outcome even if the writer is aborted meanwhile
            let result = tokio::task::spawn_blocking(move || {
                let result = manager.store.insert_batch(&batch);
                manager.settle(&result, batch.len(), timer.stop());
                result
            })
            .await
            .unwrap_or_else(|e| {
                self.in_flight.lock().writing = false;
                Err(StorageError::Query(format!("write task failed: {}", e)))
            });

            match result {
                Ok(_) => return,
                Err(e) if e.is_transient() && attempt < self.config.retry_attempts => {
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    self.metrics.retries.inc();
                    warn!(
                        "Transient store error (attempt {}/{}), retrying in {:?}: {}",
                        attempt,
                        self.config.retry_attempts + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let mut flight = self.in_flight.lock();
                    let owned = std::mem::take(&mut flight.events) as u64;
                    if owned > 0 {
                        self.metrics.dropped.inc_by(owned);
                        error!(
                            "Dropping batch of {} events after {} attempt(s): {}",
                            owned,
                            attempt + 1,
                            e
                        );
                    }
                    return;
                }
            }
        }
    }

    /// Account for a finished insert; runs on the blocking pool
    fn settle(&self, result: &StorageResult<InsertOutcome>, count: usize, elapsed: Duration) {
        let mut flight = self.in_flight.lock();
        flight.writing = false;

        match result {
            Ok(outcome) => {
                flight.events = 0;
                self.record(outcome, elapsed);
            }
            Err(e) if flight.abandoned => {
                flight.events = 0;
                self.record_lost(count, &e.to_string());
            }
            Err(_) => {}
        }
    }

    /// Count a chunk that no writer is left to retry
    fn record_lost(&self, count: usize, reason: &str) {
        if count == 0 {
            return;
        }
        self.metrics.lost_on_shutdown.inc_by(count as u64);
        self.metrics.dropped.inc_by(count as u64);
        warn!("{} events lost after shutdown: {}", count, reason);
    }

    fn record(&self, outcome: &InsertOutcome, elapsed: Duration) {
        let m = &self.metrics;
        m.persisted.inc_by(outcome.inserted_ids.len() as u64);
        m.duplicates.inc_by(outcome.duplicates as u64);
        m.write_errors.inc_by(outcome.rejected.len() as u64);
        m.batches_written.inc();

        for row in &outcome.rejected {
            warn!("Skipped unwritable event #{}: {}", row.index, row.reason);
        }

        debug!(
            "Wrote {} events ({} duplicate, {} rejected) in {:?}",
            outcome.inserted_ids.len(),
            outcome.duplicates,
            outcome.rejected.len(),
            elapsed
        );
    }

    /// Delete events past the retention window now
    pub async fn run_cleanup(&self) -> StorageResult<usize> {
        let cutoff = match self.config.retention.cutoff(Utc::now()) {
            Ok(cutoff) => cutoff,
            Err(e) => {
                self.metrics.cleanup_failures.inc();
                error!("Retention cleanup skipped: {}", e);
                return Err(e);
            }
        };
        let store = Arc::clone(&self.store);

        let result = tokio::task::spawn_blocking(move || {
            let removed = store.delete_older_than(cutoff)?;
            let stats = store.stats()?;
            Ok::<_, StorageError>((removed, stats))
        })
        .await
        .unwrap_or_else(|e| Err(StorageError::Query(format!("cleanup task failed: {}", e))));

        match result {
            Ok((removed, stats)) => {
                self.metrics.cleanup_runs.inc();
                self.metrics.events_removed.inc_by(removed as u64);
                info!(
                    "Retention cleanup removed {} events older than {} ({} rows, {} bytes remain)",
                    removed,
                    cutoff.format("%Y-%m-%d %H:%M:%S"),
                    stats.row_count,
                    stats.size_bytes
                );
                Ok(removed)
            }
            Err(e) => {
                self.metrics.cleanup_failures.inc();
                error!("Retention cleanup failed, will retry next interval: {}", e);
                Err(e)
            }
        }
    }

    /// Read events, newest first
    pub async fn get_events(
        &self,
        query: EventQuery,
    ) -> StorageResult<Vec<StorageResult<PersistedEvent>>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.query(&query))
            .await
            .unwrap_or_else(|e| Err(StorageError::Query(format!("query task failed: {}", e))))
    }

    pub async fn store_stats(&self) -> StorageResult<StoreStats> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.stats())
            .await
            .unwrap_or_else(|e| Err(StorageError::Query(format!("stats task failed: {}", e))))
    }

    /// Close the queue and let the writer drain for at most `timeout`
    ///
    /// Events still queued, or waiting out a retry backoff, are counted as
    /// lost. An insert already running finishes on the blocking pool and
    /// accounts for its own chunk.
    pub async fn shutdown(&self, timeout: Duration) -> DrainReport {
        let handled_before = self.handled();
        self.queue.close();
        self.retention_stop.notify_one();

        let (writer, retention) = {
            let mut tasks = self.tasks.lock();
            (tasks.writer.take(), tasks.retention.take())
        };

        let mut lost = 0u64;
        if let Some(mut writer) = writer {
            if tokio::time::timeout(timeout, &mut writer).await.is_err() {
                writer.abort();
                // Abort lands at the writer's next await; wait for it so the
                // in-flight state below can only change through `settle`
                let _ = writer.await;
                let mut flight = self.in_flight.lock();
                flight.abandoned = true;
                if flight.writing {
                    warn!(
                        "Persistence did not drain within {:?}, {} events still being written",
                        timeout, flight.events
                    );
                } else {
                    lost += std::mem::take(&mut flight.events) as u64;
                    warn!("Persistence did not drain within {:?}", timeout);
                }
            }
        }
        if let Some(retention) = retention {
            retention.abort();
        }

        lost += self.queue.discard_all() as u64;
        self.metrics.persist_queue_depth.set(0);

        if lost > 0 {
            self.metrics.lost_on_shutdown.inc_by(lost);
            self.metrics.dropped.inc_by(lost);
            warn!("{} events lost on shutdown", lost);
        }

        let report = DrainReport {
            flushed: self.handled().saturating_sub(handled_before),
            lost,
        };
        info!(
            "Persistence stopped ({} flushed, {} lost)",
            report.flushed, report.lost
        );
        report
    }

    /// Events the writer has fully accounted for
    fn handled(&self) -> u64 {
        let m = &self.metrics;
        m.persisted.get() + m.duplicates.get() + m.write_errors.get()
    }
}

impl BatchSink for PersistenceManager {
    fn submit(&self, batch: Batch) {
        self.submit_events(batch.into_events());
    }
}
