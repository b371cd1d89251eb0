//! Capture coordinator
//!
//! Wires every source adapter to its own [`SourceBatcher`], all of them
//! feeding one [`PersistenceManager`]. Owns the lifecycle: `start` brings the
//! pipeline up, a supervisor task restarts adapters that died on their own,
//! a sampler logs throughput, and `stop` drains everything within a
//! deadline.


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use selflow_common::{EventCallback, EventQuery, EventSource, PersistedEvent, RawEvent, SourceError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batcher::{BatchSink, SourceBatcher};
use crate::config::CaptureConfig;
use crate::observability::{HistogramSnapshot, PipelineMetrics};
use crate::persistence::PersistenceManager;
use crate::sources::{ActivityMonitor, AppMonitor, FsWatcher};
use crate::storage::{EventStore, Storage, StorageError, StorageResult};

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Event store unavailable: {0}")]
    Store(#[from] StorageError),

    #[error("Source {name} failed: {source}")]
    Source {
        name: String,
        #[source]
        source: SourceError,
    },

    #[error("A source named {0} is already registered")]
    DuplicateSource(String),

    #[error("Sources cannot be registered while capture is running")]
    AlreadyRunning,

    #[error("Capture has been stopped")]
    Stopped,
}

/// Per-source view in [`CaptureStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub name: String,
    /// False for push-only producers that have no adapter to run
    pub has_adapter: bool,
    pub running: bool,
    pub restarts: u64,
    pub captured: u64,
    pub deduped: u64,
    pub dropped: u64,
    pub batches_emitted: u64,
    pub buffered: u64,
}

/// Pipeline-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub total_captured: u64,
    pub total_deduped: u64,
    /// Ring overflow, persistence overflow, failed retries and shutdown losses
    pub total_dropped: u64,
    pub total_persisted: u64,
    /// Events buffered across all source batchers
    pub queue_depth: u64,
    pub throughput_per_sec: f64,
    pub store_size_bytes: u64,
    pub total_duplicates: u64,
    pub total_write_errors: u64,
    pub total_retries: u64,
    pub lost_on_shutdown: u64,
    pub persist_queue_depth: u64,
    pub store_row_count: u64,
    pub source_restarts: u64,
    pub uptime_secs: u64,
    /// Store insert latency, one sample per attempt
    pub write_latency_ms: HistogramSnapshot,
    pub sources: Vec<SourceStats>,
}

/// Result of [`CaptureCoordinator::stop`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShutdownReport {
    /// Events written while draining
    pub flushed: u64,
    /// Events that could not be written before the deadline
    pub lost: u64,
    pub elapsed: Duration,
}

struct SourceSlot {
    name: String,
    adapter: Option<Box<dyn EventSource>>,
    batcher: SourceBatcher,
    restarts: u64,
}

impl SourceSlot {
    fn callback(&self) -> EventCallback {
        let batcher = self.batcher.clone();
        Arc::new(move |event: RawEvent| batcher.push(event))
    }

    fn is_running(&self) -> bool {
        self.adapter.as_ref().map(|a| a.is_running()).unwrap_or(false)
    }
}

#[derive(Default)]
struct Lifecycle {
    started_at: Option<Instant>,
    stop_tx: Option<watch::Sender<bool>>,
    background: Vec<JoinHandle<()>>,
    batcher_tasks: Vec<JoinHandle<()>>,
}

/// Top-level orchestrator of the capture pipeline
pub struct CaptureCoordinator {
    config: CaptureConfig,
    metrics: Arc<PipelineMetrics>,
    persistence: Arc<PersistenceManager>,
    slots: Arc<Mutex<Vec<SourceSlot>>>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl CaptureCoordinator {
    /// Open the event store; failing to open it is the only fatal error
    pub fn new(config: CaptureConfig) -> Result<Self, CaptureError> {
        let store = Storage::open(config.storage())?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Build around an already-open store
    pub fn with_store(config: CaptureConfig, store: Arc<dyn EventStore>) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let persistence =
            PersistenceManager::new(store, config.persistence(), Arc::clone(&metrics));

        Self {
            config,
            metrics,
            persistence,
            slots: Arc::new(Mutex::new(Vec::new())),
            lifecycle: Mutex::new(Lifecycle::default()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn new_batcher(&self, name: &str) -> SourceBatcher {
        let sink: Arc<dyn BatchSink> = self.persistence.clone();
        SourceBatcher::new(name, self.config.batcher(), sink)
    }

    /// Attach an adapter with its own batcher
    pub fn register(&self, source: Box<dyn EventSource>) -> Result<(), CaptureError> {
        let mut slots = self.slots.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CaptureError::Stopped);
        }
        if self.is_running() {
            return Err(CaptureError::AlreadyRunning);
        }

        let name = source.name().to_string();
        if slots.iter().any(|s| s.name == name) {
            return Err(CaptureError::DuplicateSource(name));
        }

        debug!("Registered {} source {}", source.kind(), name);
        slots.push(SourceSlot {
            batcher: self.new_batcher(&name),
            name,
            adapter: Some(source),
            restarts: 0,
        });
        Ok(())
    }

    /// Get a push callback for a collaborator that produces events itself
    ///
    /// Producers may be added while capture is running, but not after it
    /// has been stopped.
    pub fn register_producer(&self, name: &str) -> Result<EventCallback, CaptureError> {
        let mut slots = self.slots.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CaptureError::Stopped);
        }
        if slots.iter().any(|s| s.name == name) {
            return Err(CaptureError::DuplicateSource(name.to_string()));
        }

        let slot = SourceSlot {
            name: name.to_string(),
            adapter: None,
            batcher: self.new_batcher(name),
            restarts: 0,
        };
        let callback = slot.callback();

        if self.is_running() {
            let handle = slot.batcher.start();
            self.lifecycle.lock().batcher_tasks.push(handle);
        }
        slots.push(slot);
        Ok(callback)
    }

    /// Build the built-in adapters enabled in the configuration
    pub fn register_default_sources(&self) -> Result<(), CaptureError> {
        let sources = &self.config.sources;

        if sources.fs.enabled {
            let watcher = FsWatcher::new(sources.fs.clone()).map_err(|source| {
                CaptureError::Source {
                    name: "fs".to_string(),
                    source,
                }
            })?;
            self.register(Box::new(watcher))?;
        }
        if sources.apps.enabled {
            self.register(Box::new(AppMonitor::new(sources.apps.clone())))?;
        }
        if sources.activity.enabled {
            self.register(Box::new(ActivityMonitor::new(sources.activity.clone())))?;
        }
        Ok(())
    }

    /// Start persistence, batchers, adapters and the background tasks
    ///
    /// Must be called from within a tokio runtime. An adapter that fails to
    /// start is left to the supervisor. A stopped coordinator cannot be
    /// started again.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut slots = self.slots.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CaptureError::Stopped);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.persistence.start();

        let mut batcher_tasks = Vec::with_capacity(slots.len());
        for slot in slots.iter_mut() {
            batcher_tasks.push(slot.batcher.start());

            let callback = slot.callback();
            if let Some(adapter) = slot.adapter.as_mut() {
                if let Err(e) = adapter.start(callback) {
                    warn!("Source {} failed to start: {} (will retry)", slot.name, e);
                }
            }
        }
        info!("Capture started with {} source(s)", slots.len());
        drop(slots);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.started_at = Some(Instant::now());
        lifecycle.batcher_tasks.extend(batcher_tasks);
        lifecycle.background.push(tokio::spawn(supervise(
            Arc::clone(&self.slots),
            Arc::clone(&self.metrics),
            Duration::from_millis(self.config.supervisor_interval_ms.max(1)),
            stop_rx.clone(),
        )));
        lifecycle.background.push(tokio::spawn(sample_throughput(
            Arc::clone(&self.metrics),
            Duration::from_secs(self.config.stats_interval_secs.max(1)),
            stop_rx,
        )));
        lifecycle.stop_tx = Some(stop_tx);

        Ok(())
    }

    /// Stop adapters, flush batchers and drain persistence within `timeout`
    pub async fn stop(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        {
            let _slots = self.slots.lock();
            if !self.running.swap(false, Ordering::SeqCst) {
                return ShutdownReport::default();
            }
            self.stopped.store(true, Ordering::SeqCst);
        }
        info!("Stopping capture (timeout {:?})", timeout);

        let (stop_tx, background, batcher_tasks) = {
            let mut lifecycle = self.lifecycle.lock();
            (
                lifecycle.stop_tx.take(),
                std::mem::take(&mut lifecycle.background),
                std::mem::take(&mut lifecycle.batcher_tasks),
            )
        };
        if let Some(tx) = stop_tx {
            let _ = tx.send(true);
        }
        for task in background {
            let _ = task.await;
        }

        // Producers first, then the batchers they feed
        {
            let mut slots = self.slots.lock();
            for slot in slots.iter_mut() {
                if let Some(adapter) = slot.adapter.as_mut() {
                    if let Err(e) = adapter.stop() {
                        warn!("Source {} did not stop cleanly: {}", slot.name, e);
                    }
                }
                slot.batcher.close();
            }
        }

        for task in batcher_tasks {
            let remaining = timeout.saturating_sub(started.elapsed());
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!("A batcher did not flush before the shutdown deadline");
            }
        }

        let drain = self
            .persistence
            .shutdown(timeout.saturating_sub(started.elapsed()))
            .await;

        let report = ShutdownReport {
            flushed: drain.flushed,
            lost: drain.lost,
            elapsed: started.elapsed(),
        };
        info!(
            "Capture stopped in {:?}: {} flushed, {} lost",
            report.elapsed, report.flushed, report.lost
        );
        report
    }

    /// Read persisted events, newest first
    pub async fn get_events(
        &self,
        query: EventQuery,
    ) -> StorageResult<Vec<StorageResult<PersistedEvent>>> {
        self.persistence.get_events(query).await
    }

    /// Aggregate counters from every stage
    pub async fn snapshot_stats(&self) -> CaptureStats {
        let sources: Vec<SourceStats> = self
            .slots
            .lock()
            .iter()
            .map(|slot| {
                let b = slot.batcher.snapshot();
                SourceStats {
                    name: slot.name.clone(),
                    has_adapter: slot.adapter.is_some(),
                    running: slot.is_running(),
                    restarts: slot.restarts,
                    captured: b.captured,
                    deduped: b.deduped,
                    dropped: b.dropped,
                    batches_emitted: b.batches_emitted,
                    buffered: b.buffered,
                }
            })
            .collect();

        let store = match self.persistence.store_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Store stats unavailable: {}", e);
                Default::default()
            }
        };

        let m = &self.metrics;
        let uptime_secs = self
            .lifecycle
            .lock()
            .started_at
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);

        CaptureStats {
            total_captured: sources.iter().map(|s| s.captured).sum(),
            total_deduped: sources.iter().map(|s| s.deduped).sum(),
            total_dropped: sources.iter().map(|s| s.dropped).sum::<u64>() + m.dropped.get(),
            total_persisted: m.persisted.get(),
            queue_depth: sources.iter().map(|s| s.buffered).sum(),
            throughput_per_sec: m.throughput.get(),
            store_size_bytes: store.size_bytes,
            total_duplicates: m.duplicates.get(),
            total_write_errors: m.write_errors.get(),
            total_retries: m.retries.get(),
            lost_on_shutdown: m.lost_on_shutdown.get(),
            persist_queue_depth: self.persistence.queue_depth() as u64,
            store_row_count: store.row_count,
            source_restarts: m.source_restarts.get(),
            uptime_secs,
            write_latency_ms: m.write_latency_ms.snapshot(),
            sources,
        }
    }
}

/// Restart adapters that stopped without being asked to
async fn supervise(
    slots: Arc<Mutex<Vec<SourceSlot>>>,
    metrics: Arc<PipelineMetrics>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        let mut guard = slots.lock();
        for slot in guard.iter_mut() {
            if slot.adapter.is_none() || slot.is_running() {
                continue;
            }

            let callback = slot.callback();
            let name = slot.name.clone();
            if let Some(adapter) = slot.adapter.as_mut() {
                warn!("Source {} is not running, restarting", name);
                match adapter.start(callback) {
                    Ok(()) => {
                        slot.restarts += 1;
                        metrics.source_restarts.inc();
                        info!("Source {} restarted ({} restart(s))", name, slot.restarts);
                    }
                    Err(e) => warn!("Restart of {} failed: {}", name, e),
                }
            }
        }
    }
}

/// Log persisted throughput every `period`
async fn sample_throughput(
    metrics: Arc<PipelineMetrics>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut last_total = metrics.persisted.get();
    let mut last_at = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        let now = tokio::time::Instant::now();
        let total = metrics.persisted.get();
        let secs = now.duration_since(last_at).as_secs_f64();
        let rate = if secs > 0.0 {
            (total - last_total) as f64 / secs
        } else {
            0.0
        };
        metrics.throughput.set(rate);

        info!(
            "Total: {}, Rate: {:.1}/sec, Dropped: {}, Queue: {}",
            total,
            rate,
            metrics.dropped.get(),
            metrics.persist_queue_depth.get()
        );

        last_total = total;
        last_at = now;
    }
}
