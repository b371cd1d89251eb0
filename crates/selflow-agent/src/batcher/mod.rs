//! Per-source deduplication and batching
//!
//! A [`SourceBatcher`] sits between one adapter and the persistence sink.
//! `push` is synchronous and never blocks on storage: events land in a
//! bounded ring buffer (oldest dropped on overflow) after passing the dedup
//! window. A tokio task cuts the buffer into [`Batch`]es when it reaches
//! `batch_size` or when the oldest buffered event has waited
//! `batch_timeout`, whichever comes first.

mod dedup;


use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use selflow_common::{Batch, RawEvent};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::observability::{Counter, Gauge};

pub use dedup::DedupWindow;

/// Receiver of cut batches
///
/// Implementations must not block: `submit` is called from the batching loop.
pub trait BatchSink: Send + Sync {
    fn submit(&self, batch: Batch);
}

/// Batching parameters for one source
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub queue_capacity: usize,
    pub dedup_window: Duration,
    pub sweep_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout: Duration::from_millis(100),
            queue_capacity: 10_000,
            dedup_window: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Live counters for one batcher
#[derive(Debug)]
pub struct BatcherStats {
    pub captured: Counter,
    pub deduped: Counter,
    pub dropped: Counter,
    pub batches: Counter,
    pub buffered: Gauge,
}

impl BatcherStats {
    fn new() -> Self {
        Self {
            captured: Counter::new("selflow_batcher_captured_total"),
            deduped: Counter::new("selflow_batcher_deduped_total"),
            dropped: Counter::new("selflow_batcher_dropped_total"),
            batches: Counter::new("selflow_batcher_batches_total"),
            buffered: Gauge::new("selflow_batcher_buffered"),
        }
    }
}

/// Point-in-time copy of a batcher's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatcherSnapshot {
    pub source: String,
    pub captured: u64,
    pub deduped: u64,
    pub dropped: u64,
    pub batches_emitted: u64,
    pub buffered: u64,
}

struct Buffered {
    arrived: Instant,
    event: RawEvent,
}

struct State {
    ring: VecDeque<Buffered>,
    dedup: DedupWindow,
    closed: bool,
}

struct Inner {
    source: String,
    config: BatcherConfig,
    state: Mutex<State>,
    wake: Notify,
    stats: BatcherStats,
    sink: Arc<dyn BatchSink>,
}

/// Deduplicating, batching front of one event source
#[derive(Clone)]
pub struct SourceBatcher {
    inner: Arc<Inner>,
}

impl SourceBatcher {
    pub fn new(source: impl Into<String>, config: BatcherConfig, sink: Arc<dyn BatchSink>) -> Self {
        let state = State {
            ring: VecDeque::with_capacity(config.queue_capacity.min(1024)),
            dedup: DedupWindow::new(config.dedup_window),
            closed: false,
        };

        Self {
            inner: Arc::new(Inner {
                source: source.into(),
                config,
                state: Mutex::new(state),
                wake: Notify::new(),
                stats: BatcherStats::new(),
                sink,
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// Accept one event; callable from any thread
    pub fn push(&self, event: RawEvent) {
        let inner = &self.inner;
        inner.stats.captured.inc();

        let now = Instant::now();
        let wake = {
            let mut state = inner.state.lock();

            if state.closed {
                inner.stats.dropped.inc();
                return;
            }

            if !state.dedup.accept(event.dedup_key(), now) {
                inner.stats.deduped.inc();
                return;
            }

            if state.ring.len() >= inner.config.queue_capacity {
                state.ring.pop_front();
                inner.stats.dropped.inc();
            }

            state.ring.push_back(Buffered {
                arrived: now,
                event,
            });
            inner.stats.buffered.set(state.ring.len() as u64);

            // First event arms the timeout; a full batch is cut right away
            state.ring.len() == 1 || state.ring.len() >= inner.config.batch_size
        };

        if wake {
            inner.wake.notify_one();
        }
    }

    /// Events currently buffered
    pub fn depth(&self) -> usize {
        self.inner.state.lock().ring.len()
    }

    pub fn stats(&self) -> &BatcherStats {
        &self.inner.stats
    }

    pub fn snapshot(&self) -> BatcherSnapshot {
        let stats = &self.inner.stats;
        BatcherSnapshot {
            source: self.inner.source.clone(),
            captured: stats.captured.get(),
            deduped: stats.deduped.get(),
            dropped: stats.dropped.get(),
            batches_emitted: stats.batches.get(),
            buffered: self.depth() as u64,
        }
    }

    /// Spawn the batch-cutting loop on the current runtime
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run().await })
    }

    /// Stop accepting events; the loop flushes what is buffered and exits
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        debug!("Batcher for {} running", self.source);

        loop {
            let deadline = {
                let state = self.state.lock();
                if state.closed {
                    break;
                }
                state.ring.front().map(|b| b.arrived + self.config.batch_timeout)
            };

            self.cut_full();

            let timeout = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = timeout => {
                    self.cut_one();
                }
                _ = sweep.tick() => {
                    let removed = self.state.lock().dedup.sweep(Instant::now());
                    if removed > 0 {
                        debug!("Swept {} dedup keys for {}", removed, self.source);
                    }
                }
            }
        }

        let flushed = self.flush();
        info!(
            "Batcher for {} stopped ({} events flushed)",
            self.source, flushed
        );
    }

    /// Take up to `batch_size` events from the front of the ring
    fn take(&self, only_if_full: bool) -> Option<Batch> {
        let events: Vec<RawEvent> = {
            let mut state = self.state.lock();
            let size = self.config.batch_size.max(1);
            if state.ring.is_empty() || (only_if_full && state.ring.len() < size) {
                return None;
            }
            let n = size.min(state.ring.len());
            let events = state.ring.drain(..n).map(|b| b.event).collect();
            self.stats.buffered.set(state.ring.len() as u64);
            events
        };
        Batch::new(self.source.clone(), events)
    }

    fn emit(&self, batch: Batch) {
        debug!("Cut batch of {} from {}", batch.len(), self.source);
        self.stats.batches.inc();
        self.sink.submit(batch);
    }

    fn cut_full(&self) {
        while let Some(batch) = self.take(true) {
            self.emit(batch);
        }
    }

    fn cut_one(&self) {
        if let Some(batch) = self.take(false) {
            self.emit(batch);
        }
    }

    /// Hand everything still buffered to the sink
    fn flush(&self) -> usize {
        let mut flushed = 0;
        while let Some(batch) = self.take(false) {
            flushed += batch.len();
            self.emit(batch);
        }
        if self.stats.dropped.get() > 0 {
            warn!(
                "Batcher for {} dropped {} events on overflow",
                self.source,
                self.stats.dropped.get()
            );
        }
        flushed
    }
}
