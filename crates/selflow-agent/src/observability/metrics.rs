//! Internal metrics for the capture pipeline
//!
//! Lock-free counters, gauges and histograms, grouped into one
//! [`PipelineMetrics`] instance that the coordinator owns and hands out by
//! `Arc`. There is no process-wide registry: two coordinators in one process
//! (as in tests) never share counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Counter metric - monotonically increasing value
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    pub fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        self.name
    }
}

/// Gauge metric - value that can go up and down
#[derive(Debug)]
pub struct Gauge {
    value: AtomicU64,
    name: &'static str,
}

impl Gauge {
    pub fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        self.name
    }
}

/// Gauge holding a floating point value (stored as raw bits)
#[derive(Debug)]
pub struct FloatGauge {
    bits: AtomicU64,
}

impl FloatGauge {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

impl Default for FloatGauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Histogram for tracking distributions of values
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given upper bucket bounds
    pub fn new(name: &'static str, buckets: Vec<f64>) -> Self {
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();

        Self {
            name,
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Create a histogram with default latency buckets (in milliseconds)
    pub fn with_latency_buckets(name: &'static str) -> Self {
        Self::new(
            name,
            vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0],
        )
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // Sum kept in thousandths for precision
        self.sum.fetch_add((value * 1000.0) as u64, Ordering::Relaxed);

        let slot = self
            .buckets
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.buckets.len());
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
    }

    /// Observe a duration in milliseconds
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum in the original unit
    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn average(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() / count as f64
        }
    }

    /// Per-bucket counts; the final entry is the overflow bucket
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count(),
            sum: self.sum(),
            average: self.average(),
        }
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    histogram: Arc<Histogram>,
}

impl Timer {
    pub fn new(histogram: Arc<Histogram>) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    /// Stop the timer and record the elapsed time
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        self.histogram.observe_duration(elapsed);
        elapsed
    }
}

/// Snapshot of histogram data
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub average: f64,
}

/// Counters shared by the persistence manager, supervisor and sampler.
///
/// Batcher-side counts (captured, deduped, ring overflow) live with each
/// batcher; the coordinator sums both when building a stats snapshot.
#[derive(Debug)]
pub struct PipelineMetrics {
    /// Events accepted into the persistence queue
    pub enqueued: Counter,
    /// Events written as new rows
    pub persisted: Counter,
    /// Events already present in the store
    pub duplicates: Counter,
    /// Events lost in persistence: queue overflow, exhausted retries, shutdown
    pub dropped: Counter,
    /// Rows rejected as permanently unwritable
    pub write_errors: Counter,
    /// Transient failures that were retried
    pub retries: Counter,
    pub batches_written: Counter,
    pub lost_on_shutdown: Counter,
    pub cleanup_runs: Counter,
    pub cleanup_failures: Counter,
    pub events_removed: Counter,
    pub source_restarts: Counter,
    pub persist_queue_depth: Gauge,
    /// Persisted events per second over the last sampling interval
    pub throughput: FloatGauge,
    pub write_latency_ms: Arc<Histogram>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            enqueued: Counter::new("selflow_persist_enqueued_total"),
            persisted: Counter::new("selflow_events_persisted_total"),
            duplicates: Counter::new("selflow_events_duplicate_total"),
            dropped: Counter::new("selflow_persist_dropped_total"),
            write_errors: Counter::new("selflow_write_errors_total"),
            retries: Counter::new("selflow_write_retries_total"),
            batches_written: Counter::new("selflow_batches_written_total"),
            lost_on_shutdown: Counter::new("selflow_lost_on_shutdown_total"),
            cleanup_runs: Counter::new("selflow_cleanup_runs_total"),
            cleanup_failures: Counter::new("selflow_cleanup_failures_total"),
            events_removed: Counter::new("selflow_events_removed_total"),
            source_restarts: Counter::new("selflow_source_restarts_total"),
            persist_queue_depth: Gauge::new("selflow_persist_queue_depth"),
            throughput: FloatGauge::new(),
            write_latency_ms: Arc::new(Histogram::with_latency_buckets(
                "selflow_write_latency_ms",
            )),
        }
    }

    /// Start timing one store write
    pub fn write_timer(&self) -> Timer {
        Timer::new(Arc::clone(&self.write_latency_ms))
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
