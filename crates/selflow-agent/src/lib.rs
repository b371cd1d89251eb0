//! selflow-agent library
//!
//! Provides the capture pipeline behind the selflow daemon: source adapters
//! feed per-source batchers, which feed a single persistence writer in front
//! of an embedded event store.

pub mod batcher;
pub mod config;
pub mod coordinator;
pub mod observability;
pub mod persistence;
pub mod sources;
pub mod storage;

pub use batcher::{BatchSink, BatcherConfig, SourceBatcher};
pub use config::{CaptureConfig, ConfigError};
pub use coordinator::{CaptureCoordinator, CaptureError, CaptureStats, ShutdownReport, SourceStats};
pub use observability::PipelineMetrics;
pub use persistence::{PersistenceConfig, PersistenceManager, RetentionPolicy};
pub use sources::{ActivityMonitor, AppMonitor, FsWatcher};
pub use storage::{EventStore, Storage, StorageConfig, StorageError};
