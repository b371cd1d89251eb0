//! Source adapter abstraction for event capture
//!
//! Every producer of raw events (filesystem watcher, application monitor,
//! system activity monitor) implements [`EventSource`]. Adapters push events
//! through a callback registered at start; they never talk to storage.

use std::sync::Arc;

use thiserror::Error;

use crate::events::{EventKind, RawEvent};

/// Errors that can occur in a source adapter
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Platform not supported: {0}")]
    NotSupported(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Event collection failed: {0}")]
    CollectionFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Callback an adapter uses to hand over captured events
///
/// Must be cheap and non-blocking: it is invoked from watcher threads and
/// polling tasks.
pub type EventCallback = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// Trait for event source adapters
pub trait EventSource: Send + Sync {
    /// Source tag written into every event (e.g. "fs")
    fn name(&self) -> &str;

    /// Kind of events this source produces
    fn kind(&self) -> EventKind;

    /// Begin producing events through `callback`
    ///
    /// Calling `start` on a running source is a no-op. A source that died
    /// may be started again with a fresh callback.
    fn start(&mut self, callback: EventCallback) -> SourceResult<()>;

    /// Stop producing events. Events the adapter still holds are discarded.
    fn stop(&mut self) -> SourceResult<()>;

    /// Whether the adapter is currently producing
    fn is_running(&self) -> bool;
}
