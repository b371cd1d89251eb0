//! Event source adapters
//!
//! Each adapter implements [`EventSource`] and pushes [`RawEvent`]s into the
//! callback it was started with. Filtering happens here, before an event is
//! constructed, so batchers only ever see meaningful events.
//!
//! - [`FsWatcher`]: recursive filesystem watch via `notify`
//! - [`AppMonitor`]: user application launch/close via `sysinfo`
//! - [`ActivityMonitor`]: idle/active and network bursts via `sysinfo`
//!
//! [`RawEvent`]: selflow_common::RawEvent

mod activity_monitor;
mod app_monitor;
mod filters;
mod fs_watcher;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use selflow_common::{SourceError, SourceResult};

pub use activity_monitor::{ActivityMonitor, ActivityMonitorConfig, ActivitySample};
pub use app_monitor::{AppMonitor, AppMonitorConfig, DEFAULT_APP_PATTERNS};
pub use filters::{IgnoreRules, DEFAULT_IGNORE_DIRS, DEFAULT_IGNORE_EXTENSIONS};
pub use fs_watcher::{FsWatcher, FsWatcherConfig};
pub use selflow_common::{EventCallback, EventSource};

/// Clears the running flag when dropped, including on panic unwind
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Background thread that runs `tick` at a fixed interval until stopped
pub(crate) struct PollWorker {
    running: Arc<AtomicBool>,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PollWorker {
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> SourceResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let flag = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name(format!("selflow-{}", name))
            .spawn(move || {
                let _guard = RunningGuard(flag);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => tick(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| SourceError::InitializationFailed(format!("spawn {}: {}", name, e)))?;

        Ok(Self {
            running,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the thread and wait for it; a panicked thread is reported
    pub(crate) fn stop(&mut self) -> SourceResult<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| SourceError::Internal("poll thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
