//! Retention policy and the periodic cleanup job

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::PersistenceManager;
use crate::storage::{StorageError, StorageResult};

/// Longest accepted cleanup period
pub const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(366 * 24 * 3600);

/// How long persisted events are kept
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub cleanup_interval: Duration,
    /// Run one cleanup pass as soon as persistence starts
    pub cleanup_on_start: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_interval: Duration::from_secs(24 * 3600),
            cleanup_on_start: true,
        }
    }
}

impl RetentionPolicy {
    /// Events strictly older than this are removed
    pub fn cutoff(&self, now: DateTime<Utc>) -> StorageResult<DateTime<Utc>> {
        chrono::Duration::try_days(i64::from(self.retention_days))
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| {
                StorageError::Query(format!(
                    "retention of {} days is out of range",
                    self.retention_days
                ))
            })
    }
}

/// Scheduled cleanup; a failed pass is retried at the next tick
pub(super) async fn run(manager: Arc<PersistenceManager>) {
    let policy = manager.config.retention.clone();

    if policy.cleanup_on_start {
        let _ = manager.run_cleanup().await;
    }

    let period = policy
        .cleanup_interval
        .clamp(Duration::from_secs(1), MAX_CLEANUP_INTERVAL);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = manager.run_cleanup().await;
            }
            _ = manager.retention_stop.notified() => break,
        }
    }

    debug!("Retention job stopped");
}
