//! Rolling deduplication window keyed by [`DedupKey`]

use std::collections::HashMap;
use std::time::Duration;

use selflow_common::DedupKey;
use tokio::time::Instant;

/// Remembers when each key was last accepted
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    accepted: HashMap<DedupKey, Instant>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            accepted: HashMap::new(),
        }
    }

    /// Record `key` at `now` unless it was accepted less than one window ago.
    ///
    /// Returns `false` for a duplicate. Duplicates do not extend the window, so
    /// a steady stream of identical events is let through once per window.
    pub fn accept(&mut self, key: DedupKey, now: Instant) -> bool {
        if let Some(last) = self.accepted.get(&key) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        self.accepted.insert(key, now);
        true
    }

    /// Forget keys older than twice the window, returning how many were removed
    pub fn sweep(&mut self, now: Instant) -> usize {
        let horizon = self.window * 2;
        let before = self.accepted.len();
        self.accepted
            .retain(|_, last| now.saturating_duration_since(*last) <= horizon);
        before - self.accepted.len()
    }

    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }
}
