//! Bounded FIFO of events waiting for the writer

use std::collections::VecDeque;

use parking_lot::Mutex;
use selflow_common::RawEvent;
use tokio::sync::Notify;

struct QueueState {
    events: VecDeque<RawEvent>,
    closed: bool,
}

/// Multi-producer, single-consumer event queue with drop-oldest overflow
pub(crate) struct PersistQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl PersistQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    /// Append events in order, returning how many were dropped
    ///
    /// On overflow the oldest queued events go first. After `close` every
    /// pushed event is dropped.
    pub(crate) fn push_all(&self, events: Vec<RawEvent>) -> usize {
        let mut dropped = 0;
        {
            let mut state = self.state.lock();
            if state.closed {
                return events.len();
            }
            for event in events {
                if state.events.len() >= self.capacity {
                    state.events.pop_front();
                    dropped += 1;
                }
                state.events.push_back(event);
            }
        }
        self.ready.notify_one();
        dropped
    }

    /// Wait for events and take up to `max` of them
    ///
    /// Returns `None` once the queue is closed and empty.
    pub(crate) async fn next(&self, max: usize) -> Option<Vec<RawEvent>> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.events.is_empty() {
                    let n = max.max(1).min(state.events.len());
                    return Some(state.events.drain(..n).collect());
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_one();
    }

    /// Remove everything still queued, returning the count
    pub(crate) fn discard_all(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.events.len();
        state.events.clear();
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
