//! System activity monitor: user idle/return and network bursts

use std::time::Duration;

use chrono::{DateTime, Utc};
use selflow_common::{
    ActivityAction, ActivityKind, EventCallback, EventKind, EventPayload, EventSource, RawEvent,
    SourceResult, SystemActivityPayload,
};
use serde::{Deserialize, Serialize};
use sysinfo::{Networks, System};
use tracing::{debug, info};

use super::PollWorker;

const SOURCE_TAG: &str = "sys_mon";

/// Activity monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityMonitorConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Global CPU usage above this counts as user activity
    pub cpu_active_percent: f32,
    /// Seconds without activity before the user is considered away
    pub idle_threshold_secs: u64,
    /// Bytes moved between two polls that count as a network burst
    pub network_threshold_bytes: u64,
}

impl Default for ActivityMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
            cpu_active_percent: 20.0,
            idle_threshold_secs: 30,
            network_threshold_bytes: 1024 * 1024,
        }
    }
}

/// One reading of the host counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivitySample {
    pub cpu_percent: f32,
    /// Cumulative bytes sent over all interfaces
    pub bytes_sent: u64,
    /// Cumulative bytes received over all interfaces
    pub bytes_recv: u64,
}

/// Idle/active state machine over successive samples
pub(crate) struct ActivityTracker {
    config: ActivityMonitorConfig,
    last_active: DateTime<Utc>,
    idle: bool,
    previous: Option<ActivitySample>,
}

impl ActivityTracker {
    pub(crate) fn new(config: ActivityMonitorConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            last_active: now,
            idle: false,
            previous: None,
        }
    }

    pub(crate) fn observe(&mut self, sample: ActivitySample, now: DateTime<Utc>) -> Vec<RawEvent> {
        let mut events = Vec::new();

        if sample.cpu_percent > self.config.cpu_active_percent {
            if self.idle {
                self.idle = false;
                events.push(activity_event(
                    ActivityKind::Active,
                    ActivityAction::UserReturned,
                    now,
                    |_| {},
                ));
            }
            self.last_active = now;
        } else if !self.idle {
            let idle_for = (now - self.last_active).num_milliseconds().max(0) as f64 / 1000.0;
            if idle_for >= self.config.idle_threshold_secs as f64 {
                self.idle = true;
                events.push(activity_event(
                    ActivityKind::Idle,
                    ActivityAction::UserAway,
                    now,
                    |p| p.idle_secs = Some(idle_for),
                ));
            }
        }

        if let Some(prev) = self.previous {
            // Counters reset when interfaces come and go
            let sent = sample.bytes_sent.saturating_sub(prev.bytes_sent);
            let recv = sample.bytes_recv.saturating_sub(prev.bytes_recv);
            if sent + recv > self.config.network_threshold_bytes {
                events.push(activity_event(
                    ActivityKind::Network,
                    ActivityAction::HighActivity,
                    now,
                    |p| {
                        p.bytes_sent = Some(sent);
                        p.bytes_recv = Some(recv);
                    },
                ));
            }
        }
        self.previous = Some(sample);

        events
    }
}

fn activity_event<F>(
    activity: ActivityKind,
    action: ActivityAction,
    at: DateTime<Utc>,
    fill: F,
) -> RawEvent
where
    F: FnOnce(&mut SystemActivityPayload),
{
    let mut payload = SystemActivityPayload {
        activity,
        action,
        idle_secs: None,
        bytes_sent: None,
        bytes_recv: None,
    };
    fill(&mut payload);
    RawEvent::new(SOURCE_TAG, EventPayload::SystemActivity(payload)).at(at)
}

/// Host counters read through sysinfo
struct HostCounters {
    system: System,
    networks: Networks,
}

impl HostCounters {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
        }
    }

    fn sample(&mut self) -> ActivitySample {
        self.system.refresh_cpu_usage();
        self.networks.refresh(true);

        let (bytes_sent, bytes_recv) = self
            .networks
            .list()
            .values()
            .fold((0u64, 0u64), |(tx, rx), data| {
                (
                    tx.saturating_add(data.total_transmitted()),
                    rx.saturating_add(data.total_received()),
                )
            });

        ActivitySample {
            cpu_percent: self.system.global_cpu_usage(),
            bytes_sent,
            bytes_recv,
        }
    }
}

/// System activity adapter
pub struct ActivityMonitor {
    config: ActivityMonitorConfig,
    worker: Option<PollWorker>,
}

impl ActivityMonitor {
    pub fn new(config: ActivityMonitorConfig) -> Self {
        Self {
            config,
            worker: None,
        }
    }
}

impl EventSource for ActivityMonitor {
    fn name(&self) -> &str {
        SOURCE_TAG
    }

    fn kind(&self) -> EventKind {
        EventKind::SystemActivity
    }

    fn start(&mut self, callback: EventCallback) -> SourceResult<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(mut dead) = self.worker.take() {
            let _ = dead.stop();
        }

        let mut counters = HostCounters::new();
        let mut tracker = ActivityTracker::new(self.config.clone(), Utc::now());
        tracker.observe(counters.sample(), Utc::now());

        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        self.worker = Some(PollWorker::spawn(SOURCE_TAG, interval, move || {
            for event in tracker.observe(counters.sample(), Utc::now()) {
                debug!("Activity {}", event.dedup_key());
                callback(event);
            }
        })?);

        info!("System activity monitor started");
        Ok(())
    }

    fn stop(&mut self) -> SourceResult<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop()?;
            info!("System activity monitor stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.worker.as_ref().map(|w| w.is_running()).unwrap_or(false)
    }
}
