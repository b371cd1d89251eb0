//! User application launch/close monitor (sysinfo polling)

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use selflow_common::{
    AppAction, AppEventPayload, EventCallback, EventKind, EventPayload, EventSource, RawEvent,
    SourceResult,
};
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info};

use super::PollWorker;

const SOURCE_TAG: &str = "app_mon";

/// Substrings identifying user-facing applications
pub const DEFAULT_APP_PATTERNS: &[&str] = &[
    "safari",
    "chrome",
    "firefox",
    "edge",
    "brave",
    "code",
    "vscode",
    "xcode",
    "pycharm",
    "intellij",
    "terminal",
    "iterm",
    "warp",
    "hyper",
    "slack",
    "discord",
    "teams",
    "zoom",
    "skype",
    "photoshop",
    "illustrator",
    "figma",
    "sketch",
    "mail",
    "outlook",
    "thunderbird",
    "notes",
    "notion",
    "obsidian",
    "bear",
    "spotify",
    "music",
    "vlc",
    "quicktime",
    "finder",
    "pathfinder",
];

/// Application monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMonitorConfig {
    pub enabled: bool,
    /// Process table polling interval
    pub poll_interval_ms: u64,
    /// Case-insensitive substrings; a process whose name contains one is a user app
    pub app_patterns: Vec<String>,
}

impl Default for AppMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 200,
            app_patterns: DEFAULT_APP_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Tracks which user apps are running and turns changes into events
pub(crate) struct AppTracker {
    patterns: Vec<String>,
    started: HashMap<String, DateTime<Utc>>,
    baseline_taken: bool,
}

impl AppTracker {
    pub(crate) fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
            started: HashMap::new(),
            baseline_taken: false,
        }
    }

    pub(crate) fn is_user_app(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }

    /// Diff the current process names against the previous poll
    ///
    /// The first call only records what is already running.
    pub(crate) fn observe<I>(&mut self, names: I, now: DateTime<Utc>) -> Vec<RawEvent>
    where
        I: IntoIterator<Item = String>,
    {
        let current: HashSet<String> = names
            .into_iter()
            .filter(|n| self.is_user_app(n))
            .collect();

        if !self.baseline_taken {
            self.baseline_taken = true;
            self.started = current.into_iter().map(|n| (n, now)).collect();
            return Vec::new();
        }

        let mut events = Vec::new();

        let mut launched: Vec<&String> = current
            .iter()
            .filter(|n| !self.started.contains_key(*n))
            .collect();
        launched.sort();
        for app in launched {
            events.push(app_event(AppAction::Launch, app, None, now));
        }

        let mut closed: Vec<String> = self
            .started
            .keys()
            .filter(|n| !current.contains(*n))
            .cloned()
            .collect();
        closed.sort();
        for app in closed {
            let duration = self
                .started
                .remove(&app)
                .map(|t| (now - t).num_milliseconds().max(0) as f64 / 1000.0);
            events.push(app_event(AppAction::Close, &app, duration, now));
        }

        for app in current {
            self.started.entry(app).or_insert(now);
        }

        events
    }
}

fn app_event(action: AppAction, app: &str, duration_secs: Option<f64>, at: DateTime<Utc>) -> RawEvent {
    RawEvent::new(
        SOURCE_TAG,
        EventPayload::AppEvent(AppEventPayload {
            action,
            app: app.to_string(),
            duration_secs,
        }),
    )
    .at(at)
}

/// Application monitor adapter
pub struct AppMonitor {
    config: AppMonitorConfig,
    worker: Option<PollWorker>,
}

impl AppMonitor {
    pub fn new(config: AppMonitorConfig) -> Self {
        Self {
            config,
            worker: None,
        }
    }

    fn process_names(system: &mut System) -> Vec<String> {
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        system
            .processes()
            .values()
            .map(|p| p.name().to_string_lossy().to_string())
            .collect()
    }
}

impl EventSource for AppMonitor {
    fn name(&self) -> &str {
        SOURCE_TAG
    }

    fn kind(&self) -> EventKind {
        EventKind::AppEvent
    }

    fn start(&mut self, callback: EventCallback) -> SourceResult<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Some(mut dead) = self.worker.take() {
            let _ = dead.stop();
        }

        let mut system = System::new();
        let mut tracker = AppTracker::new(&self.config.app_patterns);
        tracker.observe(Self::process_names(&mut system), Utc::now());

        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        self.worker = Some(PollWorker::spawn(SOURCE_TAG, interval, move || {
            let names = Self::process_names(&mut system);
            for event in tracker.observe(names, Utc::now()) {
                debug!("App {} {}", event.action(), event.dedup_key());
                callback(event);
            }
        })?);

        info!("Application monitor started");
        Ok(())
    }

    fn stop(&mut self) -> SourceResult<()> {
        if let Some(mut worker) = self.worker.take() {
            worker.stop()?;
            info!("Application monitor stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.worker.as_ref().map(|w| w.is_running()).unwrap_or(false)
    }
}
