//! Event types for file, application, and system activity capture

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a captured event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Filesystem operation
    FileOp,
    /// Application lifecycle transition
    AppEvent,
    /// System-wide activity burst or idle transition
    SystemActivity,
}

impl EventKind {
    /// Stable string form used in storage and queries
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FileOp => "file_op",
            EventKind::AppEvent => "app_event",
            EventKind::SystemActivity => "system_activity",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_op" => Ok(EventKind::FileOp),
            "app_event" => Ok(EventKind::AppEvent),
            "system_activity" => Ok(EventKind::SystemActivity),
            other => Err(EventError::UnknownKind(other.to_string())),
        }
    }
}

/// File operation type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
    Move,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Modify => "modify",
            FileAction::Delete => "delete",
            FileAction::Move => "move",
        }
    }
}

/// Application lifecycle transition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AppAction {
    Launch,
    Close,
    Focus,
}

impl AppAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppAction::Launch => "launch",
            AppAction::Close => "close",
            AppAction::Focus => "focus",
        }
    }
}

/// Kind of system-wide activity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Active,
    Idle,
    Network,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Active => "active",
            ActivityKind::Idle => "idle",
            ActivityKind::Network => "network",
        }
    }
}

/// What happened for a system activity event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    UserReturned,
    UserAway,
    HighActivity,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::UserReturned => "user_returned",
            ActivityAction::UserAway => "user_away",
            ActivityAction::HighActivity => "high_activity",
        }
    }
}

/// Filesystem operation payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileOpPayload {
    pub action: FileAction,
    /// Full source path
    pub path: String,
    /// File name component
    pub name: String,
    /// Lower-cased extension including the leading dot, empty if none
    pub ext: String,
    /// Parent directory
    pub dir: String,
    /// Destination path for moves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

impl FileOpPayload {
    /// Build a payload, deriving name/ext/dir from the path
    pub fn new(action: FileAction, path: impl Into<String>) -> Self {
        let path = path.into();
        let p = Path::new(&path);
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = p
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        let dir = p
            .parent()
            .map(|d| d.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            action,
            path,
            name,
            ext,
            dir,
            dest: None,
        }
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }
}

/// Application lifecycle payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppEventPayload {
    pub action: AppAction,
    pub app: String,
    /// Seconds the application was observed running (set on close)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

/// System activity payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemActivityPayload {
    pub activity: ActivityKind,
    pub action: ActivityAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_recv: Option<u64>,
}

/// Kind-specific event payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    FileOp(FileOpPayload),
    AppEvent(AppEventPayload),
    SystemActivity(SystemActivityPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::FileOp(_) => EventKind::FileOp,
            EventPayload::AppEvent(_) => EventKind::AppEvent,
            EventPayload::SystemActivity(_) => EventKind::SystemActivity,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            EventPayload::FileOp(p) => p.action.as_str(),
            EventPayload::AppEvent(p) => p.action.as_str(),
            EventPayload::SystemActivity(p) => p.action.as_str(),
        }
    }
}

/// Errors raised while building or decoding events
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EventError {
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    #[error("Malformed event: {0}")]
    Malformed(String),
}

/// Key identifying logically identical events within the dedup window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A captured activity event prior to deduplication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub timestamp: DateTime<Utc>,
    /// Tag of the adapter that produced the event (e.g. "fs")
    pub source: String,
    pub payload: EventPayload,
}

impl RawEvent {
    /// Create an event stamped with the current time
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Shorthand for a filesystem event
    pub fn file_op(source: impl Into<String>, action: FileAction, path: impl Into<String>) -> Self {
        Self::new(source, EventPayload::FileOp(FileOpPayload::new(action, path)))
    }

    /// Shorthand for an application event
    pub fn app_event(source: impl Into<String>, action: AppAction, app: impl Into<String>) -> Self {
        Self::new(
            source,
            EventPayload::AppEvent(AppEventPayload {
                action,
                app: app.into(),
                duration_secs: None,
            }),
        )
    }

    /// Shorthand for a system activity event without extra measurements
    pub fn system_activity(
        source: impl Into<String>,
        activity: ActivityKind,
        action: ActivityAction,
    ) -> Self {
        Self::new(
            source,
            EventPayload::SystemActivity(SystemActivityPayload {
                activity,
                action,
                idle_secs: None,
                bytes_sent: None,
                bytes_recv: None,
            }),
        )
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn action(&self) -> &'static str {
        self.payload.action()
    }

    /// Deduplication key for this event
    pub fn dedup_key(&self) -> DedupKey {
        let key = match &self.payload {
            EventPayload::FileOp(p) => format!("file_op:{}:{}", p.action.as_str(), p.path),
            EventPayload::AppEvent(p) => format!("app_event:{}:{}", p.action.as_str(), p.app),
            EventPayload::SystemActivity(p) => format!(
                "system_activity:{}:{}",
                p.activity.as_str(),
                p.action.as_str()
            ),
        };
        DedupKey(key)
    }

    /// Check the fixed field set before the event is written
    pub fn validate(&self) -> Result<(), EventError> {
        if self.source.trim().is_empty() {
            return Err(EventError::Malformed("empty source tag".to_string()));
        }

        match &self.payload {
            EventPayload::FileOp(p) => {
                if p.path.is_empty() {
                    return Err(EventError::Malformed("file event without path".to_string()));
                }
                if matches!(p.dest.as_deref(), Some("")) {
                    return Err(EventError::Malformed("move with empty destination".to_string()));
                }
            }
            EventPayload::AppEvent(p) => {
                if p.app.trim().is_empty() {
                    return Err(EventError::Malformed("app event without app name".to_string()));
                }
                if let Some(d) = p.duration_secs {
                    if !d.is_finite() || d < 0.0 {
                        return Err(EventError::Malformed(format!("invalid duration {}", d)));
                    }
                }
            }
            EventPayload::SystemActivity(p) => {
                if let Some(idle) = p.idle_secs {
                    if !idle.is_finite() || idle < 0.0 {
                        return Err(EventError::Malformed(format!("invalid idle time {}", idle)));
                    }
                }
            }
        }

        Ok(())
    }

    /// Timestamp as microseconds since the Unix epoch
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.timestamp_micros()
    }
}

/// Convert microseconds since the epoch back into a UTC timestamp
pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Immutable, non-empty run of events from one source, in capture order
#[derive(Debug, Clone)]
pub struct Batch {
    source: String,
    events: Vec<RawEvent>,
}

impl Batch {
    /// Returns `None` for an empty event list
    pub fn new(source: impl Into<String>, events: Vec<RawEvent>) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        Some(Self {
            source: source.into(),
            events,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<RawEvent> {
        self.events
    }
}

/// An event as stored in the embedded database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedEvent {
    /// Monotonic row id
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub action: String,
    pub source: String,
    pub payload: EventPayload,
    pub content_hash: String,
    /// Whether the payload was stored compressed
    pub compressed: bool,
}

/// Default number of rows returned by a query
pub const DEFAULT_QUERY_LIMIT: usize = 1000;

/// Filter for reading persisted events
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    /// Inclusive lower bound
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub end: Option<DateTime<Utc>>,
    pub kind: Option<EventKind>,
    pub source: Option<String>,
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            kind: None,
            source: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}
