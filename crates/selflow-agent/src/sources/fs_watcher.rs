//! Filesystem watcher built on `notify`

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind as NotifyKind, RecommendedWatcher, RecursiveMode, Watcher};
use selflow_common::{
    EventCallback, EventKind, EventPayload, EventSource, FileAction, FileOpPayload, RawEvent,
    SourceError, SourceResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::filters::{IgnoreRules, DEFAULT_IGNORE_DIRS, DEFAULT_IGNORE_EXTENSIONS};

const SOURCE_TAG: &str = "fs";

/// Filesystem watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsWatcherConfig {
    pub enabled: bool,
    /// Roots watched recursively (defaults to the home directory)
    pub watch_paths: Vec<PathBuf>,
    pub ignore_extensions: Vec<String>,
    pub ignore_dirs: Vec<String>,
    pub ignore_hidden: bool,
    /// Extra glob patterns matched against the full path
    pub ignore_globs: Vec<String>,
}

impl Default for FsWatcherConfig {
    fn default() -> Self {
        let home = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf());
        Self {
            enabled: true,
            watch_paths: home.into_iter().collect(),
            ignore_extensions: DEFAULT_IGNORE_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            ignore_dirs: DEFAULT_IGNORE_DIRS.iter().map(|s| s.to_string()).collect(),
            ignore_hidden: true,
            ignore_globs: Vec::new(),
        }
    }
}

impl FsWatcherConfig {
    pub fn ignore_rules(&self) -> SourceResult<IgnoreRules> {
        IgnoreRules::new(
            &self.ignore_extensions,
            &self.ignore_dirs,
            self.ignore_hidden,
            &self.ignore_globs,
        )
    }
}

/// Translate one notify event into zero or more file events
///
/// Directory-only changes and ignored paths produce nothing.
pub(crate) fn translate(event: &Event, rules: &IgnoreRules) -> Vec<RawEvent> {
    let keep = |p: &Path| !rules.is_ignored(p) && !p.is_dir();
    let file_event = |action: FileAction, path: &Path| {
        RawEvent::new(
            SOURCE_TAG,
            EventPayload::FileOp(FileOpPayload::new(action, path.to_string_lossy())),
        )
    };

    match event.kind {
        NotifyKind::Create(_) => event
            .paths
            .iter()
            .filter(|p| keep(p))
            .map(|p| file_event(FileAction::Create, p))
            .collect(),
        NotifyKind::Remove(_) => event
            .paths
            .iter()
            .filter(|p| !rules.is_ignored(p))
            .map(|p| file_event(FileAction::Delete, p))
            .collect(),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            let (from, to) = (&event.paths[0], &event.paths[1]);
            if rules.is_ignored(from) && rules.is_ignored(to) {
                return Vec::new();
            }
            let payload = FileOpPayload::new(FileAction::Move, from.to_string_lossy())
                .with_dest(to.to_string_lossy());
            vec![RawEvent::new(SOURCE_TAG, EventPayload::FileOp(payload))]
        }
        // Unpaired rename halves: the old name is gone, the new one appeared
        NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .filter(|p| !rules.is_ignored(p))
            .map(|p| file_event(FileAction::Delete, p))
            .collect(),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .filter(|p| keep(p))
            .map(|p| file_event(FileAction::Create, p))
            .collect(),
        NotifyKind::Modify(ModifyKind::Data(_))
        | NotifyKind::Modify(ModifyKind::Any)
        | NotifyKind::Modify(ModifyKind::Other) => event
            .paths
            .iter()
            .filter(|p| keep(p))
            .map(|p| file_event(FileAction::Modify, p))
            .collect(),
        _ => Vec::new(),
    }
}

/// Recursive filesystem watcher adapter
pub struct FsWatcher {
    config: FsWatcherConfig,
    rules: IgnoreRules,
    watcher: Option<RecommendedWatcher>,
    running: Arc<AtomicBool>,
}

impl FsWatcher {
    pub fn new(config: FsWatcherConfig) -> SourceResult<Self> {
        let rules = config.ignore_rules()?;
        Ok(Self {
            config,
            rules,
            watcher: None,
            running: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl EventSource for FsWatcher {
    fn name(&self) -> &str {
        SOURCE_TAG
    }

    fn kind(&self) -> EventKind {
        EventKind::FileOp
    }

    fn start(&mut self, callback: EventCallback) -> SourceResult<()> {
        if self.is_running() {
            return Ok(());
        }
        self.watcher = None;

        let rules = self.rules.clone();
        let running = Arc::clone(&self.running);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for raw in translate(&event, &rules) {
                    callback(raw);
                }
            }
            Err(e) => {
                // Backend errors (e.g. inotify queue overflow) leave the watch unusable
                warn!("Filesystem watcher error: {}", e);
                if matches!(e.kind, notify::ErrorKind::MaxFilesWatch | notify::ErrorKind::Io(_)) {
                    running.store(false, Ordering::SeqCst);
                }
            }
        })
        .map_err(|e| SourceError::InitializationFailed(format!("watcher: {}", e)))?;

        let mut watched = 0usize;
        for root in &self.config.watch_paths {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => {
                    watched += 1;
                    debug!("Watching {}", root.display());
                }
                Err(e) => warn!("Cannot watch {}: {}", root.display(), e),
            }
        }

        if watched == 0 {
            return Err(SourceError::InitializationFailed(
                "no watch path could be registered".to_string(),
            ));
        }

        self.watcher = Some(watcher);
        self.running.store(true, Ordering::SeqCst);
        info!("Filesystem watcher started on {} path(s)", watched);
        Ok(())
    }

    fn stop(&mut self) -> SourceResult<()> {
        // Dropping the watcher unregisters every watch
        if self.watcher.take().is_some() {
            info!("Filesystem watcher stopped");
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
