//! Capture pipeline configuration
//!
//! Loaded from TOML with per-key defaults, then overridden from the
//! environment. Every size and interval is validated before use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batcher::BatcherConfig;
use crate::persistence::{PersistenceConfig, RetentionPolicy, MAX_CLEANUP_INTERVAL};
use crate::sources::{ActivityMonitorConfig, AppMonitorConfig, FsWatcherConfig};
use crate::storage::{StorageConfig, DEFAULT_COMPRESSION_THRESHOLD};

/// Longest accepted retention window
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Top-level capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Event store file; defaults to the platform data directory
    #[serde(default = "default_db_path")]
    pub db_path: Option<PathBuf>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Source batching
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_dedup_sweep_interval_ms")]
    pub dedup_sweep_interval_ms: u64,

    // Persistence
    #[serde(default = "default_persist_queue_capacity")]
    pub persist_queue_capacity: usize,
    #[serde(default = "default_write_batch_max")]
    pub write_batch_max: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    // Retention
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,
    #[serde(default = "default_true")]
    pub cleanup_on_start: bool,

    // Storage
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u64,
    #[serde(default = "default_store_threads")]
    pub store_threads: usize,
    #[serde(default = "default_wal_checkpoint_mb")]
    pub wal_checkpoint_mb: u64,

    // Coordinator
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,

    #[serde(default)]
    pub sources: SourcesConfig,
}

/// Per-adapter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub fs: FsWatcherConfig,
    pub apps: AppMonitorConfig,
    pub activity: ActivityMonitorConfig,
}

fn default_db_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "selflow", "selflow-agent")
        .map(|dirs| dirs.data_dir().join("events.duckdb"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_timeout_ms() -> u64 {
    100
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_dedup_window_ms() -> u64 {
    500
}

fn default_dedup_sweep_interval_ms() -> u64 {
    10_000
}

fn default_persist_queue_capacity() -> usize {
    10_000
}

fn default_write_batch_max() -> usize {
    100
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_retention_days() -> u32 {
    30
}

fn default_cleanup_interval_hours() -> u64 {
    24
}

fn default_true() -> bool {
    true
}

fn default_compression_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

fn default_cache_size_mb() -> u64 {
    256
}

fn default_store_threads() -> usize {
    2
}

fn default_wal_checkpoint_mb() -> u64 {
    16
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_stats_interval_secs() -> u64 {
    5
}

fn default_supervisor_interval_ms() -> u64 {
    1_000
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            dedup_window_ms: default_dedup_window_ms(),
            dedup_sweep_interval_ms: default_dedup_sweep_interval_ms(),
            persist_queue_capacity: default_persist_queue_capacity(),
            write_batch_max: default_write_batch_max(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retention_days: default_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            cleanup_on_start: true,
            compression_threshold_bytes: default_compression_threshold(),
            cache_size_mb: default_cache_size_mb(),
            store_threads: default_store_threads(),
            wal_checkpoint_mb: default_wal_checkpoint_mb(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            stats_interval_secs: default_stats_interval_secs(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
            sources: SourcesConfig::default(),
        }
    }
}

impl CaptureConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&contents)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let config: CaptureConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `SELFLOW_CONFIG` (if set) and apply environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SELFLOW_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SELFLOW_*` overrides from a lookup function
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("SELFLOW_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }

        if let Some(level) = lookup("SELFLOW_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(days) = lookup("SELFLOW_RETENTION_DAYS") {
            self.retention_days = days.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "SELFLOW_RETENTION_DAYS",
                reason: format!("{:?} is not a whole number of days", days),
            })?;
        }

        if let Some(paths) = lookup("SELFLOW_WATCH_PATHS") {
            self.sources.fs.watch_paths = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }

        Ok(())
    }

    /// Reject zero sizes and intervals and out-of-range retention settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 13] = [
            ("batch_size", self.batch_size as u64),
            ("batch_timeout_ms", self.batch_timeout_ms),
            ("queue_capacity", self.queue_capacity as u64),
            ("dedup_sweep_interval_ms", self.dedup_sweep_interval_ms),
            ("persist_queue_capacity", self.persist_queue_capacity as u64),
            ("write_batch_max", self.write_batch_max as u64),
            ("retry_base_delay_ms", self.retry_base_delay_ms),
            ("retention_days", u64::from(self.retention_days)),
            ("cleanup_interval_hours", self.cleanup_interval_hours),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("stats_interval_secs", self.stats_interval_secs),
            ("supervisor_interval_ms", self.supervisor_interval_ms),
            ("store_threads", self.store_threads as u64),
        ];

        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::Invalid {
                key: "retention_days",
                reason: format!("must be at most {}", MAX_RETENTION_DAYS),
            });
        }

        let max_hours = MAX_CLEANUP_INTERVAL.as_secs() / 3600;
        if self.cleanup_interval_hours > max_hours {
            return Err(ConfigError::Invalid {
                key: "cleanup_interval_hours",
                reason: format!("must be at most {}", max_hours),
            });
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::Invalid {
                key: "retry_max_delay_ms",
                reason: "must not be below retry_base_delay_ms".to_string(),
            });
        }

        if self.sources.apps.enabled && self.sources.apps.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "sources.apps.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.sources.activity.enabled && self.sources.activity.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "sources.activity.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig {
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            queue_capacity: self.queue_capacity,
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            sweep_interval: Duration::from_millis(self.dedup_sweep_interval_ms),
        }
    }

    pub fn persistence(&self) -> PersistenceConfig {
        PersistenceConfig {
            queue_capacity: self.persist_queue_capacity,
            write_batch_max: self.write_batch_max,
            retry_attempts: self.retry_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            retention: RetentionPolicy {
                retention_days: self.retention_days,
                cleanup_interval: Duration::from_secs(
                    self.cleanup_interval_hours.saturating_mul(3600),
                ),
                cleanup_on_start: self.cleanup_on_start,
            },
        }
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            db_path: self.db_path.clone(),
            compression_threshold_bytes: self.compression_threshold_bytes,
            cache_size_mb: self.cache_size_mb,
            threads: self.store_threads,
            wal_checkpoint_mb: self.wal_checkpoint_mb,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Generate example TOML config
    pub fn example_toml() -> &'static str {
        r##"# selflow capture agent configuration
# ====================================
# Every key is optional; the values shown are the defaults.

# Event store file (defaults to the platform data directory)
# db_path = "/home/me/.local/share/selflow-agent/events.duckdb"

# Log level used when RUST_LOG is not set
log_level = "info"

# ============================================================================
# Source batching (one batcher per source)
# ============================================================================

# Events per batch
batch_size = 50
# A partial batch is cut after this long
batch_timeout_ms = 100
# Ring buffer size per source; the oldest event is dropped on overflow
queue_capacity = 10000
# Identical events closer together than this collapse into one
dedup_window_ms = 500
# How often stale dedup keys are forgotten
dedup_sweep_interval_ms = 10000

# ============================================================================
# Persistence
# ============================================================================

# Events waiting for the writer; the oldest are dropped on overflow
persist_queue_capacity = 10000
# Most events written in one transaction
write_batch_max = 100
# Retries after a transient store failure (busy, locked)
retry_attempts = 3
retry_base_delay_ms = 100
retry_max_delay_ms = 5000

# ============================================================================
# Retention
# ============================================================================

retention_days = 30
cleanup_interval_hours = 24
cleanup_on_start = true

# ============================================================================
# Storage
# ============================================================================

# Payloads larger than this are zstd-compressed
compression_threshold_bytes = 1024
cache_size_mb = 256
store_threads = 2
wal_checkpoint_mb = 16

# ============================================================================
# Coordinator
# ============================================================================

shutdown_timeout_ms = 5000
# Throughput log interval
stats_interval_secs = 5
# How often crashed sources are checked for restart
supervisor_interval_ms = 1000

# ============================================================================
# Sources
# ============================================================================

[sources.fs]
enabled = true
# Defaults to the home directory
# watch_paths = ["/home/me/projects", "/home/me/Documents"]
ignore_extensions = [".tmp", ".temp", ".swp", ".lock", ".log", ".cache", ".ds_store", ".localized", ".trash"]
ignore_dirs = ["__pycache__", ".git", ".svn", ".hg", "node_modules", ".vscode", ".idea", ".mypy_cache", ".pytest_cache"]
ignore_hidden = true
# Glob patterns matched against the full path
ignore_globs = []

[sources.apps]
enabled = true
poll_interval_ms = 200
# Case-insensitive substrings of process names counted as user applications
# app_patterns = ["firefox", "code", "slack"]

[sources.activity]
enabled = true
poll_interval_ms = 1000
cpu_active_percent = 20.0
idle_threshold_secs = 30
network_threshold_bytes = 1048576
"##
    }
}
