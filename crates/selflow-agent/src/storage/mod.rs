//! DuckDB-based storage engine for captured events
//!
//! One `events` table holds every persisted event. Payloads above a size
//! threshold are zstd-compressed; inserts are idempotent on `content_hash`.
//! The connection is owned by a single [`Storage`] value, which in turn is
//! owned by the persistence manager: nothing else opens the database.

mod codec;
mod schema;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use parking_lot::Mutex;
use selflow_common::{EventQuery, PersistedEvent, RawEvent};
use thiserror::Error;
use tracing::{debug, info};

pub use codec::{decode_payload, DEFAULT_COMPRESSION_THRESHOLD};

/// Storage errors, classified by how the caller should react
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database file could not be opened or migrated
    #[error("Failed to open store: {0}")]
    Open(String),

    /// Store locked, busy, or conflicting; retrying may succeed
    #[error("Store temporarily unavailable: {0}")]
    Transient(String),

    /// A single row can never be written
    #[error("Row rejected: {0}")]
    Permanent(String),

    /// A stored payload could not be decoded
    #[error("Corrupt payload in row {id}: {reason}")]
    CorruptPayload { id: i64, reason: String },

    #[error("Query failed: {0}")]
    Query(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<duckdb::Error> for StorageError {
    fn from(err: duckdb::Error) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();
        if lower.contains("lock")
            || lower.contains("busy")
            || lower.contains("conflict")
            || lower.contains("io error")
        {
            StorageError::Transient(message)
        } else {
            StorageError::Query(message)
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database file path (None for in-memory)
    pub db_path: Option<PathBuf>,
    /// Payloads larger than this many bytes are compressed
    pub compression_threshold_bytes: usize,
    /// Buffer cache size handed to DuckDB's memory_limit
    pub cache_size_mb: u64,
    /// Worker threads DuckDB may use
    pub threads: usize,
    /// WAL size that triggers an automatic checkpoint
    pub wal_checkpoint_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            cache_size_mb: 256,
            threads: 2,
            wal_checkpoint_mb: 16,
        }
    }
}

/// A row that was skipped during a batch insert
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    /// Position of the event in the submitted slice
    pub index: usize,
    pub reason: String,
}

/// Result of writing one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOutcome {
    /// Ids of newly inserted rows, in submission order
    pub inserted_ids: Vec<i64>,
    /// Events already present (same content hash)
    pub duplicates: usize,
    /// Events that failed validation or encoding
    pub rejected: Vec<RejectedRow>,
}

/// Store-level statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub row_count: u64,
    pub size_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Operations the persistence layer needs from an event store
pub trait EventStore: Send + Sync {
    /// Write all valid events in one transaction, ignoring duplicates
    fn insert_batch(&self, events: &[RawEvent]) -> StorageResult<InsertOutcome>;

    /// Read events newest first; a corrupt row fails only its own slot
    fn query(&self, query: &EventQuery) -> StorageResult<Vec<StorageResult<PersistedEvent>>>;

    fn stats(&self) -> StorageResult<StoreStats>;

    /// Remove events strictly older than `cutoff`, returning how many
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

const INSERT_SQL: &str = r#"
    INSERT INTO events (timestamp, kind, action, source, payload, payload_compressed, content_hash)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (content_hash) DO NOTHING
    RETURNING id
"#;

/// Storage engine wrapping a DuckDB connection
pub struct Storage {
    conn: Mutex<Connection>,
    config: StorageConfig,
}

impl Storage {
    /// Open (or create) the store, apply tuning and pending migrations
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let conn = if let Some(ref path) = config.db_path {
            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::Open(format!(
                            "cannot create {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
            }
            Connection::open(path)
                .map_err(|e| StorageError::Open(format!("{}: {}", path.display(), e)))?
        } else {
            Connection::open_in_memory().map_err(|e| StorageError::Open(e.to_string()))?
        };

        let storage = Self {
            conn: Mutex::new(conn),
            config,
        };

        storage.apply_tuning();
        {
            let conn = storage.conn.lock();
            let version = schema::migrate(&conn)?;
            debug!("Event store schema at version {}", version);
        }

        info!(
            "Event store ready at {}",
            storage
                .config
                .db_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string())
        );

        Ok(storage)
    }

    /// Open an in-memory store with default settings
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open(StorageConfig::default())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Write-heavy tuning; a setting the engine refuses is logged and skipped
    fn apply_tuning(&self) {
        let conn = self.conn.lock();
        let settings = [
            format!("SET memory_limit = '{}MB'", self.config.cache_size_mb.max(16)),
            format!("SET threads = {}", self.config.threads.max(1)),
            format!(
                "SET checkpoint_threshold = '{}MB'",
                self.config.wal_checkpoint_mb.max(1)
            ),
            "SET preserve_insertion_order = false".to_string(),
        ];

        for setting in &settings {
            if let Err(e) = conn.execute_batch(setting) {
                debug!("Tuning note ({}): {}", setting, e);
            }
        }
    }

    fn file_size(path: &Path) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }
}

impl EventStore for Storage {
    fn insert_batch(&self, events: &[RawEvent]) -> StorageResult<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        let mut rows = Vec::with_capacity(events.len());
        let mut seen = HashSet::with_capacity(events.len());

        // Encode outside the transaction so a bad row never aborts it
        for (index, event) in events.iter().enumerate() {
            match codec::encode(event, self.config.compression_threshold_bytes) {
                Ok(row) => {
                    if seen.insert(row.content_hash.clone()) {
                        rows.push(row);
                    } else {
                        outcome.duplicates += 1;
                    }
                }
                Err(e) => outcome.rejected.push(RejectedRow {
                    index,
                    reason: e.to_string(),
                }),
            }
        }

        if rows.is_empty() {
            return Ok(outcome);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_SQL)?;
            for row in &rows {
                let mut returned = stmt.query(params![
                    row.timestamp_us,
                    row.kind,
                    row.action,
                    row.source,
                    row.payload,
                    row.payload_compressed,
                    row.content_hash,
                ])?;
                match returned.next()? {
                    Some(r) => outcome.inserted_ids.push(r.get(0)?),
                    None => outcome.duplicates += 1,
                }
            }
        }
        tx.commit()?;

        Ok(outcome)
    }

    fn query(&self, query: &EventQuery) -> StorageResult<Vec<StorageResult<PersistedEvent>>> {
        let conn = self.conn.lock();

        let mut sql = String::from(
            "SELECT id, timestamp, kind, action, source, payload, payload_compressed, content_hash FROM events WHERE 1=1",
        );

        if query.start.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if query.end.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        if query.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if query.source.is_some() {
            sql.push_str(" AND source = ?");
        }

        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");

        let mut stmt = conn.prepare(&sql)?;

        // Build params dynamically
        let mut params_vec: Vec<Box<dyn duckdb::ToSql>> = Vec::new();

        if let Some(start) = query.start {
            params_vec.push(Box::new(start.timestamp_micros()));
        }
        if let Some(end) = query.end {
            params_vec.push(Box::new(end.timestamp_micros()));
        }
        if let Some(kind) = query.kind {
            params_vec.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(ref source) = query.source {
            params_vec.push(Box::new(source.clone()));
        }
        params_vec.push(Box::new(i64::try_from(query.limit).unwrap_or(i64::MAX)));

        let params_refs: Vec<&dyn duckdb::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok(codec::StoredRow {
                id: row.get(0)?,
                timestamp_us: row.get(1)?,
                kind: row.get(2)?,
                action: row.get(3)?,
                source: row.get(4)?,
                payload: row.get(5)?,
                payload_compressed: row.get(6)?,
                content_hash: row.get(7)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(codec::decode(row?));
        }
        Ok(results)
    }

    fn stats(&self) -> StorageResult<StoreStats> {
        let conn = self.conn.lock();
        let (count, oldest, newest): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let size_bytes = match self.config.db_path {
            Some(ref path) => {
                let wal = PathBuf::from(format!("{}.wal", path.display()));
                Self::file_size(path) + Self::file_size(&wal)
            }
            None => 0,
        };

        Ok(StoreStats {
            row_count: count.max(0) as u64,
            size_bytes,
            oldest: oldest.map(selflow_common::from_micros),
            newest: newest.map(selflow_common::from_micros),
        })
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM events WHERE timestamp < ?",
            params![cutoff.timestamp_micros()],
        )?;

        // Fold the WAL back into the main file so freed blocks can be reused
        conn.execute_batch("CHECKPOINT")?;

        Ok(removed)
    }
}
