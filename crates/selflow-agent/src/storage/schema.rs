//! Versioned, additive schema migrations

use duckdb::{params, Connection};
use tracing::info;

use super::{StorageError, StorageResult};

/// Ordered migrations; each entry only adds objects
const MIGRATIONS: &[(i32, &str)] = &[(
    1,
    r#"
    CREATE SEQUENCE IF NOT EXISTS events_id_seq START 1;

    CREATE TABLE IF NOT EXISTS events (
        id BIGINT PRIMARY KEY DEFAULT nextval('events_id_seq'),
        timestamp BIGINT NOT NULL,
        kind VARCHAR NOT NULL,
        action VARCHAR NOT NULL,
        source VARCHAR NOT NULL,
        payload VARCHAR,
        payload_compressed BLOB,
        content_hash VARCHAR NOT NULL UNIQUE,
        created_at TIMESTAMP DEFAULT current_timestamp
    );

    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
    CREATE INDEX IF NOT EXISTS idx_events_source ON events(source);
    CREATE INDEX IF NOT EXISTS idx_events_hash ON events(content_hash);
    "#,
)];

/// Latest schema version this build understands
pub(crate) fn latest_version() -> i32 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

/// Bring the store up to the latest version, returning it
pub(crate) fn migrate(conn: &Connection) -> StorageResult<i32> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            version INTEGER NOT NULL,
            applied_at TIMESTAMP DEFAULT current_timestamp
        );
        "#,
    )
    .map_err(|e| StorageError::Open(format!("schema_meta: {}", e)))?;

    let current: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_meta", [], |row| {
            row.get(0)
        })
        .map_err(|e| StorageError::Open(format!("reading schema version: {}", e)))?;

    if current > latest_version() {
        return Err(StorageError::Open(format!(
            "store schema version {} is newer than supported version {}",
            current,
            latest_version()
        )));
    }

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        conn.execute_batch(sql)
            .map_err(|e| StorageError::Open(format!("migration {}: {}", version, e)))?;
        conn.execute(
            "INSERT INTO schema_meta (version) VALUES (?)",
            params![*version],
        )
        .map_err(|e| StorageError::Open(format!("recording migration {}: {}", version, e)))?;
        info!("Applied event store migration {}", version);
    }

    Ok(latest_version())
}
