//! Row encoding: validation, hashing, and payload compression

use selflow_common::{content_hash, from_micros, EventKind, EventPayload, PersistedEvent, RawEvent};

use super::{StorageError, StorageResult};

/// Payloads larger than this are compressed by default
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// zstd level used for stored payloads
const COMPRESSION_LEVEL: i32 = 3;

/// An event ready to be bound into the insert statement
pub(crate) struct EncodedRow {
    pub timestamp_us: i64,
    pub kind: &'static str,
    pub action: &'static str,
    pub source: String,
    pub payload: Option<String>,
    pub payload_compressed: Option<Vec<u8>>,
    pub content_hash: String,
}

/// A row as read back from the events table
pub(crate) struct StoredRow {
    pub id: i64,
    pub timestamp_us: i64,
    pub kind: String,
    pub action: String,
    pub source: String,
    pub payload: Option<String>,
    pub payload_compressed: Option<Vec<u8>>,
    pub content_hash: String,
}

/// Validate and encode an event; every failure here is permanent for the row
pub(crate) fn encode(event: &RawEvent, threshold: usize) -> StorageResult<EncodedRow> {
    event
        .validate()
        .map_err(|e| StorageError::Permanent(e.to_string()))?;

    let hash = content_hash(event).map_err(|e| StorageError::Permanent(e.to_string()))?;
    let json = serde_json::to_string(&event.payload)
        .map_err(|e| StorageError::Permanent(format!("payload encoding: {}", e)))?;

    let (payload, payload_compressed) = if json.len() > threshold {
        let compressed = zstd::encode_all(json.as_bytes(), COMPRESSION_LEVEL)
            .map_err(|e| StorageError::Permanent(format!("compression: {}", e)))?;
        (None, Some(compressed))
    } else {
        (Some(json), None)
    };

    Ok(EncodedRow {
        timestamp_us: event.timestamp_micros(),
        kind: event.kind().as_str(),
        action: event.action(),
        source: event.source.clone(),
        payload,
        payload_compressed,
        content_hash: hash,
    })
}

/// Recover the typed payload from either storage column
pub fn decode_payload(
    id: i64,
    inline: Option<&str>,
    compressed: Option<&[u8]>,
) -> StorageResult<EventPayload> {
    let corrupt = |reason: String| StorageError::CorruptPayload { id, reason };

    let json = match (inline, compressed) {
        (_, Some(bytes)) => {
            let raw = zstd::decode_all(bytes).map_err(|e| corrupt(format!("decompression: {}", e)))?;
            String::from_utf8(raw).map_err(|e| corrupt(format!("utf-8: {}", e)))?
        }
        (Some(text), None) => text.to_string(),
        (None, None) => return Err(corrupt("no payload stored".to_string())),
    };

    serde_json::from_str(&json).map_err(|e| corrupt(format!("json: {}", e)))
}

pub(crate) fn decode(row: StoredRow) -> StorageResult<PersistedEvent> {
    let kind: EventKind = row.kind.parse().map_err(|e| StorageError::CorruptPayload {
        id: row.id,
        reason: format!("{}", e),
    })?;

    let payload = decode_payload(
        row.id,
        row.payload.as_deref(),
        row.payload_compressed.as_deref(),
    )?;

    if payload.kind() != kind {
        return Err(StorageError::CorruptPayload {
            id: row.id,
            reason: format!("payload is {} but row is {}", payload.kind(), kind),
        });
    }

    Ok(PersistedEvent {
        id: row.id,
        timestamp: from_micros(row.timestamp_us),
        kind,
        action: row.action,
        source: row.source,
        payload,
        content_hash: row.content_hash,
        compressed: row.payload_compressed.is_some(),
    })
}
