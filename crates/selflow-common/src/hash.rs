//! Content hashing for idempotent inserts

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::events::{EventError, EventPayload, RawEvent};

/// Canonical field set that identifies an event's content
#[derive(Serialize)]
struct HashInput<'a> {
    kind: &'static str,
    action: &'static str,
    timestamp_us: i64,
    source: &'a str,
    payload: &'a EventPayload,
}

/// Lowercase hex SHA-256 over the canonical JSON form of the event
pub fn content_hash(event: &RawEvent) -> Result<String, EventError> {
    let input = HashInput {
        kind: event.kind().as_str(),
        action: event.action(),
        timestamp_us: event.timestamp_micros(),
        source: &event.source,
        payload: &event.payload,
    };

    let canonical =
        serde_json::to_vec(&input).map_err(|e| EventError::Malformed(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AppAction, FileAction};

    #[test]
    fn test_hash_is_stable() {
        let e = RawEvent::file_op("fs", FileAction::Create, "/home/u/a.txt");
        let h1 = content_hash(&e).unwrap();
        let h2 = content_hash(&e.clone()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hash_differs_by_timestamp() {
        let e = RawEvent::file_op("fs", FileAction::Create, "/home/u/a.txt");
        let later = e.clone().at(e.timestamp + chrono::Duration::milliseconds(1));
        assert_ne!(content_hash(&e).unwrap(), content_hash(&later).unwrap());
    }

    #[test]
    fn test_hash_differs_by_source_and_payload() {
        let e = RawEvent::app_event("app_mon", AppAction::Launch, "code");
        let mut other_source = e.clone();
        other_source.source = "replay".to_string();
        let other_app = RawEvent::app_event("app_mon", AppAction::Launch, "slack").at(e.timestamp);

        let h = content_hash(&e).unwrap();
        assert_ne!(h, content_hash(&other_source).unwrap());
        assert_ne!(h, content_hash(&other_app).unwrap());
    }
}
