use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{connection::ConnectionEvent, form::FormResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    FormResponse,
    ConnectionEvent,
}

/// What a pending record carries; the tag doubles as the routing key for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RecordPayload {
    FormResponse(FormResponse),
    ConnectionEvent(ConnectionEvent),
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::FormResponse(_) => RecordKind::FormResponse,
            RecordPayload::ConnectionEvent(_) => RecordKind::ConnectionEvent,
        }
    }
}

/// A mutation awaiting delivery to the server.
///
/// `id` is the idempotency key: the queue refuses a second record with the same id and
/// the server stores a form response only once per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    pub id: String,
    pub payload: RecordPayload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_pending_sync")]
    pub pending_sync: bool,
}

fn default_pending_sync() -> bool {
    true
}

impl PendingRecord {
    pub fn new(id: String, payload: RecordPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            created_at,
            attempts: 0,
            pending_sync: true,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    /// Serialized size in bytes, as accounted by the local store.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::FormData;

    #[test]
    fn payload_is_tagged_by_kind() {
        let now = Utc::now();
        let response = FormResponse::stamp("offline-1".into(), FormData::new("C3"), now);
        let record = PendingRecord::new(
            "offline-1".into(),
            RecordPayload::FormResponse(response),
            now,
        );
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["payload"]["kind"], "FormResponse");
        assert_eq!(json["payload"]["section"], "C3");
        assert_eq!(json["pendingSync"], true);
        assert_eq!(json["attempts"], 0);

        let back: PendingRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), RecordKind::FormResponse);
        assert_eq!(back, record);
    }

    #[test]
    fn legacy_entries_without_counters_default_to_pending() {
        let raw = r#"{
            "id": "connection-1",
            "payload": { "kind": "ConnectionEvent", "action": "register", "sessionId": "s1" },
            "createdAt": "2026-01-05T10:00:00Z"
        }"#;
        let record: PendingRecord = serde_json::from_str(raw).unwrap();

        assert_eq!(record.kind(), RecordKind::ConnectionEvent);
        assert_eq!(record.attempts, 0);
        assert!(record.pending_sync);
    }

    #[test]
    fn encoded_len_matches_stored_document() {
        let now = Utc::now();
        let form = FormData::new("A1").with_answer("attentes", "Très satisfait");
        let response = FormResponse::stamp("offline-2".into(), form, now);
        let record = PendingRecord::new(
            "offline-2".into(),
            RecordPayload::FormResponse(response),
            now,
        );

        let stored = serde_json::to_string(&serde_json::to_value(&record).unwrap()).unwrap();
        assert_eq!(record.encoded_len().unwrap(), stored.len());
    }
}
