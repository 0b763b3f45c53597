//! Intake and storage of form responses.
//!
//! The client-supplied `id` is the idempotency key: a replayed submission returns the record that
//! was stored the first time and is never written twice.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tally_core::generate_record_id;
use thiserror::Error;
use tracing::warn;

pub const RECEIVED_AT_FIELD: &str = "receivedAt";
const RESPONSE_ID_PREFIX: &str = "response";

#[derive(Debug, Error)]
pub enum ResponseStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("stored response is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(Value),
    /// A response with this id was already stored; carries the original.
    Existing(Value),
}

impl InsertOutcome {
    pub fn into_value(self) -> Value {
        match self {
            InsertOutcome::Created(value) | InsertOutcome::Existing(value) => value,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrepareError {
    #[error("response body must be a JSON object")]
    NotAnObject,
    #[error("response id must be a non-empty string")]
    InvalidId,
}

/// Validates an incoming body and returns its id plus the record to store, stamped with
/// `receivedAt`. Bodies without an id get a server-generated one.
pub fn prepare(body: Value, now: DateTime<Utc>) -> Result<(String, Value), PrepareError> {
    let Value::Object(mut fields) = body else {
        return Err(PrepareError::NotAnObject);
    };

    let id = match fields.get("id") {
        None | Some(Value::Null) => generate_record_id(RESPONSE_ID_PREFIX),
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(_) => return Err(PrepareError::InvalidId),
    };
    fields.insert("id".into(), Value::String(id.clone()));
    fields.insert(
        RECEIVED_AT_FIELD.into(),
        Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    Ok((id, Value::Object(fields)))
}

#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn insert(&self, id: &str, record: Value) -> Result<InsertOutcome, ResponseStoreError>;

    /// Arrival order.
    async fn list(&self) -> Result<Vec<Value>, ResponseStoreError>;

    fn backend(&self) -> &'static str;
}

#[derive(Default)]
struct MemoryState {
    by_id: HashMap<String, Value>,
    order: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryResponses {
    state: Mutex<MemoryState>,
}

impl InMemoryResponses {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponses {
    async fn insert(&self, id: &str, record: Value) -> Result<InsertOutcome, ResponseStoreError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.by_id.get(id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        state.by_id.insert(id.to_string(), record.clone());
        state.order.push(id.to_string());
        Ok(InsertOutcome::Created(record))
    }

    async fn list(&self) -> Result<Vec<Value>, ResponseStoreError> {
        let state = self.state.lock();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.by_id.get(id).cloned())
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

pub type ResponseStoreHandle = Arc<dyn ResponseStore>;

/// Redis when a URL is configured and reachable, memory otherwise.
pub async fn build_response_store(redis_url: Option<&str>) -> ResponseStoreHandle {
    if let Some(url) = redis_url {
        match crate::responses_redis::RedisResponses::connect(url).await {
            Ok(store) => return Arc::new(store),
            Err(err) => {
                warn!(error = %err, "failed to init redis response store; falling back to memory")
            }
        }
    }
    Arc::new(InMemoryResponses::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prepare_keeps_client_id_and_stamps_arrival() {
        let now = Utc::now();
        let (id, record) = prepare(json!({"id": "response-1-abc", "section": "B1"}), now).unwrap();
        assert_eq!(id, "response-1-abc");
        assert_eq!(record["section"], "B1");
        assert_eq!(
            record[RECEIVED_AT_FIELD],
            now.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
    }

    #[test]
    fn prepare_generates_missing_ids_and_rejects_bad_ones() {
        let (id, record) = prepare(json!({"section": "B1"}), Utc::now()).unwrap();
        assert!(id.starts_with("response-"));
        assert_eq!(record["id"], id);

        assert_eq!(prepare(json!([1, 2]), Utc::now()), Err(PrepareError::NotAnObject));
        assert_eq!(prepare(json!({"id": 7}), Utc::now()), Err(PrepareError::InvalidId));
        assert_eq!(prepare(json!({"id": "  "}), Utc::now()), Err(PrepareError::InvalidId));
    }

    #[tokio::test]
    async fn memory_store_is_idempotent_per_id() {
        let store = InMemoryResponses::new();
        let first = store.insert("a", json!({"id": "a", "n": 1})).await.unwrap();
        let again = store.insert("a", json!({"id": "a", "n": 2})).await.unwrap();
        store.insert("b", json!({"id": "b"})).await.unwrap();

        assert!(matches!(first, InsertOutcome::Created(_)));
        assert_eq!(again, InsertOutcome::Existing(json!({"id": "a", "n": 1})));
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["id"], "a");
        assert_eq!(listed[1]["id"], "b");
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_to_memory() {
        let store = build_response_store(Some("redis://127.0.0.1:1")).await;
        assert_eq!(store.backend(), "memory");
    }
}
