use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{info, warn};

use crate::responses::{InsertOutcome, ResponseStore, ResponseStoreError};

const HASH_RESPONSES: &str = "tally:responses:data";
const LIST_ORDER: &str = "tally:responses:order";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Responses keyed by id in one hash, arrival order in a list. `HSETNX` makes the id check and
/// the write one atomic step, so concurrent replays of the same id store it once.
pub struct RedisResponses {
    redis: ConnectionManager,
}

impl RedisResponses {
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let redis = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                redis::RedisError::from((redis::ErrorKind::IoError, "connect timed out"))
            })??;
        info!(url, "redis response store connected");
        Ok(Self { redis })
    }
}

#[async_trait]
impl ResponseStore for RedisResponses {
    async fn insert(&self, id: &str, record: Value) -> Result<InsertOutcome, ResponseStoreError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(&record)?;
        let created: bool = conn.hset_nx(HASH_RESPONSES, id, &serialized).await?;
        if created {
            let _: () = conn.rpush(LIST_ORDER, id).await?;
            return Ok(InsertOutcome::Created(record));
        }

        let existing: Option<String> = conn.hget(HASH_RESPONSES, id).await?;
        match existing {
            Some(raw) => Ok(InsertOutcome::Existing(serde_json::from_str(&raw)?)),
            // Deleted between the two calls; report what was offered.
            None => Ok(InsertOutcome::Existing(record)),
        }
    }

    async fn list(&self) -> Result<Vec<Value>, ResponseStoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.lrange(LIST_ORDER, 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(HASH_RESPONSES)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::with_capacity(raw.len());
        for (id, entry) in ids.iter().zip(raw) {
            match entry.map(|s| serde_json::from_str::<Value>(&s)) {
                Some(Ok(value)) => out.push(value),
                Some(Err(err)) => warn!(%id, error = %err, "skipping unreadable stored response"),
                None => warn!(%id, "order list references a missing response"),
            }
        }
        Ok(out)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
