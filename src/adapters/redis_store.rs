//! Redis-backed aggregate store shared by every gateway process.
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::ConnectionManager};

use crate::ports::aggregate_store::{AggregateStore, StoreError, StoreResult};

pub struct RedisAggregateStore {
    connection_manager: ConnectionManager,
}

impl RedisAggregateStore {
    /// Connect to `url` (`redis://` or `rediss://`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        tracing::info!("Connecting to redis aggregate store");

        let client =
            Client::open(url).map_err(|e| StoreError::Unavailable(format!("bad redis url: {e}")))?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::info!("Redis aggregate store connected");
        Ok(Self { connection_manager })
    }
}

#[async_trait]
impl AggregateStore for RedisAggregateStore {
    async fn incr_by_with_expiry(
        &self,
        increments: &[(String, i64)],
        ttl: Duration,
    ) -> StoreResult<()> {
        if increments.is_empty() {
            return Ok(());
        }

        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let mut pipe = redis::pipe();
        for (key, delta) in increments {
            pipe.incr(key, *delta).ignore();
            pipe.expire(key, ttl_secs).ignore();
        }

        let mut conn = self.connection_manager.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Command(format!("INCRBY pipeline failed: {e}")))
    }

    async fn get(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection_manager.clone();
        let value: Option<i64> = conn
            .get(key)
            .await
            .map_err(|e| StoreError::Command(format!("GET {key} failed: {e}")))?;
        Ok(value.unwrap_or(0))
    }
}
