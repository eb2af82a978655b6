use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("aggregate store unavailable: {0}")]
    Unavailable(String),

    #[error("aggregate store command failed: {0}")]
    Command(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Integer key/value store holding flow aggregates.
#[async_trait]
pub trait AggregateStore: Send + Sync + 'static {
    /// Increment every key by its delta and refresh its expiry, as one batch.
    async fn incr_by_with_expiry(&self, increments: &[(String, i64)], ttl: Duration)
    -> StoreResult<()>;

    /// Current value of `key`; a missing key reads as 0.
    async fn get(&self, key: &str) -> StoreResult<i64>;
}
