//! In-process aggregate store, used when no redis URL is configured and in tests.
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::ports::aggregate_store::{AggregateStore, StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct MemoryAggregateStore {
    entries: Mutex<HashMap<String, (i64, Instant)>>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a key, as another gateway process sharing the store would.
    pub fn set(&self, key: &str, value: i64, ttl: Duration) -> StoreResult<()> {
        let mut entries = self.lock()?;
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, (i64, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn incr_by_with_expiry(
        &self,
        increments: &[(String, i64)],
        ttl: Duration,
    ) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        for (key, delta) in increments {
            let entry = entries.entry(key.clone()).or_insert((0, now));
            if entry.1 <= now {
                entry.0 = 0;
            }
            entry.0 += delta;
            entry.1 = now + ttl;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<i64> {
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map_or(0, |(value, _)| *value))
    }
}
