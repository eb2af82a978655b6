//! Per-scope request accounting.
//!
//! Hot-path callers only bump an atomic tick counter. A background task per
//! counter periodically moves the ticks into day and hour buckets of the
//! aggregate store, reads back the authoritative day total (other gateway
//! processes may share the buckets) and derives the current QPS from it.
use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use scc::HashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::ports::aggregate_store::{AggregateStore, StoreResult};

/// Scope covering every request the gateway sees.
pub const TOTAL_SCOPE: &str = "flow_total";

const DAY_KEY_PREFIX: &str = "flow_day_count";
const HOUR_KEY_PREFIX: &str = "flow_hour_count";
const BUCKET_TTL: Duration = Duration::from_secs(2 * 24 * 3600);

pub fn service_scope(name: &str) -> String {
    format!("service:{name}")
}

pub fn app_scope(app_id: &str) -> String {
    format!("app:{app_id}")
}

/// Baseline carried between two flushes of the same counter.
#[derive(Debug, Default)]
pub struct FlushState {
    last_total: i64,
    last_flush: Option<Instant>,
}

pub struct FlowCounter {
    scope: String,
    ticks: AtomicI64,
    qps: AtomicI64,
    day_total: AtomicI64,
    offset: FixedOffset,
    store: Arc<dyn AggregateStore>,
}

impl std::fmt::Debug for FlowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowCounter")
            .field("scope", &self.scope)
            .field("qps", &self.qps())
            .field("day_total", &self.day_total())
            .finish()
    }
}

impl FlowCounter {
    pub fn new(scope: impl Into<String>, store: Arc<dyn AggregateStore>, offset: FixedOffset) -> Self {
        Self {
            scope: scope.into(),
            ticks: AtomicI64::new(0),
            qps: AtomicI64::new(0),
            day_total: AtomicI64::new(0),
            offset,
            store,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Count one request.
    pub fn increase(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// QPS derived at the last flush.
    pub fn qps(&self) -> i64 {
        self.qps.load(Ordering::Relaxed)
    }

    /// Day total observed at the last flush.
    pub fn day_total(&self) -> i64 {
        self.day_total.load(Ordering::Relaxed)
    }

    /// Ticks not yet flushed.
    pub fn pending(&self) -> i64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    pub fn day_key(&self, at: DateTime<Utc>) -> String {
        format!(
            "{DAY_KEY_PREFIX}_{}_{}",
            self.local(at).format("%Y%m%d"),
            self.scope
        )
    }

    pub fn hour_key(&self, at: DateTime<Utc>) -> String {
        format!(
            "{HOUR_KEY_PREFIX}_{}_{}",
            self.local(at).format("%Y%m%d%H"),
            self.scope
        )
    }

    /// Live day bucket value from the store.
    pub async fn day_count(&self, at: DateTime<Utc>) -> StoreResult<i64> {
        self.store.get(&self.day_key(at)).await
    }

    /// Live hour bucket value from the store.
    pub async fn hour_count(&self, at: DateTime<Utc>) -> StoreResult<i64> {
        self.store.get(&self.hour_key(at)).await
    }

    /// Move pending ticks into the store and refresh `qps` / `day_total`.
    ///
    /// On failure the swapped-out ticks are dropped.
    pub async fn flush_once(&self, state: &mut FlushState) -> StoreResult<()> {
        let delta = self.ticks.swap(0, Ordering::AcqRel);
        let now = Utc::now();
        let day_key = self.day_key(now);

        self.store
            .incr_by_with_expiry(
                &[(day_key.clone(), delta), (self.hour_key(now), delta)],
                BUCKET_TTL,
            )
            .await?;
        let total = self.store.get(&day_key).await?;

        let flushed_at = Instant::now();
        if let Some(previous) = state.last_flush {
            let elapsed = flushed_at.duration_since(previous).as_secs_f64();
            if elapsed > 0.0 {
                // The day bucket restarts at midnight; never report negative QPS.
                let grown = (total - state.last_total).max(0);
                self.qps
                    .store((grown as f64 / elapsed).round() as i64, Ordering::Relaxed);
            }
        }
        state.last_total = total;
        state.last_flush = Some(flushed_at);
        self.day_total.store(total, Ordering::Relaxed);
        Ok(())
    }

    /// Run `flush_once` every `interval` until `cancel` fires.
    pub fn spawn_flush(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let counter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut state = FlushState::default();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = counter.flush_once(&mut state).await {
                            tracing::warn!(scope = %counter.scope, "Flow counter flush failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!(scope = %counter.scope, "Flow counter flush task stopped");
        });
    }
}

/// Counters keyed by scope, created on first traffic.
pub struct FlowCounterRegistry {
    counters: HashMap<String, Arc<FlowCounter>>,
    store: Arc<dyn AggregateStore>,
    offset: FixedOffset,
    flush_interval: Duration,
    cancel: CancellationToken,
}

impl FlowCounterRegistry {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        flush_interval: Duration,
        utc_offset_secs: i32,
    ) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_secs).unwrap_or_else(|| {
            tracing::warn!("UTC offset {}s out of range, using UTC", utc_offset_secs);
            Utc.fix()
        });
        Self {
            counters: HashMap::new(),
            store,
            offset,
            flush_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Counter for `scope`; the first call creates it and starts its flush task.
    pub async fn counter(&self, scope: &str) -> Arc<FlowCounter> {
        if let Some(entry) = self.counters.get_async(scope).await {
            return entry.get().clone();
        }

        let mut created = false;
        let counter = self
            .counters
            .entry_async(scope.to_string())
            .await
            .or_insert_with(|| {
                created = true;
                Arc::new(FlowCounter::new(scope, self.store.clone(), self.offset))
            })
            .get()
            .clone();

        if created {
            tracing::debug!(scope, "Created flow counter");
            counter.spawn_flush(self.flush_interval, self.cancel.child_token());
        }
        counter
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Stop every flush task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
