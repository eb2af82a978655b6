//! Token-bucket limiters keyed by scope, built atop `governor`.
//!
//! A limiter refills `qps` tokens per second and holds at most `3 * qps`,
//! so short bursts pass while sustained overload is rejected. A configured
//! rate of zero means the scope is unlimited and no limiter is created.
//!
//! Per-client limits share one keyed limiter per service. Clients whose
//! bucket has refilled completely are dropped from it every
//! [`CLIENT_SWEEP_EVERY`] checks, so the table only holds recently active
//! addresses.
use std::{
    net::IpAddr,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed, keyed::DefaultKeyedStateStore},
};
use scc::HashMap;

/// Bucket capacity as a multiple of the refill rate.
pub const BURST_FACTOR: u32 = 3;

/// Checks between two sweeps of a per-client table.
pub const CLIENT_SWEEP_EVERY: u64 = 1024;

fn quota(qps: NonZeroU32) -> Quota {
    let burst = NonZeroU32::new(qps.get().saturating_mul(BURST_FACTOR)).unwrap_or(qps);
    Quota::per_second(qps).allow_burst(burst)
}

pub struct FlowLimiter<C: Clock = DefaultClock> {
    qps: u32,
    limiter: RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<C::Instant>>,
}

impl<C: Clock> FlowLimiter<C> {
    fn new(qps: NonZeroU32, clock: C) -> Self {
        Self {
            qps: qps.get(),
            limiter: RateLimiter::direct_with_clock(quota(qps), clock),
        }
    }

    /// Take one token, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn qps(&self) -> u32 {
        self.qps
    }
}

/// One token bucket per client address of a service.
pub struct ClientFlowLimiter<C: Clock = DefaultClock> {
    qps: u32,
    checks: AtomicU64,
    limiter: RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, C, NoOpMiddleware<C::Instant>>,
}

impl<C: Clock> ClientFlowLimiter<C> {
    fn new(qps: NonZeroU32, clock: C) -> Self {
        Self {
            qps: qps.get(),
            checks: AtomicU64::new(0),
            limiter: RateLimiter::new(quota(qps), DefaultKeyedStateStore::default(), clock),
        }
    }

    /// Take one token from `client`'s bucket, without waiting.
    pub fn try_acquire(&self, client: IpAddr) -> bool {
        let allowed = self.limiter.check_key(&client).is_ok();
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % CLIENT_SWEEP_EVERY == 0 {
            self.sweep();
        }
        allowed
    }

    /// Forget clients whose bucket is full again.
    pub fn sweep(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        tracing::trace!(before, after = self.limiter.len(), "Swept client limiters");
    }

    /// Clients currently holding a bucket.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }

    pub fn qps(&self) -> u32 {
        self.qps
    }
}

/// Limiters keyed by scope, created on first lookup.
pub struct FlowLimiterRegistry<C: Clock + Clone = DefaultClock> {
    limiters: HashMap<String, Arc<FlowLimiter<C>>>,
    clients: HashMap<String, Arc<ClientFlowLimiter<C>>>,
    clock: C,
}

impl FlowLimiterRegistry<DefaultClock> {
    pub fn new() -> Self {
        Self::with_clock(DefaultClock::default())
    }
}

impl Default for FlowLimiterRegistry<DefaultClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock + Clone> FlowLimiterRegistry<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            limiters: HashMap::new(),
            clients: HashMap::new(),
            clock,
        }
    }

    /// Limiter for `scope`, or `None` when `qps` is 0.
    ///
    /// The rate is fixed by the first call for a scope.
    pub async fn limiter(&self, scope: &str, qps: u32) -> Option<Arc<FlowLimiter<C>>> {
        let qps = NonZeroU32::new(qps)?;

        if let Some(entry) = self.limiters.get_async(scope).await {
            return Some(entry.get().clone());
        }

        let limiter = self
            .limiters
            .entry_async(scope.to_string())
            .await
            .or_insert_with(|| {
                tracing::debug!(scope, qps = qps.get(), "Created flow limiter");
                Arc::new(FlowLimiter::new(qps, self.clock.clone()))
            })
            .get()
            .clone();
        Some(limiter)
    }

    /// Take one token from `scope`; unlimited scopes always pass.
    pub async fn allow(&self, scope: &str, qps: u32) -> bool {
        match self.limiter(scope, qps).await {
            Some(limiter) => limiter.try_acquire(),
            None => true,
        }
    }

    /// Per-client limiter of `scope`, or `None` when `qps` is 0.
    pub async fn client_limiter(&self, scope: &str, qps: u32) -> Option<Arc<ClientFlowLimiter<C>>> {
        let qps = NonZeroU32::new(qps)?;

        if let Some(entry) = self.clients.get_async(scope).await {
            return Some(entry.get().clone());
        }

        let limiter = self
            .clients
            .entry_async(scope.to_string())
            .await
            .or_insert_with(|| {
                tracing::debug!(scope, qps = qps.get(), "Created client flow limiter");
                Arc::new(ClientFlowLimiter::new(qps, self.clock.clone()))
            })
            .get()
            .clone();
        Some(limiter)
    }

    /// Take one token from `client`'s bucket in `scope`.
    pub async fn allow_client(&self, scope: &str, client: IpAddr, qps: u32) -> bool {
        match self.client_limiter(scope, qps).await {
            Some(limiter) => limiter.try_acquire(client),
            None => true,
        }
    }

    /// Number of scope-wide limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
