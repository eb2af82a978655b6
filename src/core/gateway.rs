//! Composition root of the data plane.
//!
//! `GatewayContext` owns every shared runtime object (service registry,
//! selectors, flow counters and limiters, tenants, the backend HTTP client)
//! and is handed to the HTTP and TCP routers as an `Arc`. Nothing in the
//! crate reaches for process-wide singletons.
use std::sync::Arc;

use eyre::{Context, Result};

use crate::{
    adapters::{
        FileServiceStore, HttpClientAdapter, memory_store::MemoryAggregateStore,
        redis_store::RedisAggregateStore,
    },
    config::models::GatewayConfig,
    core::{
        flow_counter::FlowCounterRegistry, flow_limiter::FlowLimiterRegistry,
        load_balancer::LoadBalancerRegistry, service_registry::ServiceRegistry,
        tenant::TenantDirectory,
    },
    ports::{aggregate_store::AggregateStore, http_client::HttpClient},
};

pub struct GatewayContext {
    config: Arc<GatewayConfig>,
    registry: Arc<ServiceRegistry>,
    balancers: LoadBalancerRegistry,
    counters: FlowCounterRegistry,
    limiters: FlowLimiterRegistry,
    tenants: TenantDirectory,
    http_client: Arc<dyn HttpClient>,
}

impl GatewayContext {
    /// Assemble a context from already-built collaborators.
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: Arc<ServiceRegistry>,
        store: Arc<dyn AggregateStore>,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        let counters = FlowCounterRegistry::new(
            store,
            config.flow.flush_interval(),
            config.flow.utc_offset_secs,
        );
        let tenants = TenantDirectory::new(&config.auth);

        Self {
            config,
            registry,
            balancers: LoadBalancerRegistry::new(),
            counters,
            limiters: FlowLimiterRegistry::new(),
            tenants,
            http_client,
        }
    }

    /// Build the production adapters for `config` and load the service registry.
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        let config = Arc::new(config);

        let store: Arc<dyn AggregateStore> = match &config.store.redis_url {
            Some(url) => Arc::new(
                RedisAggregateStore::connect(url)
                    .await
                    .context("Failed to connect to the aggregate store")?,
            ),
            None => {
                tracing::warn!("No redis_url configured, flow aggregates stay in process memory");
                Arc::new(MemoryAggregateStore::new())
            }
        };

        let http_client: Arc<dyn HttpClient> = Arc::new(
            HttpClientAdapter::new(config.http.backend_timeout())
                .context("Failed to create HTTP client adapter")?,
        );

        let registry = Arc::new(ServiceRegistry::new(Arc::new(FileServiceStore::new(
            &config.services_path,
        ))));
        registry
            .load()
            .await
            .with_context(|| format!("Failed to load services from {}", config.services_path))?;

        Ok(Self::new(config, registry, store, http_client))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn balancers(&self) -> &LoadBalancerRegistry {
        &self.balancers
    }

    pub fn counters(&self) -> &FlowCounterRegistry {
        &self.counters
    }

    pub fn limiters(&self) -> &FlowLimiterRegistry {
        &self.limiters
    }

    pub fn tenants(&self) -> &TenantDirectory {
        &self.tenants
    }

    pub fn http_client(&self) -> &Arc<dyn HttpClient> {
        &self.http_client
    }

    /// Stop background work owned by the context.
    pub fn shutdown(&self) {
        self.counters.shutdown();
    }
}
