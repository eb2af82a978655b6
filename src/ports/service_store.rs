use async_trait::async_trait;
use eyre::Result;

use crate::config::service::ServiceDefinition;

/// One page of raw service definitions.
#[derive(Debug, Clone, Default)]
pub struct ServicePage {
    pub items: Vec<ServiceDefinition>,
    /// Total number of definitions across all pages.
    pub total: usize,
}

/// Persistent source of service definitions, read once at startup.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// List definitions in load order. `page_no` starts at 1.
    async fn list_services(&self, page_no: usize, page_size: usize) -> Result<ServicePage>;
}
