pub mod aggregate_store;
pub mod http_client;
pub mod service_store;

pub use aggregate_store::{AggregateStore, StoreError, StoreResult};
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use service_store::{ServicePage, ServiceStore};
