pub mod file_service_store;
pub mod http_client;
pub mod memory_store;
pub mod redis_store;
pub mod tls;

/// Re-export commonly used types from adapters
pub use file_service_store::FileServiceStore;
pub use http_client::HttpClientAdapter;
pub use memory_store::MemoryAggregateStore;
pub use redis_store::RedisAggregateStore;
