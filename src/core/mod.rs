pub mod backend;
pub mod flow_counter;
pub mod flow_limiter;
pub mod gateway;
pub mod load_balancer;
pub mod service_registry;
pub mod tenant;

pub use gateway::GatewayContext;
pub use load_balancer::{LoadBalancer, LoadBalancerRegistry, SelectionError};
pub use service_registry::{RegistryLoadError, ServiceRegistry};
