pub mod loader;
pub mod models;
pub mod service;
pub mod validation;

pub use loader::{load_config, load_service_file};
pub use models::*;
pub use service::{ProtocolKind, ServiceDefinition, ServiceRecord};
pub use validation::{GatewayConfigValidator, ValidationError, ValidationResult};
