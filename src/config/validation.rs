#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr, path::Path};

use crate::config::{
    models::{AuthConfig, GatewayConfig, HttpsListenerConfig},
    service::ServiceDefinition,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Service conflict detected: {message}")]
    ServiceConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the gateway configuration, collecting every problem found.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.http.addr) {
            errors.push(e);
        }

        if let Some(https) = &config.https {
            if let Err(e) = Self::validate_listen_address(&https.addr) {
                errors.push(e);
            }
            if let Err(e) = Self::validate_tls_config(https) {
                errors.push(e);
            }
        }

        if let Err(e) = Self::validate_listen_address(&config.tcp.listen_addr(1)) {
            errors.push(ValidationError::InvalidField {
                field: "tcp.bind_host".to_string(),
                message: e.to_string(),
            });
        }

        if config.services_path.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services_path".to_string(),
            });
        }

        if let Err(mut auth_errors) = Self::validate_auth_config(&config.auth) {
            errors.append(&mut auth_errors);
        }

        if let Some(url) = &config.store.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                errors.push(ValidationError::InvalidField {
                    field: "store.redis_url".to_string(),
                    message: "must start with redis:// or rediss://".to_string(),
                });
            }
        }

        Self::finish(errors)
    }

    /// Validate a full set of service definitions: every definition on its own,
    /// then cross-service conflicts (duplicate names, duplicate ports).
    pub fn validate_services(definitions: &[ServiceDefinition]) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for definition in definitions {
            if let Err(e) = definition.clone().into_record() {
                errors.push(e);
            }
        }

        if let Err(mut conflicts) = Self::check_service_conflicts(definitions) {
            errors.append(&mut conflicts);
        }

        Self::finish(errors)
    }

    fn finish(errors: Vec<ValidationError>) -> ValidationResult<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_tls_config(https: &HttpsListenerConfig) -> ValidationResult<()> {
        for (label, path) in [("cert_path", &https.cert_path), ("key_path", &https.key_path)] {
            if path.trim().is_empty() {
                return Err(ValidationError::InvalidTls {
                    message: format!("{label} must not be empty"),
                });
            }
            if !Path::new(path).exists() {
                return Err(ValidationError::InvalidTls {
                    message: format!("{label} '{path}' does not exist"),
                });
            }
        }
        Ok(())
    }

    fn validate_auth_config(auth: &AuthConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !auth.tenants.is_empty() && auth.jwt_secret.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.jwt_secret".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for tenant in &auth.tenants {
            if tenant.app_id.trim().is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: "auth.tenants.app_id".to_string(),
                    message: "app_id must not be empty".to_string(),
                });
            } else if !seen.insert(tenant.app_id.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("auth.tenants '{}'", tenant.app_id),
                    message: "duplicate app_id".to_string(),
                });
            }
            if tenant.qpd < 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("auth.tenants '{}' qpd", tenant.app_id),
                    message: "qpd must not be negative".to_string(),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn check_service_conflicts(
        definitions: &[ServiceDefinition],
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();
        let mut ports = HashSet::new();

        for definition in definitions {
            if !names.insert(definition.name.as_str()) {
                errors.push(ValidationError::ServiceConflict {
                    message: format!("service name '{}' is registered twice", definition.name),
                });
            }
            if let Some(port) = definition.bound_port() {
                if !ports.insert(port) {
                    errors.push(ValidationError::ServiceConflict {
                        message: format!(
                            "port {port} of service '{}' is already bound by another service",
                            definition.name
                        ),
                    });
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Format multiple validation errors into a readable message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        let mut message = format!("Found {} validation error(s):\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
