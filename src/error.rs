//! Error taxonomy shared by the HTTP and TCP data paths.
//!
//! Every request-facing failure maps onto a [`GatewayError`] variant carrying a
//! stable `errno` and an HTTP status. The JSON body written to clients never
//! contains low-level transport details; those are logged instead.
use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Request-facing gateway failures.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum GatewayError {
    /// Startup data could not be loaded.
    #[error("configuration load failed: {0}")]
    ConfigLoad(String),

    /// No registered routing rule matches the request.
    #[error("no service matched host '{host}' path '{path}'")]
    NoMatch { host: String, path: String },

    /// A policy stage ran before the access-mode stage resolved a service.
    #[error("service not found in request context")]
    ServiceMissing,

    /// The load balancer could not pick a backend address.
    #[error("backend selection failed for service '{service}': {reason}")]
    BackendSelection { service: String, reason: String },

    /// A path rewrite produced a URI that cannot be forwarded.
    #[error("rewritten request uri is invalid: {0}")]
    InvalidRewrite(String),

    /// The backend request failed; details are only logged.
    #[error("proxy request to backend failed")]
    Proxy,

    /// A token bucket rejected the request.
    #[error("{scope} flow limit exceeded ({qps} qps)")]
    LimitExceeded { scope: String, qps: u32 },

    /// A tenant used up its daily request quota.
    #[error("{scope} daily quota exhausted ({qpd} requests per day)")]
    QuotaExceeded { scope: String, qpd: i64 },

    /// Tenant authentication failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The client address is rejected by the allow or deny list.
    #[error("client {0} is not permitted")]
    Forbidden(String),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl GatewayError {
    /// Stable numeric error code surfaced in the JSON body.
    pub fn errno(&self) -> u32 {
        match self {
            GatewayError::ConfigLoad(_) => 1000,
            GatewayError::NoMatch { .. } => 1001,
            GatewayError::ServiceMissing => 2001,
            GatewayError::BackendSelection { .. } => 2002,
            GatewayError::Proxy => 2003,
            GatewayError::InvalidRewrite(_) => 2004,
            GatewayError::LimitExceeded { .. } => 5001,
            GatewayError::QuotaExceeded { .. } => 5002,
            GatewayError::Unauthorized(_) => 6001,
            GatewayError::Forbidden(_) => 7001,
            GatewayError::Transport(_) => 8001,
        }
    }

    /// HTTP status used when the error is written as a response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ConfigLoad(_)
            | GatewayError::ServiceMissing
            | GatewayError::InvalidRewrite(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::NoMatch { .. } => StatusCode::NOT_FOUND,
            GatewayError::BackendSelection { .. }
            | GatewayError::Proxy
            | GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::LimitExceeded { .. } | GatewayError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    errno: u32,
    errmsg: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            errno: self.errno(),
            errmsg: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Result alias for request-facing operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
