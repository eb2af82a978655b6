//! Port for forwarding a request to an HTTP backend.
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Why a forwarded request produced no backend response.
///
/// The message is logged only; clients always see the same 502 body.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    #[error("backend unreachable: {0}")]
    ConnectionError(String),

    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),

    #[error("request cannot be forwarded: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward `req`, whose URI is already absolute and points at the
    /// selected backend, and hand back the backend response unchanged.
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;
}
