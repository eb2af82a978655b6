//! Endpoints the gateway answers itself, ahead of the proxy stage chain.
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, header},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Serialize;

use crate::{
    core::GatewayContext,
    error::{GatewayError, GatewayResult},
};

#[derive(Debug, Serialize)]
pub struct Pong {
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub scope: &'static str,
}

pub async fn ping() -> Json<Pong> {
    Json(Pong { message: "pong" })
}

/// `Authorization: Basic base64(app_id:secret)`.
fn basic_credentials(headers: &HeaderMap) -> GatewayResult<(String, String)> {
    let unauthorized = |reason: &str| GatewayError::Unauthorized(reason.to_string());

    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .ok_or_else(|| unauthorized("missing basic credentials"))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| unauthorized("malformed basic credentials"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| unauthorized("malformed basic credentials"))?;
    let (app_id, secret) = decoded
        .split_once(':')
        .ok_or_else(|| unauthorized("malformed basic credentials"))?;
    Ok((app_id.to_string(), secret.to_string()))
}

/// Client-credentials exchange: a tenant trades its app id and secret for
/// the bearer token `open_auth` services demand.
pub async fn issue_token(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
) -> GatewayResult<Json<TokenResponse>> {
    let (app_id, secret) = basic_credentials(&headers)?;
    let access_token = ctx.tenants().exchange(&app_id, &secret)?;
    tracing::info!(app_id = %app_id, "Issued tenant token");

    Ok(Json(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in: ctx.tenants().token_ttl().num_seconds(),
        scope: "read_write",
    }))
}
