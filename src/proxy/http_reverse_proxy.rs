//! Final HTTP stage: pick a backend for the matched service and forward.
use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Request, State},
    http::{
        HeaderValue, Uri,
        header::{self, HeaderName},
        uri::PathAndQuery,
    },
    response::Response,
};
use tracing::Instrument;

use crate::{
    core::GatewayContext,
    error::{GatewayError, GatewayResult},
    proxy::http_middleware::{client_ip, matched_service},
    tracing_setup::create_backend_span,
};

const DEFAULT_USER_AGENT: &str = concat!("tollgate/", env!("CARGO_PKG_VERSION"));

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe one hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// Join two path segments with exactly one slash between them.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Target query first, joined with `&` when both are present.
pub fn merge_query(target: Option<&str>, inbound: Option<&str>) -> Option<String> {
    match (target.filter(|q| !q.is_empty()), inbound.filter(|q| !q.is_empty())) {
        (Some(t), Some(i)) => Some(format!("{t}&{i}")),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    }
}

/// Point `req` at `target` (`scheme://authority[/path][?query]`).
///
/// The method and body are left untouched. `Host` becomes the target
/// authority and a default `User-Agent` is set only when the client sent none.
pub fn direct(req: &mut Request, target: &str) -> GatewayResult<()> {
    let target_uri: Uri = target
        .parse()
        .map_err(|e| GatewayError::InvalidRewrite(format!("backend '{target}': {e}")))?;
    let (Some(scheme), Some(authority)) = (target_uri.scheme().cloned(), target_uri.authority().cloned())
    else {
        return Err(GatewayError::InvalidRewrite(format!(
            "backend '{target}' has no scheme or authority"
        )));
    };

    let path = single_joining_slash(target_uri.path(), req.uri().path());
    let path_and_query = match merge_query(target_uri.query(), req.uri().query()) {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let path_and_query: PathAndQuery = path_and_query
        .parse()
        .map_err(|e| GatewayError::InvalidRewrite(format!("{e}")))?;

    *req.uri_mut() = Uri::builder()
        .scheme(scheme)
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| GatewayError::InvalidRewrite(e.to_string()))?;

    let headers = req.headers_mut();
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, host);
    }
    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }
    Ok(())
}

fn append_forwarded_for(req: &mut Request) {
    let Some(ip) = client_ip(req) else {
        return;
    };
    let value = match req
        .headers()
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        req.headers_mut().insert(X_FORWARDED_FOR.clone(), value);
    }
}

/// Fallback handler behind the stage chain.
pub async fn reverse_proxy(
    State(ctx): State<Arc<GatewayContext>>,
    mut req: Request,
) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    let selection_failed = |reason: String| GatewayError::BackendSelection {
        service: service.name.clone(),
        reason,
    };

    let balancer = ctx
        .balancers()
        .selector(&service)
        .map_err(|e| selection_failed(e.to_string()))?;
    let target = balancer
        .get(&req.uri().to_string())
        .map_err(|e| selection_failed(e.to_string()))?;

    append_forwarded_for(&mut req);
    direct(&mut req, &target)?;

    let span = create_backend_span(&target, req.method().as_str(), req.uri().path());
    let start = Instant::now();
    let result = ctx
        .http_client()
        .send_request(req)
        .instrument(span.clone())
        .await;
    span.record("duration_ms", start.elapsed().as_millis() as u64);

    result.map_err(|e| {
        tracing::error!(service = %service.name, backend = %target, "Backend request failed: {}", e);
        GatewayError::Proxy
    })
}
