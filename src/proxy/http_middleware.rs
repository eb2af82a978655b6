//! The HTTP stage chain.
//!
//! Every stage is an axum `from_fn_with_state` middleware over the shared
//! [`GatewayContext`]. The first stage resolves the service and stores it in
//! the request extensions; later stages read it from there and short-circuit
//! with a [`GatewayError`] response when a check fails.
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, Uri, header},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use crate::{
    config::{
        models::TenantConfig,
        service::{HeaderOp, RoutingRule, ServiceRecord},
    },
    core::{
        GatewayContext,
        flow_counter::{TOTAL_SCOPE, app_scope, service_scope},
    },
    error::{GatewayError, GatewayResult},
    proxy::access::{check_allow_list, check_deny_list, client_flow_scope},
    tracing_setup::create_request_span,
};

pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// The service matched for a request.
#[derive(Debug, Clone)]
pub struct MatchedService(pub Arc<ServiceRecord>);

/// The tenant authenticated for a request.
#[derive(Debug, Clone)]
pub struct MatchedTenant(pub TenantConfig);

pub(crate) fn matched_service(req: &Request) -> GatewayResult<Arc<ServiceRecord>> {
    req.extensions()
        .get::<MatchedService>()
        .map(|matched| matched.0.clone())
        .ok_or(GatewayError::ServiceMissing)
}

pub(crate) fn client_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn request_host(req: &Request) -> &str {
    req.uri()
        .host()
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
        })
        .unwrap_or_default()
}

/// Replace the request path, keeping the query string.
fn replace_path(req: &mut Request, path: &str) -> GatewayResult<()> {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| GatewayError::InvalidRewrite(format!("{path_and_query}: {e}")))?,
    );
    *req.uri_mut() =
        Uri::from_parts(parts).map_err(|e| GatewayError::InvalidRewrite(e.to_string()))?;
    Ok(())
}

/// Tag the request with an `x-trace-id` (kept when the client sent one) and
/// run the rest of the chain inside a request span.
pub async fn trace_id(mut req: Request, next: Next) -> Response {
    let trace_id = req
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let header_value = HeaderValue::from_str(&trace_id).ok();
    if let Some(value) = &header_value {
        req.headers_mut().insert(TRACE_ID_HEADER, value.clone());
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let span = create_request_span(method.as_str(), &path, &trace_id);
    let start = Instant::now();

    let mut response = next.run(req).instrument(span.clone()).await;

    let elapsed = start.elapsed();
    span.record("http.status_code", response.status().as_u16());
    span.record("duration_ms", elapsed.as_millis() as u64);
    tracing::info!(
        parent: &span,
        "Completed {} {} - {} in {:?}",
        method,
        path,
        response.status(),
        elapsed
    );

    if let Some(value) = header_value {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

/// Resolve the service from host and path.
pub async fn access_mode(
    State(ctx): State<Arc<GatewayContext>>,
    mut req: Request,
    next: Next,
) -> GatewayResult<Response> {
    let service = ctx
        .registry()
        .match_http(request_host(&req), req.uri().path())?;
    tracing::debug!(service = %service.name, "Matched HTTP service");
    req.extensions_mut().insert(MatchedService(service));
    Ok(next.run(req).await)
}

/// Count the request against the gateway total and its service.
pub async fn flow_count(
    State(ctx): State<Arc<GatewayContext>>,
    req: Request,
    next: Next,
) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    ctx.counters().counter(TOTAL_SCOPE).await.increase();
    ctx.counters()
        .counter(&service_scope(&service.name))
        .await
        .increase();
    Ok(next.run(req).await)
}

/// Apply the service-wide and per-client token buckets.
pub async fn flow_limit(
    State(ctx): State<Arc<GatewayContext>>,
    req: Request,
    next: Next,
) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    let access = &service.access;

    if access.service_flow_limit > 0 {
        let scope = service.flow_scope();
        if !ctx.limiters().allow(&scope, access.service_flow_limit).await {
            return Err(GatewayError::LimitExceeded {
                scope,
                qps: access.service_flow_limit,
            });
        }
    }

    if access.client_ip_flow_limit > 0 {
        if let Some(ip) = client_ip(&req) {
            let allowed = ctx
                .limiters()
                .allow_client(&service.flow_scope(), ip, access.client_ip_flow_limit)
                .await;
            if !allowed {
                return Err(GatewayError::LimitExceeded {
                    scope: client_flow_scope(&service, ip),
                    qps: access.client_ip_flow_limit,
                });
            }
        }
    }

    Ok(next.run(req).await)
}

/// Resolve the tenant from the bearer token of `open_auth` services.
pub async fn jwt_auth(
    State(ctx): State<Arc<GatewayContext>>,
    mut req: Request,
    next: Next,
) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    if service.access.open_auth {
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let tenant = ctx.tenants().authenticate(authorization)?.clone();
        tracing::debug!(app_id = %tenant.app_id, "Authenticated tenant");
        req.extensions_mut().insert(MatchedTenant(tenant));
    }
    Ok(next.run(req).await)
}

/// Count the tenant's request and enforce its daily quota and rate.
pub async fn jwt_flow(
    State(ctx): State<Arc<GatewayContext>>,
    req: Request,
    next: Next,
) -> GatewayResult<Response> {
    if let Some(MatchedTenant(tenant)) = req.extensions().get::<MatchedTenant>().cloned() {
        let scope = app_scope(&tenant.app_id);
        let counter = ctx.counters().counter(&scope).await;
        counter.increase();

        if tenant.qpd > 0 && counter.day_total() > tenant.qpd {
            return Err(GatewayError::QuotaExceeded {
                scope,
                qpd: tenant.qpd,
            });
        }
        if tenant.qps > 0 && !ctx.limiters().allow(&scope, tenant.qps).await {
            return Err(GatewayError::LimitExceeded {
                scope,
                qps: tenant.qps,
            });
        }
    }
    Ok(next.run(req).await)
}

pub async fn allow_list(req: Request, next: Next) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    check_allow_list(&service.access, client_ip(&req))?;
    Ok(next.run(req).await)
}

pub async fn deny_list(req: Request, next: Next) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    check_deny_list(&service.access, client_ip(&req))?;
    Ok(next.run(req).await)
}

/// Apply the service's header transforms. `add` appends a value, `edit`
/// replaces every value, `del` removes the header.
pub async fn header_transfer(mut req: Request, next: Next) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    let headers = req.headers_mut();
    for transform in &service.rewrite.header_transforms {
        match transform.op {
            HeaderOp::Add => {
                headers.append(transform.name.clone(), transform.value.clone());
            }
            HeaderOp::Edit => {
                headers.insert(transform.name.clone(), transform.value.clone());
            }
            HeaderOp::Del => {
                headers.remove(&transform.name);
            }
        }
    }
    Ok(next.run(req).await)
}

/// Remove the matched prefix from the path of `strip_uri` services.
pub async fn strip_uri(mut req: Request, next: Next) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    if let (true, RoutingRule::Prefix(prefix)) = (service.rewrite.strip_uri, &service.rule) {
        if let Some(rest) = req.uri().path().strip_prefix(prefix.as_str()) {
            let path = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            };
            replace_path(&mut req, &path)?;
        }
    }
    Ok(next.run(req).await)
}

/// Run the path through every rewrite rule in order.
pub async fn url_rewrite(mut req: Request, next: Next) -> GatewayResult<Response> {
    let service = matched_service(&req)?;
    let rewrites = &service.rewrite.url_rewrites;
    if !rewrites.is_empty() {
        let original = req.uri().path().to_string();
        let path = rewrites.iter().fold(original.clone(), |path, rewrite| {
            rewrite
                .pattern
                .replace_all(&path, rewrite.replacement.as_str())
                .into_owned()
        });
        if path != original {
            tracing::debug!(from = %original, to = %path, "Rewrote request path");
            replace_path(&mut req, &path)?;
        }
    }
    Ok(next.run(req).await)
}
