//! HTTP and HTTPS listeners serving the stage chain.
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router, middleware,
    routing::{get, post},
    serve::ListenerExt,
};
use eyre::{Result, WrapErr};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::{
    http_endpoints::{issue_token, ping},
    http_middleware as stage,
    http_reverse_proxy::reverse_proxy,
};
use crate::{adapters::tls::bind_https, config::models::HttpsListenerConfig, core::GatewayContext};

/// Build the gateway router.
///
/// `/ping` and `/oauth/tokens` are answered by the gateway itself. Every other
/// request runs the stages in order and ends in the reverse proxy.
pub fn build_router(ctx: Arc<GatewayContext>) -> Router {
    let stages = ServiceBuilder::new()
        .layer(middleware::from_fn_with_state(ctx.clone(), stage::access_mode))
        .layer(middleware::from_fn_with_state(ctx.clone(), stage::flow_count))
        .layer(middleware::from_fn_with_state(ctx.clone(), stage::flow_limit))
        .layer(middleware::from_fn_with_state(ctx.clone(), stage::jwt_auth))
        .layer(middleware::from_fn_with_state(ctx.clone(), stage::jwt_flow))
        .layer(middleware::from_fn(stage::allow_list))
        .layer(middleware::from_fn(stage::deny_list))
        .layer(middleware::from_fn(stage::header_transfer))
        .layer(middleware::from_fn(stage::strip_uri))
        .layer(middleware::from_fn(stage::url_rewrite));

    let proxy = Router::new()
        .fallback(reverse_proxy)
        .layer(stages)
        .with_state(ctx.clone());

    Router::new()
        .route("/ping", get(ping))
        .route("/oauth/tokens", post(issue_token))
        .fallback_service(proxy)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(stage::trace_id)),
        )
        .with_state(ctx)
}

/// Serve plain HTTP on an already bound listener until `shutdown` fires.
pub async fn serve_http(
    ctx: Arc<GatewayContext>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr().wrap_err("Failed to get local addr")?;
    tracing::info!("HTTP proxy listening on {}", local_addr);

    axum::serve(
        listener,
        build_router(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .wrap_err("HTTP proxy server error")?;

    tracing::info!("HTTP proxy on {} stopped", local_addr);
    Ok(())
}

/// Serve HTTPS with the configured certificate until `shutdown` fires.
pub async fn serve_https(
    ctx: Arc<GatewayContext>,
    https: &HttpsListenerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind_https(&https.addr, &https.cert_path, &https.key_path)
        .await?
        .tap_io(|_io| {});
    tracing::info!("HTTPS proxy listening on {}", https.addr);

    axum::serve(
        listener,
        build_router(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .wrap_err("HTTPS proxy server error")?;

    tracing::info!("HTTPS proxy on {} stopped", https.addr);
    Ok(())
}
