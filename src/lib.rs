//! tollgate - an API gateway data plane.
//!
//! tollgate exposes HTTP, TCP and gRPC backends behind one gateway process. HTTP
//! requests are routed by host or path prefix and pass a fixed chain of policy
//! stages before they are proxied; TCP and gRPC services each own a listening port
//! and are proxied byte for byte after per-connection admission checks.
//!
//! # Features
//! - Domain and path-prefix routing, first registered service wins
//! - Random, round-robin, smooth weighted round-robin and consistent-hash backend selection
//! - Flow counting per gateway, service and tenant with day / hour aggregates in redis
//! - Token-bucket limits per service, per client address and per tenant
//! - JWT tenant authentication with per-tenant daily quotas
//! - Allow / deny lists, header transforms, prefix stripping and regex path rewrites
//! - Graceful shutdown with bounded connection draining
//!
//! # Architecture
//! As in a hexagonal layout, **ports** (traits) are separated from **adapters**
//! (implementations). Routing, selection and flow accounting live in `core`, and the
//! request / connection data paths live in `proxy` on top of the `tcp_server` core.
//! Every shared runtime object is owned by one [`GatewayContext`].
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use tollgate::{GatewayContext, TcpRouter, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("gateway.yaml")?;
//! let ctx = Arc::new(GatewayContext::from_config(config).await?);
//! let router = tollgate::proxy::build_router(ctx.clone());
//! let tcp = TcpRouter::start(ctx, CancellationToken::new()).await?;
//! # let _ = (router, tcp);
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request-facing failures are [`error::GatewayError`] values rendered as
//! `{"errno", "errmsg"}` JSON. Startup paths return `eyre::Result<T>` with
//! `WrapErr` context attached.
//!
//! # Concurrency & Data Structures
//! Flow counters and limiters are kept in `scc::HashMap`s so lookup-or-create is a
//! single critical section per scope.
pub mod config;
pub mod error;
pub mod ports;
pub mod proxy;
pub mod tcp_server;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::HttpClientAdapter,
    core::GatewayContext,
    error::{GatewayError, GatewayResult},
    ports::http_client::HttpClient,
    proxy::TcpRouter,
    utils::{ConnectionTracker, GracefulShutdown},
};
