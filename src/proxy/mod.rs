//! The data path: HTTP stage chain and reverse proxy, and the per-port TCP
//! listeners with their admission stages and byte-copy proxy.
pub mod access;
pub mod http_endpoints;
pub mod http_middleware;
pub mod http_reverse_proxy;
pub mod http_router;
pub mod tcp_middleware;
pub mod tcp_reverse_proxy;
pub mod tcp_router;

pub use http_router::{build_router, serve_http, serve_https};
pub use tcp_router::TcpRouter;
