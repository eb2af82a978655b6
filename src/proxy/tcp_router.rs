//! One [`TcpServer`] per TCP / gRPC service.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use super::tcp_reverse_proxy::TcpProxyHandler;
use crate::{
    config::service::ProtocolKind,
    core::GatewayContext,
    tcp_server::{ServerError, ServerOptions, TcpServer},
};

pub struct TcpRouter {
    servers: Vec<Arc<TcpServer>>,
}

impl TcpRouter {
    /// Bind a listener for every TCP and gRPC service of the registry and
    /// start accepting on each.
    ///
    /// Connection tokens derive from `base`. If any port cannot be bound, the
    /// ports bound so far are closed again and the bind error is returned.
    pub async fn start(ctx: Arc<GatewayContext>, base: CancellationToken) -> Result<Self> {
        let options = ServerOptions::from(&ctx.config().tcp);
        let mut servers: Vec<Arc<TcpServer>> = Vec::new();

        for kind in [ProtocolKind::Tcp, ProtocolKind::Grpc] {
            for service in ctx.registry().list_by_protocol(kind) {
                let Some(port) = service.port() else {
                    continue;
                };
                let addr = ctx.config().tcp.listen_addr(port);
                let handler = Arc::new(TcpProxyHandler::new(ctx.clone(), service.clone()));
                let server = Arc::new(
                    TcpServer::new(addr.clone(), handler, options).with_base_token(base.clone()),
                );

                let listener = match server.bind().await {
                    Ok(listener) => listener,
                    Err(e) => {
                        for started in &servers {
                            started.close();
                        }
                        return Err(e).wrap_err_with(|| {
                            format!("Failed to start {} proxy for service '{}'", kind, service.name)
                        });
                    }
                };

                let serving = server.clone();
                let name = service.name.clone();
                tokio::spawn(async move {
                    tracing::info!(service = %name, %kind, "{} proxy listening on {}", kind, addr);
                    match serving.serve(listener).await {
                        Err(ServerError::ServerClosed) | Ok(()) => {
                            tracing::info!(service = %name, "{} proxy on {} stopped", kind, addr);
                        }
                        Err(e) => tracing::error!(service = %name, "{} proxy failed: {}", kind, e),
                    }
                });
                servers.push(server);
            }
        }

        Ok(Self { servers })
    }

    pub fn servers(&self) -> &[Arc<TcpServer>] {
        &self.servers
    }

    /// Stop accepting on every port without waiting for open connections.
    pub fn close(&self) {
        for server in &self.servers {
            server.close();
        }
    }

    /// Close every port and wait up to `timeout` for open connections.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let drained = join_all(self.servers.iter().map(|server| server.shutdown(timeout))).await;
        drained.into_iter().all(|ok| ok)
    }
}
