//! Byte-copy proxy for TCP and gRPC services.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{io::copy_bidirectional, net::TcpStream, time::timeout};

use crate::{
    config::service::ServiceRecord,
    core::GatewayContext,
    error::{GatewayError, GatewayResult},
    proxy::tcp_middleware,
    tcp_server::{Connection, TcpHandler},
};

/// Handler bound to one TCP / gRPC service port.
pub struct TcpProxyHandler {
    ctx: Arc<GatewayContext>,
    service: Arc<ServiceRecord>,
    connect_timeout: Duration,
}

impl TcpProxyHandler {
    pub fn new(ctx: Arc<GatewayContext>, service: Arc<ServiceRecord>) -> Self {
        let connect_timeout = ctx.config().tcp.connect_timeout();
        Self {
            ctx,
            service,
            connect_timeout,
        }
    }

    async fn dial(&self, conn: &Connection) -> GatewayResult<(String, TcpStream)> {
        let balancer = self.ctx.balancers().selector(&self.service).map_err(|e| {
            GatewayError::BackendSelection {
                service: self.service.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let backend = balancer
            .get(&conn.remote_addr().to_string())
            .map_err(|e| GatewayError::BackendSelection {
                service: self.service.name.clone(),
                reason: e.to_string(),
            })?;

        let upstream = timeout(self.connect_timeout, TcpStream::connect(&backend))
            .await
            .map_err(|_| {
                GatewayError::Transport(format!(
                    "connect to {backend} timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| GatewayError::Transport(format!("connect to {backend} failed: {e}")))?;
        let _ = upstream.set_nodelay(true);
        Ok((backend, upstream))
    }
}

#[async_trait]
impl TcpHandler for TcpProxyHandler {
    async fn serve_tcp(&self, mut conn: Connection) {
        let remote_addr = conn.remote_addr();

        if let Err(e) = tcp_middleware::admit(&self.ctx, &self.service, remote_addr).await {
            tracing::info!(service = %self.service.name, %remote_addr, "Connection rejected: {}", e);
            return;
        }

        let (backend, mut upstream) = match self.dial(&conn).await {
            Ok(dialed) => dialed,
            Err(e) => {
                tracing::warn!(service = %self.service.name, %remote_addr, "{}", e);
                return;
            }
        };

        tracing::debug!(service = %self.service.name, %remote_addr, %backend, "Proxying connection");
        let cancel = conn.cancel_token().clone();
        let copied = tokio::select! {
            copied = copy_bidirectional(conn.stream(), &mut upstream) => copied,
            _ = cancel.cancelled() => {
                tracing::info!(service = %self.service.name, %remote_addr, "Connection cancelled");
                return;
            }
        };
        match copied {
            Ok((sent, received)) => tracing::debug!(
                service = %self.service.name,
                %remote_addr,
                sent,
                received,
                "Connection finished"
            ),
            Err(e) => tracing::debug!(
                service = %self.service.name,
                %remote_addr,
                "Connection ended with error: {}",
                e
            ),
        }
    }
}
