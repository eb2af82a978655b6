//! Admission stages run once per accepted TCP / gRPC connection.
//!
//! Stages run in order (flow count, flow limit, allow list, deny list) and the
//! first failure rejects the connection before any backend is dialed.
use std::net::SocketAddr;

use crate::{
    config::service::ServiceRecord,
    core::{
        GatewayContext,
        flow_counter::{TOTAL_SCOPE, service_scope},
    },
    error::{GatewayError, GatewayResult},
    proxy::access::{check_allow_list, check_deny_list, client_flow_scope},
};

pub async fn flow_count(ctx: &GatewayContext, service: &ServiceRecord) {
    ctx.counters().counter(TOTAL_SCOPE).await.increase();
    ctx.counters()
        .counter(&service_scope(&service.name))
        .await
        .increase();
}

pub async fn flow_limit(
    ctx: &GatewayContext,
    service: &ServiceRecord,
    remote_addr: SocketAddr,
) -> GatewayResult<()> {
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
        let ip = remote_addr.ip();
        let allowed = ctx
            .limiters()
            .allow_client(&service.flow_scope(), ip, access.client_ip_flow_limit)
            .await;
        if !allowed {
            return Err(GatewayError::LimitExceeded {
                scope: client_flow_scope(service, ip),
                qps: access.client_ip_flow_limit,
            });
        }
    }
    Ok(())
}

/// Run every admission stage for one connection.
pub async fn admit(
    ctx: &GatewayContext,
    service: &ServiceRecord,
    remote_addr: SocketAddr,
) -> GatewayResult<()> {
    flow_count(ctx, service).await;
    flow_limit(ctx, service, remote_addr).await?;
    check_allow_list(&service.access, Some(remote_addr.ip()))?;
    check_deny_list(&service.access, Some(remote_addr.ip()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        adapters::{HttpClientAdapter, MemoryAggregateStore},
        config::{models::GatewayConfig, service::ServiceDefinition},
        core::ServiceRegistry,
    };

    fn tcp_service(access: serde_json::Value) -> Arc<ServiceRecord> {
        let definition: ServiceDefinition = serde_json::from_value(json!({
            "name": "db",
            "kind": "tcp",
            "tcp_rule": {"port": 9300},
            "load_balance": {"addrs": ["127.0.0.1:5432"]},
            "access": access,
        }))
        .unwrap();
        Arc::new(definition.into_record().unwrap())
    }

    fn context(service: &Arc<ServiceRecord>) -> GatewayContext {
        let mut config = GatewayConfig::default();
        config.flow.flush_interval_ms = 60_000;
        GatewayContext::new(
            Arc::new(config),
            Arc::new(ServiceRegistry::from_records(vec![service.as_ref().clone()])),
            Arc::new(MemoryAggregateStore::new()),
            Arc::new(HttpClientAdapter::new(None).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_client_limit_is_per_address() {
        let service = tcp_service(json!({"client_ip_flow_limit": 1}));
        let ctx = context(&service);
        let first: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let second: SocketAddr = "10.0.0.2:4000".parse().unwrap();

        for _ in 0..3 {
            assert!(admit(&ctx, &service, first).await.is_ok());
        }
        assert!(matches!(
            admit(&ctx, &service, first).await,
            Err(GatewayError::LimitExceeded { scope, .. }) if scope == "service:db_10.0.0.1"
        ));
        assert!(admit(&ctx, &service, second).await.is_ok());

        let total = ctx.counters().counter(TOTAL_SCOPE).await;
        assert_eq!(total.pending(), 5);
    }

    #[tokio::test]
    async fn test_deny_list_rejects() {
        let service = tcp_service(json!({"open_auth": true, "deny_list": ["10.0.0.9"]}));
        let ctx = context(&service);

        let denied: SocketAddr = "10.0.0.9:1".parse().unwrap();
        let allowed: SocketAddr = "10.0.0.8:1".parse().unwrap();
        assert!(matches!(
            admit(&ctx, &service, denied).await,
            Err(GatewayError::Forbidden(_))
        ));
        assert!(admit(&ctx, &service, allowed).await.is_ok());
    }
}
