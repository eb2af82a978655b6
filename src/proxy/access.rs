//! Client address checks shared by the HTTP and TCP paths.
//!
//! Allow and deny lists only apply to services with `open_auth`. A non-empty
//! allow list admits listed clients only, and the deny list is consulted only
//! while the allow list is empty.
use std::net::IpAddr;

use crate::{
    config::service::{AccessControl, ServiceRecord},
    error::{GatewayError, GatewayResult},
};

fn forbidden(client_ip: Option<IpAddr>) -> GatewayError {
    GatewayError::Forbidden(client_ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string()))
}

pub fn check_allow_list(access: &AccessControl, client_ip: Option<IpAddr>) -> GatewayResult<()> {
    if !access.open_auth || access.allow_list.is_empty() {
        return Ok(());
    }
    match client_ip {
        Some(ip) if access.allow_list.contains(&ip) => Ok(()),
        _ => Err(forbidden(client_ip)),
    }
}

pub fn check_deny_list(access: &AccessControl, client_ip: Option<IpAddr>) -> GatewayResult<()> {
    if !access.open_auth || !access.allow_list.is_empty() {
        return Ok(());
    }
    match client_ip {
        Some(ip) if access.deny_list.contains(&ip) => Err(forbidden(client_ip)),
        _ => Ok(()),
    }
}

/// Name of one client's bucket in a service, as reported when it is exhausted.
pub fn client_flow_scope(service: &ServiceRecord, client_ip: IpAddr) -> String {
    format!("{}_{}", service.flow_scope(), client_ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    fn access(open_auth: bool, allow: &[&str], deny: &[&str]) -> AccessControl {
        AccessControl {
            open_auth,
            allow_list: allow.iter().map(|s| s.parse().unwrap()).collect(),
            deny_list: deny.iter().map(|s| s.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_lists_ignored_without_open_auth() {
        let rules = access(false, &["10.0.0.1"], &["10.0.0.2"]);
        assert!(check_allow_list(&rules, ip("10.0.0.9")).is_ok());
        assert!(check_deny_list(&rules, ip("10.0.0.2")).is_ok());
    }

    #[test]
    fn test_allow_list() {
        let rules = access(true, &["10.0.0.1"], &[]);
        assert!(check_allow_list(&rules, ip("10.0.0.1")).is_ok());
        assert!(matches!(
            check_allow_list(&rules, ip("10.0.0.2")),
            Err(GatewayError::Forbidden(addr)) if addr == "10.0.0.2"
        ));
        assert!(check_allow_list(&rules, None).is_err());
    }

    #[test]
    fn test_deny_list_only_without_allow_list() {
        let rules = access(true, &[], &["10.0.0.2"]);
        assert!(check_deny_list(&rules, ip("10.0.0.2")).is_err());
        assert!(check_deny_list(&rules, ip("10.0.0.3")).is_ok());

        let rules = access(true, &["10.0.0.2"], &["10.0.0.2"]);
        assert!(check_deny_list(&rules, ip("10.0.0.2")).is_ok());
    }
}
