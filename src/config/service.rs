//! Service definitions as stored in the service file, and the validated
//! [`ServiceRecord`] the registry serves from.
//!
//! A definition carries one optional section per protocol rule (`http_rule`,
//! `tcp_rule`, `grpc_rule`); exactly the section matching `kind` must be
//! present. [`ServiceDefinition::into_record`] enforces that, compiles rewrite
//! regexes, parses header names and client addresses, and normalizes backend
//! addresses so nothing needs re-validation on the request path.
use std::net::IpAddr;

use http::{HeaderName, HeaderValue};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    config::validation::{ValidationError, ValidationResult},
    core::backend::{BackendUrl, TcpBackendAddr},
};

/// Protocol a service is exposed on.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Http,
    Tcp,
    Grpc,
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolKind::Http => write!(f, "http"),
            ProtocolKind::Tcp => write!(f, "tcp"),
            ProtocolKind::Grpc => write!(f, "grpc"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HttpRuleType {
    /// Exact match against the request host (port stripped).
    Domain,
    /// String prefix match against the request path.
    PrefixUrl,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    Random,
    #[default]
    RoundRobin,
    WeightRoundRobin,
    ConsistentHash,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeaderOp {
    Add,
    Edit,
    Del,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HeaderTransformSection {
    pub op: HeaderOp,
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UrlRewriteSection {
    /// Regex applied to the request path.
    pub pattern: String,
    /// Replacement, may reference capture groups (`$1`).
    pub replacement: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpRuleSection {
    pub rule_type: HttpRuleType,
    pub rule: String,
    /// Remove the matched prefix before forwarding (prefix rules only).
    #[serde(default)]
    pub strip_uri: bool,
    #[serde(default)]
    pub url_rewrites: Vec<UrlRewriteSection>,
    #[serde(default)]
    pub header_transforms: Vec<HeaderTransformSection>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct PortRule {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoadBalanceSection {
    pub strategy: LoadBalanceStrategy,
    pub addrs: Vec<String>,
    /// Per-address weights, same length as `addrs` (weighted strategy only).
    pub weights: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AccessSection {
    /// Enables tenant authentication and the allow / deny lists.
    pub open_auth: bool,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    /// Service-wide queries per second (0 = unlimited).
    pub service_flow_limit: u32,
    /// Queries per second per client address (0 = unlimited).
    pub client_ip_flow_limit: u32,
}

/// One service entry of the service file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ProtocolKind,
    #[serde(default)]
    pub http_rule: Option<HttpRuleSection>,
    #[serde(default)]
    pub tcp_rule: Option<PortRule>,
    #[serde(default)]
    pub grpc_rule: Option<PortRule>,
    #[serde(default)]
    pub load_balance: LoadBalanceSection,
    #[serde(default)]
    pub access: AccessSection,
}

/// Layout of the service definition file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ServiceDefinitionFile {
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

/// Routing rule of a validated service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingRule {
    Domain(String),
    Prefix(String),
    Port(u16),
}

#[derive(Debug, Clone)]
pub struct HeaderTransform {
    pub op: HeaderOp,
    pub name: HeaderName,
    pub value: HeaderValue,
}

#[derive(Debug, Clone)]
pub struct UrlRewrite {
    pub pattern: Regex,
    pub replacement: String,
}

/// Request rewriting applied to HTTP services before proxying.
#[derive(Debug, Clone, Default)]
pub struct HttpRewrite {
    pub strip_uri: bool,
    pub url_rewrites: Vec<UrlRewrite>,
    pub header_transforms: Vec<HeaderTransform>,
}

#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    pub open_auth: bool,
    pub allow_list: Vec<IpAddr>,
    pub deny_list: Vec<IpAddr>,
    pub service_flow_limit: u32,
    pub client_ip_flow_limit: u32,
}

#[derive(Debug, Clone)]
pub struct LoadBalanceConfig {
    pub strategy: LoadBalanceStrategy,
    /// Normalized addresses: `scheme://host:port[/path]` for HTTP, `host:port` otherwise.
    pub addrs: Vec<String>,
    /// One weight per address; all ones unless configured.
    pub weights: Vec<u32>,
}

/// A validated, immutable service.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub description: String,
    pub kind: ProtocolKind,
    pub rule: RoutingRule,
    pub load_balance: LoadBalanceConfig,
    pub access: AccessControl,
    pub rewrite: HttpRewrite,
}

impl ServiceRecord {
    /// Port a TCP / gRPC service listens on.
    pub fn port(&self) -> Option<u16> {
        match self.rule {
            RoutingRule::Port(port) => Some(port),
            _ => None,
        }
    }

    /// Flow accounting / limiting scope name of this service.
    pub fn flow_scope(&self) -> String {
        format!("service:{}", self.name)
    }
}

fn invalid(service: &str, field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidField {
        field: format!("service '{service}' {field}"),
        message: message.into(),
    }
}

impl ServiceDefinition {
    /// Port claimed by a TCP / gRPC rule, if any.
    pub fn bound_port(&self) -> Option<u16> {
        self.tcp_rule.or(self.grpc_rule).map(|rule| rule.port)
    }

    /// Validate this definition and convert it into a [`ServiceRecord`].
    pub fn into_record(self) -> ValidationResult<ServiceRecord> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "service name".to_string(),
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(
                &name,
                "name",
                "only ASCII letters, digits, '_' and '-' are allowed",
            ));
        }

        let (rule, rewrite) = match self.kind {
            ProtocolKind::Http => {
                if self.tcp_rule.is_some() || self.grpc_rule.is_some() {
                    return Err(invalid(&name, "rules", "http services take only http_rule"));
                }
                let http_rule = self
                    .http_rule
                    .ok_or_else(|| invalid(&name, "http_rule", "required for http services"))?;
                Self::http_rule(&name, http_rule)?
            }
            ProtocolKind::Tcp | ProtocolKind::Grpc => {
                if self.http_rule.is_some() {
                    return Err(invalid(
                        &name,
                        "http_rule",
                        format!("not allowed for {} services", self.kind),
                    ));
                }
                let port_rule = match self.kind {
                    ProtocolKind::Tcp if self.grpc_rule.is_none() => self.tcp_rule,
                    ProtocolKind::Grpc if self.tcp_rule.is_none() => self.grpc_rule,
                    _ => {
                        return Err(invalid(
                            &name,
                            "rules",
                            "tcp_rule and grpc_rule are mutually exclusive",
                        ));
                    }
                };
                let port = port_rule
                    .ok_or_else(|| {
                        invalid(&name, "rules", format!("{}_rule is required", self.kind))
                    })?
                    .port;
                if port == 0 {
                    return Err(invalid(&name, "port", "must be greater than 0"));
                }
                (RoutingRule::Port(port), HttpRewrite::default())
            }
        };

        let load_balance = Self::load_balance(&name, self.kind, self.load_balance)?;
        let access = Self::access(&name, self.access)?;

        Ok(ServiceRecord {
            name,
            description: self.description,
            kind: self.kind,
            rule,
            load_balance,
            access,
            rewrite,
        })
    }

    fn http_rule(name: &str, section: HttpRuleSection) -> ValidationResult<(RoutingRule, HttpRewrite)> {
        let rule = section.rule.trim().to_string();
        if rule.is_empty() {
            return Err(invalid(name, "http_rule.rule", "must not be empty"));
        }

        let routing = match section.rule_type {
            HttpRuleType::Domain => {
                if rule.contains('/') || rule.contains(':') {
                    return Err(invalid(
                        name,
                        "http_rule.rule",
                        "domain rules take a bare host name",
                    ));
                }
                RoutingRule::Domain(rule)
            }
            HttpRuleType::PrefixUrl => {
                if !rule.starts_with('/') {
                    return Err(invalid(name, "http_rule.rule", "prefix rules must start with '/'"));
                }
                RoutingRule::Prefix(rule)
            }
        };

        if section.strip_uri && !matches!(routing, RoutingRule::Prefix(_)) {
            return Err(invalid(name, "http_rule.strip_uri", "only valid for prefix rules"));
        }

        let mut url_rewrites = Vec::with_capacity(section.url_rewrites.len());
        for rewrite in section.url_rewrites {
            let pattern = Regex::new(&rewrite.pattern).map_err(|e| {
                invalid(name, "http_rule.url_rewrites", format!("'{}': {e}", rewrite.pattern))
            })?;
            url_rewrites.push(UrlRewrite {
                pattern,
                replacement: rewrite.replacement,
            });
        }

        let mut header_transforms = Vec::with_capacity(section.header_transforms.len());
        for transform in section.header_transforms {
            let header_name = HeaderName::from_bytes(transform.name.as_bytes()).map_err(|e| {
                invalid(name, "http_rule.header_transforms", format!("'{}': {e}", transform.name))
            })?;
            let value = HeaderValue::from_str(&transform.value).map_err(|e| {
                invalid(name, "http_rule.header_transforms", format!("'{}': {e}", transform.value))
            })?;
            header_transforms.push(HeaderTransform {
                op: transform.op,
                name: header_name,
                value,
            });
        }

        Ok((
            routing,
            HttpRewrite {
                strip_uri: section.strip_uri,
                url_rewrites,
                header_transforms,
            },
        ))
    }

    fn load_balance(
        name: &str,
        kind: ProtocolKind,
        section: LoadBalanceSection,
    ) -> ValidationResult<LoadBalanceConfig> {
        let mut addrs = Vec::with_capacity(section.addrs.len());
        for addr in &section.addrs {
            let normalized = match kind {
                ProtocolKind::Http => BackendUrl::new(addr)
                    .map_err(|e| invalid(name, "load_balance.addrs", e.to_string()))?
                    .into_string(),
                ProtocolKind::Tcp | ProtocolKind::Grpc => TcpBackendAddr::new(addr)
                    .map_err(|e| invalid(name, "load_balance.addrs", e.to_string()))?
                    .into_string(),
            };
            addrs.push(normalized);
        }

        let weights = if section.weights.is_empty() {
            vec![1; addrs.len()]
        } else if section.weights.len() != addrs.len() {
            return Err(invalid(
                name,
                "load_balance.weights",
                format!(
                    "expected {} weights, got {}",
                    addrs.len(),
                    section.weights.len()
                ),
            ));
        } else {
            section.weights
        };

        if section.strategy == LoadBalanceStrategy::WeightRoundRobin && weights.contains(&0) {
            return Err(invalid(name, "load_balance.weights", "weights must be positive"));
        }

        Ok(LoadBalanceConfig {
            strategy: section.strategy,
            addrs,
            weights,
        })
    }

    fn access(name: &str, section: AccessSection) -> ValidationResult<AccessControl> {
        let parse_list = |field: &str, list: Vec<String>| -> ValidationResult<Vec<IpAddr>> {
            list.iter()
                .map(|ip| {
                    ip.trim()
                        .parse::<IpAddr>()
                        .map_err(|e| invalid(name, field, format!("'{ip}': {e}")))
                })
                .collect()
        };

        Ok(AccessControl {
            open_auth: section.open_auth,
            allow_list: parse_list("access.allow_list", section.allow_list)?,
            deny_list: parse_list("access.deny_list", section.deny_list)?,
            service_flow_limit: section.service_flow_limit,
            client_ip_flow_limit: section.client_ip_flow_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_definition(rule_type: HttpRuleType, rule: &str) -> ServiceDefinition {
        ServiceDefinition {
            name: "svc1".to_string(),
            description: String::new(),
            kind: ProtocolKind::Http,
            http_rule: Some(HttpRuleSection {
                rule_type,
                rule: rule.to_string(),
                strip_uri: false,
                url_rewrites: vec![],
                header_transforms: vec![],
            }),
            tcp_rule: None,
            grpc_rule: None,
            load_balance: LoadBalanceSection {
                addrs: vec!["127.0.0.1:9001".to_string()],
                ..Default::default()
            },
            access: AccessSection::default(),
        }
    }

    #[test]
    fn test_http_prefix_record() {
        let record = http_definition(HttpRuleType::PrefixUrl, "/svc1")
            .into_record()
            .unwrap();
        assert_eq!(record.rule, RoutingRule::Prefix("/svc1".to_string()));
        assert_eq!(record.load_balance.addrs, vec!["http://127.0.0.1:9001"]);
        assert_eq!(record.load_balance.weights, vec![1]);
        assert_eq!(record.flow_scope(), "service:svc1");
        assert_eq!(record.port(), None);
    }

    #[test]
    fn test_prefix_must_start_with_slash() {
        let err = http_definition(HttpRuleType::PrefixUrl, "svc1")
            .into_record()
            .unwrap_err();
        assert!(err.to_string().contains("must start with '/'"));
    }

    #[test]
    fn test_domain_rejects_port() {
        assert!(
            http_definition(HttpRuleType::Domain, "www.test.com:8080")
                .into_record()
                .is_err()
        );
    }

    #[test]
    fn test_rules_are_mutually_exclusive() {
        let mut definition = http_definition(HttpRuleType::PrefixUrl, "/svc1");
        definition.tcp_rule = Some(PortRule { port: 9100 });
        assert!(definition.into_record().is_err());

        let mut definition = http_definition(HttpRuleType::PrefixUrl, "/svc1");
        definition.kind = ProtocolKind::Tcp;
        definition.tcp_rule = Some(PortRule { port: 9100 });
        assert!(definition.into_record().is_err());
    }

    #[test]
    fn test_tcp_record() {
        let definition = ServiceDefinition {
            name: "tcp_svc".to_string(),
            description: String::new(),
            kind: ProtocolKind::Tcp,
            http_rule: None,
            tcp_rule: Some(PortRule { port: 9100 }),
            grpc_rule: None,
            load_balance: LoadBalanceSection {
                addrs: vec!["127.0.0.1:7001".to_string()],
                ..Default::default()
            },
            access: AccessSection {
                allow_list: vec!["10.0.0.1".to_string()],
                service_flow_limit: 5,
                ..Default::default()
            },
        };
        let record = definition.into_record().unwrap();
        assert_eq!(record.port(), Some(9100));
        assert_eq!(record.access.service_flow_limit, 5);
        assert_eq!(record.access.allow_list, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_tcp_addr_requires_port() {
        let definition = ServiceDefinition {
            name: "tcp_svc".to_string(),
            description: String::new(),
            kind: ProtocolKind::Tcp,
            http_rule: None,
            tcp_rule: Some(PortRule { port: 9100 }),
            grpc_rule: None,
            load_balance: LoadBalanceSection {
                addrs: vec!["127.0.0.1".to_string()],
                ..Default::default()
            },
            access: AccessSection::default(),
        };
        assert!(definition.into_record().is_err());
    }

    #[test]
    fn test_weights_length_must_match() {
        let mut definition = http_definition(HttpRuleType::PrefixUrl, "/svc1");
        definition.load_balance.weights = vec![1, 2];
        assert!(definition.into_record().is_err());
    }

    #[test]
    fn test_invalid_rewrite_regex() {
        let mut definition = http_definition(HttpRuleType::PrefixUrl, "/svc1");
        if let Some(rule) = definition.http_rule.as_mut() {
            rule.url_rewrites.push(UrlRewriteSection {
                pattern: "(".to_string(),
                replacement: String::new(),
            });
        }
        assert!(definition.into_record().is_err());
    }

    #[test]
    fn test_strip_uri_only_for_prefix() {
        let mut definition = http_definition(HttpRuleType::Domain, "www.test.com");
        if let Some(rule) = definition.http_rule.as_mut() {
            rule.strip_uri = true;
        }
        assert!(definition.into_record().is_err());
    }

    #[test]
    fn test_yaml_definition() {
        let yaml = r#"
name: svc1
kind: http
http_rule:
  rule_type: prefix_url
  rule: /svc1
  strip_uri: true
  header_transforms:
    - { op: add, name: x-gateway, value: tollgate }
    - { op: del, name: cookie }
load_balance:
  strategy: weight_round_robin
  addrs: ["http://127.0.0.1:9001", "127.0.0.1:9002"]
  weights: [3, 1]
access:
  open_auth: true
  deny_list: ["192.168.1.9"]
"#;
        // Parsed through the config crate, the same path the file store uses.
        let definition: ServiceDefinition = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let record = definition.into_record().unwrap();
        assert!(record.rewrite.strip_uri);
        assert_eq!(record.rewrite.header_transforms.len(), 2);
        assert_eq!(record.load_balance.weights, vec![3, 1]);
        assert_eq!(record.load_balance.addrs[1], "http://127.0.0.1:9002");
        assert!(record.access.open_auth);
    }
}
