//! In-memory service registry and HTTP routing-rule matcher.
//!
//! Services are bulk loaded once from a [`ServiceStore`] into an immutable
//! snapshot. HTTP requests are matched against the snapshot in load order and
//! the first matching rule wins, regardless of how specific later rules are.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{
    config::{
        GatewayConfigValidator,
        service::{ProtocolKind, RoutingRule, ServiceDefinition, ServiceRecord},
    },
    error::{GatewayError, GatewayResult},
    ports::service_store::ServiceStore,
};

const PAGE_SIZE: usize = 100;

/// Why the one-time bulk load failed. Cached and handed to every caller.
#[derive(Error, Debug, Clone)]
#[error("service registry load failed: {message}")]
pub struct RegistryLoadError {
    pub message: String,
}

impl From<RegistryLoadError> for GatewayError {
    fn from(e: RegistryLoadError) -> Self {
        GatewayError::ConfigLoad(e.message)
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    by_name: HashMap<String, Arc<ServiceRecord>>,
    ordered: Vec<Arc<ServiceRecord>>,
}

impl Snapshot {
    fn from_records(records: Vec<ServiceRecord>) -> Self {
        let mut snapshot = Snapshot::default();
        for record in records {
            let record = Arc::new(record);
            snapshot.by_name.insert(record.name.clone(), record.clone());
            snapshot.ordered.push(record);
        }
        snapshot
    }
}

pub struct ServiceRegistry {
    store: Option<Arc<dyn ServiceStore>>,
    loaded: OnceCell<Result<(), RegistryLoadError>>,
    snapshot: RwLock<Snapshot>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn ServiceStore>) -> Self {
        Self {
            store: Some(store),
            loaded: OnceCell::new(),
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// A registry already holding `records`, in order.
    pub fn from_records(records: Vec<ServiceRecord>) -> Self {
        Self {
            store: None,
            loaded: OnceCell::new_with(Some(Ok(()))),
            snapshot: RwLock::new(Snapshot::from_records(records)),
        }
    }

    /// Fetch and validate every service definition, once.
    ///
    /// Later calls return the first outcome without touching the store again.
    pub async fn load(&self) -> Result<(), RegistryLoadError> {
        self.loaded.get_or_init(|| self.fetch_all()).await.clone()
    }

    async fn fetch_all(&self) -> Result<(), RegistryLoadError> {
        let store = self.store.as_ref().ok_or_else(|| RegistryLoadError {
            message: "no service store configured".to_string(),
        })?;

        let mut definitions: Vec<ServiceDefinition> = Vec::new();
        let mut page_no = 1;
        loop {
            let page = store
                .list_services(page_no, PAGE_SIZE)
                .await
                .map_err(|e| RegistryLoadError {
                    message: format!("{e:#}"),
                })?;
            let fetched = page.items.len();
            definitions.extend(page.items);
            if fetched == 0 || definitions.len() >= page.total {
                break;
            }
            page_no += 1;
        }

        GatewayConfigValidator::validate_services(&definitions).map_err(|e| RegistryLoadError {
            message: e.to_string(),
        })?;
        let records = definitions
            .into_iter()
            .map(ServiceDefinition::into_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RegistryLoadError {
                message: e.to_string(),
            })?;

        tracing::info!("Loaded {} service(s)", records.len());
        for record in &records {
            tracing::debug!(service = %record.name, kind = %record.kind, rule = ?record.rule, "Registered service");
        }

        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) =
            Snapshot::from_records(records);
        Ok(())
    }

    /// First HTTP service, in load order, whose rule matches the request.
    pub fn match_http(&self, host: &str, path: &str) -> GatewayResult<Arc<ServiceRecord>> {
        let bare_host = strip_port(host);
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);

        snapshot
            .ordered
            .iter()
            .filter(|record| record.kind == ProtocolKind::Http)
            .find(|record| match &record.rule {
                RoutingRule::Domain(domain) => domain == bare_host,
                RoutingRule::Prefix(prefix) => path.starts_with(prefix.as_str()),
                RoutingRule::Port(_) => false,
            })
            .cloned()
            .ok_or_else(|| GatewayError::NoMatch {
                host: host.to_string(),
                path: path.to_string(),
            })
    }

    pub fn list_by_protocol(&self, kind: ProtocolKind) -> Vec<Arc<ServiceRecord>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .iter()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceRecord>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drop a `:port` suffix. Bracketed IPv6 hosts lose their brackets too.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        // A bare IPv6 address has several colons and no port.
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::service::{HttpRuleSection, HttpRuleType, LoadBalanceSection},
        ports::service_store::ServicePage,
    };

    fn http_definition(name: &str, rule_type: HttpRuleType, rule: &str) -> ServiceDefinition {
        ServiceDefinition {
            name: name.to_string(),
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
            access: Default::default(),
        }
    }

    struct CountingStore {
        definitions: Vec<ServiceDefinition>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ServiceStore for CountingStore {
        async fn list_services(&self, page_no: usize, page_size: usize) -> eyre::Result<ServicePage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(eyre::eyre!("database is down"));
            }
            let items = self
                .definitions
                .iter()
                .skip((page_no - 1) * page_size)
                .take(page_size)
                .cloned()
                .collect();
            Ok(ServicePage {
                items,
                total: self.definitions.len(),
            })
        }
    }

    fn registry_of(definitions: Vec<ServiceDefinition>) -> ServiceRegistry {
        ServiceRegistry::from_records(
            definitions
                .into_iter()
                .map(|d| d.into_record().unwrap())
                .collect(),
        )
    }

    #[test]
    fn test_domain_match_strips_port_and_is_case_sensitive() {
        let registry = registry_of(vec![http_definition("web", HttpRuleType::Domain, "www.test.com")]);

        assert_eq!(registry.match_http("www.test.com:8080", "/").unwrap().name, "web");
        assert_eq!(registry.match_http("www.test.com", "/x").unwrap().name, "web");
        assert!(registry.match_http("WWW.TEST.COM", "/").is_err());
        assert!(registry.match_http("api.test.com", "/").is_err());
    }

    #[test]
    fn test_prefix_match() {
        let registry = registry_of(vec![http_definition("abc", HttpRuleType::PrefixUrl, "/abc")]);

        assert_eq!(registry.match_http("gw", "/abc/get").unwrap().name, "abc");
        let err = registry.match_http("gw", "/ab").unwrap_err();
        assert!(matches!(err, GatewayError::NoMatch { .. }));
    }

    #[test]
    fn test_first_loaded_wins() {
        let registry = registry_of(vec![
            http_definition("broad", HttpRuleType::PrefixUrl, "/api"),
            http_definition("narrow", HttpRuleType::PrefixUrl, "/api/v2"),
        ]);
        assert_eq!(registry.match_http("gw", "/api/v2/users").unwrap().name, "broad");

        let registry = registry_of(vec![
            http_definition("narrow", HttpRuleType::PrefixUrl, "/api/v2"),
            http_definition("broad", HttpRuleType::PrefixUrl, "/api"),
        ]);
        assert_eq!(registry.match_http("gw", "/api/v2/users").unwrap().name, "narrow");
    }

    #[tokio::test]
    async fn test_load_pages_once() {
        let definitions: Vec<_> = (0..250)
            .map(|i| http_definition(&format!("svc{i}"), HttpRuleType::PrefixUrl, &format!("/svc{i}/")))
            .collect();
        let store = Arc::new(CountingStore {
            definitions,
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let registry = ServiceRegistry::new(store.clone());

        registry.load().await.unwrap();
        registry.load().await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.len(), 250);
        assert_eq!(registry.get("svc249").unwrap().name, "svc249");
        assert_eq!(registry.list_by_protocol(ProtocolKind::Http).len(), 250);
        assert!(registry.list_by_protocol(ProtocolKind::Tcp).is_empty());
        assert_eq!(registry.match_http("gw", "/svc17/a").unwrap().name, "svc17");
    }

    #[tokio::test]
    async fn test_load_failure_is_cached() {
        let store = Arc::new(CountingStore {
            definitions: vec![],
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let registry = ServiceRegistry::new(store.clone());

        let first = registry.load().await.unwrap_err();
        let second = registry.load().await.unwrap_err();
        assert_eq!(first.message, second.message);
        assert!(first.message.contains("database is down"));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_definition_fails_load() {
        let store = Arc::new(CountingStore {
            definitions: vec![
                http_definition("dup", HttpRuleType::PrefixUrl, "/a"),
                http_definition("dup", HttpRuleType::PrefixUrl, "/b"),
            ],
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let registry = ServiceRegistry::new(store);
        let err = registry.load().await.unwrap_err();
        assert!(err.message.contains("registered twice"));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
    }
}
