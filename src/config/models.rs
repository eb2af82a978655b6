//! Configuration data structures for tollgate.
//!
//! These types map directly to YAML (also TOML / JSON) configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! Service definitions live in a separate file (see [`crate::config::service`]) and
//! are read through the service store port rather than from this struct.
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_services_path() -> String {
    "services.yaml".to_string()
}

/// Top level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub http: HttpListenerConfig,
    #[serde(default)]
    pub https: Option<HttpsListenerConfig>,
    #[serde(default)]
    pub tcp: TcpProxyConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Path of the service definition file. Relative paths are resolved against
    /// the directory holding the gateway configuration file.
    #[serde(default = "default_services_path")]
    pub services_path: String,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http: HttpListenerConfig::default(),
            https: None,
            tcp: TcpProxyConfig::default(),
            flow: FlowConfig::default(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            services_path: default_services_path(),
            log: LogConfig::default(),
        }
    }
}

/// Plain HTTP proxy listener.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpListenerConfig {
    pub addr: String,
    /// Upper bound for one backend round trip (0 disables the bound).
    pub backend_timeout_secs: u64,
}

impl Default for HttpListenerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            backend_timeout_secs: 30,
        }
    }
}

impl HttpListenerConfig {
    pub fn backend_timeout(&self) -> Option<Duration> {
        (self.backend_timeout_secs > 0).then(|| Duration::from_secs(self.backend_timeout_secs))
    }
}

/// HTTPS proxy listener using a PEM certificate chain and PKCS#8 key.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpsListenerConfig {
    pub addr: String,
    pub cert_path: String,
    pub key_path: String,
}

/// Settings shared by every TCP / gRPC listener.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TcpProxyConfig {
    /// Interface every TCP / gRPC service port is bound on.
    pub bind_host: String,
    /// Read deadline applied to each accepted connection (0 disables it).
    pub read_timeout_secs: u64,
    /// Write deadline applied to each accepted connection (0 disables it).
    pub write_timeout_secs: u64,
    /// TCP keep-alive period (0 leaves the OS default).
    pub keepalive_secs: u64,
    /// Timeout for dialing the selected backend.
    pub connect_timeout_secs: u64,
    /// How long shutdown waits for in-flight connections.
    pub drain_timeout_secs: u64,
}

impl Default for TcpProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            read_timeout_secs: 0,
            write_timeout_secs: 0,
            keepalive_secs: 0,
            connect_timeout_secs: 5,
            drain_timeout_secs: 10,
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl TcpProxyConfig {
    /// Listen address of a service port.
    pub fn listen_addr(&self, port: u16) -> String {
        if self.bind_host.contains(':') {
            format!("[{}]:{port}", self.bind_host)
        } else {
            format!("{}:{port}", self.bind_host)
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        secs(self.write_timeout_secs)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        secs(self.keepalive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Flow accounting settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FlowConfig {
    /// Flush period of each counter, in milliseconds.
    pub flush_interval_ms: u64,
    /// Fixed UTC offset used for day / hour bucket stamps.
    pub utc_offset_secs: i32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1000,
            utc_offset_secs: 8 * 3600,
        }
    }
}

impl FlowConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Aggregate store settings. Without a redis URL counters aggregate in memory.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
}

/// Tenant authentication settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret tenant tokens are signed with.
    pub jwt_secret: String,
    /// Lifetime of tokens handed out by `/oauth/tokens`.
    pub token_ttl_secs: u64,
    pub tenants: Vec<TenantConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_secs: 3600,
            tenants: Vec::new(),
        }
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs.max(1))
    }
}

/// An authenticated caller of `open_auth` services.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TenantConfig {
    pub app_id: String,
    /// Client secret exchanged for a token; empty disables the exchange.
    #[serde(default)]
    pub secret: String,
    /// Per-second limit (0 = unlimited).
    #[serde(default)]
    pub qps: u32,
    /// Per-day limit (0 = unlimited).
    #[serde(default)]
    pub qpd: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.http.addr, "0.0.0.0:8080");
        assert_eq!(config.flow.flush_interval(), Duration::from_secs(1));
        assert_eq!(config.flow.utc_offset_secs, 28800);
        assert!(config.tcp.read_timeout().is_none());
        assert_eq!(config.tcp.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.services_path, "services.yaml");
        assert_eq!(config.tcp.listen_addr(9000), "0.0.0.0:9000");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{"http": {"addr": "127.0.0.1:9000"}, "tcp": {"keepalive_secs": 30}}"#,
        )
        .unwrap();
        assert_eq!(config.http.addr, "127.0.0.1:9000");
        assert_eq!(config.http.backend_timeout_secs, 30);
        assert_eq!(config.tcp.keepalive(), Some(Duration::from_secs(30)));
        assert!(config.https.is_none());
        assert_eq!(config.log.format, LogFormat::Json);
    }
}
