use std::{fmt, str::FromStr};

use thiserror::Error;
use url::Url;

/// Errors related to backend addresses
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// Error when a TCP address is not `host:port`
    #[error("Invalid backend address: {0}")]
    InvalidAddr(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of an HTTP backend URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    /// The underlying URL as a string
    url: String,
    /// Whether the URL is secure (HTTPS)
    is_secure: bool,
}

impl BackendUrl {
    /// Creates a new BackendUrl, prefixing `http://` when no scheme is given.
    ///
    /// Only `http` and `https` are accepted and a host is required.
    pub fn new(url: &str) -> BackendResult<Self> {
        let url = url.trim();
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };

        let is_secure = url.starts_with("https://");
        let is_http = url.starts_with("http://");

        if !is_secure && !is_http {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must use http:// or https://, got: {url}"
            )));
        }

        let parsed = Url::parse(&url).map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(BackendError::InvalidUrl(format!("{url}: missing host")));
        }

        Ok(BackendUrl { url, is_secure })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Check if the URL is using HTTPS
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// Get the underlying URL as a string
    pub fn into_string(self) -> String {
        self.url
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// A `host:port` TCP backend address. The host may be a name, an IPv4
/// address or a bracketed IPv6 address; it is resolved at dial time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpBackendAddr(String);

impl TcpBackendAddr {
    pub fn new(addr: &str) -> BackendResult<Self> {
        let addr = addr.trim();
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| BackendError::InvalidAddr(format!("{addr}: expected host:port")))?;

        if host.is_empty() || host.contains('/') {
            return Err(BackendError::InvalidAddr(format!("{addr}: bad host")));
        }
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(BackendError::InvalidAddr(format!(
                "{addr}: IPv6 hosts must be bracketed"
            )));
        }
        match port.parse::<u16>() {
            Ok(p) if p > 0 => Ok(Self(addr.to_string())),
            _ => Err(BackendError::InvalidAddr(format!("{addr}: bad port"))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TcpBackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
