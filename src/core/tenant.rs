//! Tenant directory and HS256 token verification for `open_auth` services.
//!
//! A tenant presents `Authorization: Bearer <jwt>`; the token's `iss` claim
//! names the tenant's app id.
use std::collections::HashMap;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{
    config::models::{AuthConfig, TenantConfig},
    error::{GatewayError, GatewayResult},
};

#[derive(Debug, Serialize, Deserialize)]
pub struct TenantClaims {
    /// App id of the tenant.
    pub iss: String,
    pub exp: i64,
}

pub struct TenantDirectory {
    tenants: HashMap<String, TenantConfig>,
    token_ttl: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TenantDirectory {
    pub fn new(config: &AuthConfig) -> Self {
        let tenants = config
            .tenants
            .iter()
            .map(|tenant| (tenant.app_id.clone(), tenant.clone()))
            .collect();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 30;

        let token_ttl = i64::try_from(config.token_ttl().as_secs())
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::hours(1));

        Self {
            tenants,
            token_ttl,
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    pub fn get(&self, app_id: &str) -> Option<&TenantConfig> {
        self.tenants.get(app_id)
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Sign a token for `app_id`, valid for `ttl`.
    pub fn issue(&self, app_id: &str, ttl: Duration) -> GatewayResult<String> {
        let claims = TenantClaims {
            iss: app_id.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Unauthorized(format!("token signing failed: {e}")))
    }

    /// Lifetime of tokens handed out by [`Self::exchange`].
    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    /// Trade a tenant's client credentials for a signed token.
    pub fn exchange(&self, app_id: &str, secret: &str) -> GatewayResult<String> {
        match self.get(app_id) {
            Some(tenant) if !tenant.secret.is_empty() && tenant.secret == secret => {
                self.issue(app_id, self.token_ttl)
            }
            _ => Err(GatewayError::Unauthorized(format!(
                "bad client credentials for app '{app_id}'"
            ))),
        }
    }

    /// Verify an `Authorization` header value and resolve its tenant.
    pub fn authenticate(&self, authorization: Option<&str>) -> GatewayResult<&TenantConfig> {
        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| GatewayError::Unauthorized("missing bearer token".to_string()))?;

        let claims = decode::<TenantClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    GatewayError::Unauthorized("token expired".to_string())
                }
                _ => GatewayError::Unauthorized(format!("invalid token: {e}")),
            })?
            .claims;

        self.get(&claims.iss)
            .ok_or_else(|| GatewayError::Unauthorized(format!("unknown app '{}'", claims.iss)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(secret: &str) -> TenantDirectory {
        TenantDirectory::new(&AuthConfig {
            jwt_secret: secret.to_string(),
            tenants: vec![
                TenantConfig {
                    app_id: "app1".to_string(),
                    secret: "app1-secret".to_string(),
                    qps: 5,
                    qpd: 100,
                },
                TenantConfig {
                    app_id: "app2".to_string(),
                    secret: String::new(),
                    qps: 0,
                    qpd: 0,
                },
            ],
            ..Default::default()
        })
    }

    #[test]
    fn test_round_trip() {
        let dir = directory("s3cret");
        let token = dir.issue("app1", Duration::minutes(5)).unwrap();
        let tenant = dir.authenticate(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(tenant.app_id, "app1");
        assert_eq!(tenant.qps, 5);
    }

    #[test]
    fn test_rejections() {
        let dir = directory("s3cret");
        assert!(dir.authenticate(None).is_err());
        assert!(dir.authenticate(Some("Basic abc")).is_err());
        assert!(dir.authenticate(Some("Bearer not.a.jwt")).is_err());

        let unknown = dir.issue("app3", Duration::minutes(5)).unwrap();
        let err = dir.authenticate(Some(&format!("Bearer {unknown}"))).unwrap_err();
        assert!(err.to_string().contains("unknown app"));

        let foreign = directory("other").issue("app1", Duration::minutes(5)).unwrap();
        assert!(dir.authenticate(Some(&format!("Bearer {foreign}"))).is_err());

        let expired = dir.issue("app1", Duration::hours(-1)).unwrap();
        let err = dir.authenticate(Some(&format!("Bearer {expired}"))).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_exchange_credentials() {
        let dir = directory("s3cret");
        assert_eq!(dir.token_ttl(), Duration::hours(1));

        let token = dir.exchange("app1", "app1-secret").unwrap();
        let tenant = dir.authenticate(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(tenant.app_id, "app1");

        assert!(dir.exchange("app1", "wrong").is_err());
        assert!(dir.exchange("app3", "app1-secret").is_err());
        // A tenant without a secret cannot exchange anything.
        assert!(dir.exchange("app2", "").is_err());
    }
}
