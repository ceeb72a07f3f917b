//! API key objects attached to authenticated requests.
//!
//! Authentication itself belongs to the host application. This module only
//! defines the shape the API-key rate limiter expects to find in the request
//! extensions, plus a minimal header-based lookup for running the service on
//! its own.

use crate::error::{ThrottlerError, ThrottlerResult};
use crate::rate_limit_config::RateLimitConfig;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    /// Public, non-secret part of the key.
    pub key_prefix: String,
    /// Limit applied to every endpoint without its own override.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-path overrides, keyed by request path.
    #[serde(default)]
    pub endpoint_limits: HashMap<String, RateLimitConfig>,
}

impl ApiKey {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            rate_limit: None,
            endpoint_limits: HashMap::new(),
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_endpoint_limit(mut self, path: impl Into<String>, config: RateLimitConfig) -> Self {
        self.endpoint_limits.insert(path.into(), config);
        self
    }

    /// Endpoint override, then the key's own limit, then `fallback`.
    pub fn effective_config<'a>(&'a self, path: &str, fallback: &'a RateLimitConfig) -> &'a RateLimitConfig {
        self.endpoint_limits
            .get(path)
            .or(self.rate_limit.as_ref())
            .unwrap_or(fallback)
    }

    pub fn validate(&self) -> ThrottlerResult<()> {
        if self.key_prefix.trim().is_empty() {
            return Err(ThrottlerError::Validation(
                "API key prefix cannot be empty".to_string(),
            ));
        }
        if let Some(config) = &self.rate_limit {
            config.validate()?;
        }
        for (path, config) in &self.endpoint_limits {
            config.validate().map_err(|e| {
                ThrottlerError::Validation(format!("{} ({}): {}", self.key_prefix, path, e))
            })?;
        }
        Ok(())
    }
}

/// Known API keys, indexed by the value clients send in `X-Api-Key`.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyRegistry {
    keys: HashMap<String, ApiKey>,
}

impl ApiKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, key: ApiKey) -> ThrottlerResult<()> {
        key.validate()?;
        self.keys.insert(token.into(), key);
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<&ApiKey> {
        self.keys.get(token)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load a JSON object mapping tokens to API key objects.
    pub fn from_json(json: &str) -> ThrottlerResult<Self> {
        let raw: HashMap<String, ApiKey> = serde_json::from_str(json)
            .map_err(|e| ThrottlerError::Configuration(format!("Invalid API key file: {}", e)))?;
        let mut registry = Self::new();
        for (token, key) in raw {
            registry.insert(token, key)?;
        }
        Ok(registry)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ThrottlerResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ThrottlerError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let registry = Self::from_json(&contents)?;
        info!(keys = registry.len(), path = %path.display(), "Loaded API keys");
        Ok(registry)
    }
}

/// Attach the matching [`ApiKey`] to the request, if the header names one.
///
/// Requests without a known key pass through untouched; rejecting them is
/// the API-key rate limiter's job.
pub async fn api_key_auth(
    State(registry): State<Arc<ApiKeyRegistry>>,
    mut request: Request,
    next: Next,
) -> Response {
    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|token| registry.get(token))
        .cloned();

    if let Some(key) = key {
        debug!(key_prefix = %key.key_prefix, "Authenticated API key");
        request.extensions_mut().insert(key);
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limit(max: u32) -> RateLimitConfig {
        RateLimitConfig::new(Duration::from_secs(60), max).unwrap()
    }

    #[test]
    fn test_effective_config_priority() {
        let fallback = limit(1);
        let key = ApiKey::new("pk_1")
            .with_rate_limit(limit(100))
            .with_endpoint_limit("/v1/search", limit(10));

        assert_eq!(key.effective_config("/v1/search", &fallback).max_requests, 10);
        assert_eq!(key.effective_config("/v1/other", &fallback).max_requests, 100);
        assert_eq!(ApiKey::new("pk_2").effective_config("/v1/search", &fallback).max_requests, 1);
    }

    #[test]
    fn test_registry_from_json() {
        let registry = ApiKeyRegistry::from_json(
            r#"{
                "secret-token": {
                    "keyPrefix": "pk_live_ab",
                    "rateLimit": {"window": "1m", "maxRequests": 60},
                    "endpointLimits": {"/v1/bookings": {"window": "1s", "maxRequests": 2}}
                }
            }"#,
        )
        .unwrap();

        let key = registry.get("secret-token").unwrap();
        assert_eq!(key.key_prefix, "pk_live_ab");
        assert_eq!(key.endpoint_limits["/v1/bookings"].max_requests, 2);
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_registry_rejects_invalid_limits() {
        let result = ApiKeyRegistry::from_json(
            r#"{"t": {"keyPrefix": "pk", "rateLimit": {"window": "1m", "maxRequests": 0}}}"#,
        );
        assert!(result.is_err());

        let mut registry = ApiKeyRegistry::new();
        assert!(registry.insert("t", ApiKey::new("  ")).is_err());
    }
}
