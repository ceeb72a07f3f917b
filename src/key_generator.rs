//! Rate limit key construction and client identification.
//!
//! Identifiers are namespaced by kind (`ip:`, `email:`, `api_key:`) so that
//! different kinds of caller can never collide in the store. An optional
//! endpoint suffix scopes the window to a single route.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use std::fmt;
use std::net::SocketAddr;

pub const UNKNOWN_CLIENT: &str = "unknown";

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Ip(String),
    /// Stored lower-cased and trimmed.
    Email(String),
    /// Public prefix of an API key, never the secret.
    ApiKey(String),
}

impl Identity {
    pub fn ip(addr: impl Into<String>) -> Self {
        Identity::Ip(addr.into())
    }

    pub fn email(addr: &str) -> Self {
        Identity::Email(addr.trim().to_lowercase())
    }

    pub fn api_key(prefix: impl Into<String>) -> Self {
        Identity::ApiKey(prefix.into())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Ip(addr) => write!(f, "ip:{}", addr),
            Identity::Email(addr) => write!(f, "email:{}", addr),
            Identity::ApiKey(prefix) => write!(f, "api_key:{}", prefix),
        }
    }
}

/// Store key for an identifier, optionally scoped to one endpoint.
pub fn rate_limit_key(identifier: &str, endpoint: Option<&str>) -> String {
    match endpoint {
        Some(endpoint) if !endpoint.is_empty() => format!("{}:{}", identifier, endpoint),
        _ => identifier.to_string(),
    }
}

/// Store key for an IP's violation counter.
pub fn abuse_key(ip: &str) -> String {
    format!("abuse:{}", ip)
}

/// Client IP by priority: first `X-Forwarded-For` entry, `X-Real-IP`, then
/// the socket address.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

pub fn client_ip<B>(request: &Request<B>) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .or_else(|| request.extensions().get::<SocketAddr>().copied());
    extract_client_ip(request.headers(), peer)
}
