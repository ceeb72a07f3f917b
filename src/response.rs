use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_WARNING: &str = "x-ratelimit-warning";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Outcome of a single admission check. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Milliseconds since the Unix epoch.
    pub reset_at: u64,
    /// Whole seconds; only set on deny.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    pub fn allowed(limit: u32, remaining: u32, reset_at: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
        }
    }

    pub fn denied(limit: u32, reset_at: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after: Some(retry_after),
        }
    }

    pub fn reset_at_iso(&self) -> String {
        iso_timestamp(self.reset_at)
    }

    /// Write `X-RateLimit-*` headers, plus `Retry-After` on deny.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        insert(headers, HEADER_LIMIT, self.limit.to_string());
        insert(headers, HEADER_REMAINING, self.remaining.to_string());
        insert(headers, HEADER_RESET, self.reset_at_iso());
        if let Some(retry_after) = self.retry_after {
            insert(headers, HEADER_RETRY_AFTER, retry_after.to_string());
        }
    }

    /// True once no more than a fifth of the quota is left.
    pub fn is_near_limit(&self) -> bool {
        u64::from(self.remaining) * 5 <= u64::from(self.limit)
    }
}

/// Current window occupancy, as reported without consuming quota.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitUsage {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: u64,
}

/// Body of a 429 response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub retry_after: u64,
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub body: RejectionBody,
    pub result: Option<RateLimitResult>,
}

impl Rejection {
    pub fn new(message: &str, error_code: &str, retry_after: u64) -> Self {
        Self {
            body: RejectionBody {
                success: false,
                error: message.to_string(),
                error_code: error_code.to_string(),
                retry_after,
            },
            result: None,
        }
    }

    pub fn from_result(result: RateLimitResult, message: &str, error_code: &str) -> Self {
        let mut rejection = Self::new(message, error_code, result.retry_after.unwrap_or(0));
        rejection.result = Some(result);
        rejection
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let retry_after = self.body.retry_after;
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(self.body)).into_response();
        let headers = response.headers_mut();
        match self.result {
            Some(result) => result.apply_headers(headers),
            None => insert(headers, HEADER_RETRY_AFTER, retry_after.to_string()),
        }
        response
    }
}

pub fn iso_timestamp(epoch_ms: u64) -> String {
    i64::try_from(epoch_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
