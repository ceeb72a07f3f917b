//! Request interceptors.
//!
//! Each adapter is an axum `from_fn_with_state` middleware over an
//! [`AdapterState`]. All of them fail open: a panic inside the limiter or
//! the abuse tracker is logged and the request continues.

use crate::api_key::ApiKey;
use crate::key_generator::{client_ip, Identity};
use crate::rate_limit_config::RateLimitConfig;
use crate::response::{Rejection, RateLimitResult, HEADER_WARNING};
use crate::turnstile::Turnstile;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{stream, FutureExt, StreamExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Largest body the email adapter will buffer to look for the email field.
pub const MAX_INSPECTED_BODY: usize = 1024 * 1024;

/// Body field holding the email address to limit on.
pub const EMAIL_FIELD: &str = "guestEmail";

pub const CODE_RATE_LIMITED: &str = "RATE_LIMIT_EXCEEDED";
pub const CODE_IP_BLOCKED: &str = "IP_BLOCKED";
pub const CODE_EMAIL_RATE_LIMITED: &str = "EMAIL_RATE_LIMIT_EXCEEDED";
pub const CODE_API_KEY_RATE_LIMITED: &str = "API_KEY_RATE_LIMIT_EXCEEDED";

const BLOCKED_MESSAGE: &str = "Too many requests from this IP, access temporarily blocked.";

#[derive(Clone)]
pub struct AdapterState {
    pub turnstile: Arc<Turnstile>,
    /// Limit for the IP and email adapters; the system default for the
    /// API-key adapter.
    pub config: Arc<RateLimitConfig>,
}

impl AdapterState {
    pub fn new(turnstile: Arc<Turnstile>, config: RateLimitConfig) -> Self {
        Self {
            turnstile,
            config: Arc::new(config),
        }
    }
}

/// Limit by client IP, short-circuiting blocked IPs.
pub async fn ip_rate_limit(State(state): State<AdapterState>, request: Request, next: Next) -> Response {
    let ip = client_ip(&request);

    if let Some(rejection) = blocked_rejection(&state, &ip) {
        return rejection.into_response();
    }

    let identifier = Identity::ip(ip.as_str()).to_string();
    let Some(result) = fail_open("ip", state.turnstile.limiter().check(&identifier, &state.config, None)).await
    else {
        return next.run(request).await;
    };

    if !result.allowed {
        fail_open("ip", state.turnstile.abuse().record_violation(&ip, None)).await;
        warn!(ip = %ip, path = %request.uri().path(), "IP rate limit exceeded");
        return Rejection::from_result(result, state.config.message(), CODE_RATE_LIMITED).into_response();
    }

    with_headers(next.run(request).await, &result)
}

/// Limit by the email address in the JSON body, if there is one.
///
/// Bodies too large to inspect, or that fail to read, are forwarded
/// unchanged without limiting.
pub async fn email_rate_limit(State(state): State<AdapterState>, request: Request, next: Next) -> Response {
    if declared_length(request.headers()).is_some_and(|len| len > MAX_INSPECTED_BODY) {
        debug!("Request body too large to inspect, skipping email rate limit");
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = match buffer_body(body, MAX_INSPECTED_BODY).await {
        BufferedBody::Complete(bytes) => bytes,
        BufferedBody::Passthrough(body) => return next.run(Request::from_parts(parts, body)).await,
    };

    let email = serde_json::from_slice::<serde_json::Value>(&bytes)
        .ok()
        .and_then(|body| body.get(EMAIL_FIELD)?.as_str().map(str::to_string))
        .filter(|email| !email.trim().is_empty());
    let request = Request::from_parts(parts, Body::from(bytes));

    let Some(email) = email else {
        return next.run(request).await;
    };

    let identifier = Identity::email(&email).to_string();
    let Some(result) = fail_open("email", state.turnstile.limiter().check(&identifier, &state.config, None)).await
    else {
        return next.run(request).await;
    };

    if !result.allowed {
        warn!(identifier = %identifier, "Email rate limit exceeded");
        return Rejection::from_result(result, state.config.message(), CODE_EMAIL_RATE_LIMITED)
            .into_response();
    }

    with_headers(next.run(request).await, &result)
}

/// Limit by authenticated API key and endpoint.
pub async fn api_key_rate_limit(State(state): State<AdapterState>, request: Request, next: Next) -> Response {
    let Some(api_key) = request.extensions().get::<ApiKey>().cloned() else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "success": false,
                "error": "API key required",
                "errorCode": "API_KEY_REQUIRED",
            })),
        )
            .into_response();
    };

    let ip = client_ip(&request);
    if let Some(rejection) = blocked_rejection(&state, &ip) {
        return rejection.into_response();
    }

    let path = request.uri().path().to_string();
    let config = api_key.effective_config(&path, &state.config);
    let identifier = Identity::api_key(api_key.key_prefix.as_str()).to_string();

    let Some(result) = fail_open(
        "api_key",
        state.turnstile.limiter().check(&identifier, config, Some(path.as_str())),
    )
    .await
    else {
        return next.run(request).await;
    };

    if !result.allowed {
        fail_open(
            "api_key",
            state.turnstile.abuse().record_violation(&ip, Some(api_key.key_prefix.as_str())),
        )
        .await;
        warn!(key_prefix = %api_key.key_prefix, ip = %ip, path = %path, "API key rate limit exceeded");
        return Rejection::from_result(result, config.message(), CODE_API_KEY_RATE_LIMITED).into_response();
    }

    let mut response = with_headers(next.run(request).await, &result);
    if result.is_near_limit() {
        let warning = format!(
            "Approaching rate limit: {} of {} requests remaining",
            result.remaining, result.limit
        );
        if let Ok(value) = HeaderValue::from_str(&warning) {
            response.headers_mut().insert(HEADER_WARNING, value);
        }
    }
    response
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = client_ip(&request);

    info!(
        target: "turnstile::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "turnstile::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}

fn blocked_rejection(state: &AdapterState, ip: &str) -> Option<Rejection> {
    let turnstile = &state.turnstile;
    let lookup = std::panic::catch_unwind(AssertUnwindSafe(|| turnstile.abuse().remaining_block(ip)));
    let remaining = match lookup {
        Ok(remaining) => remaining?,
        Err(_) => {
            error!(ip = %ip, "IP block lookup panicked, allowing request");
            return None;
        }
    };

    let retry_after = (remaining.as_millis() as u64).div_ceil(1000);
    warn!(ip = %ip, retry_after, "Rejected request from blocked IP");
    Some(Rejection::new(BLOCKED_MESSAGE, CODE_IP_BLOCKED, retry_after))
}

/// Run `fut`, turning a panic into `None` so the caller can let the request
/// through.
async fn fail_open<F, T>(adapter: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => Some(value),
        Err(_) => {
            error!(adapter, "Rate limiter panicked, allowing request");
            None
        }
    }
}

enum BufferedBody {
    /// The whole body, within the limit.
    Complete(Bytes),
    /// An equivalent body to forward as is: what was read so far, followed
    /// by the rest of the stream or its read error.
    Passthrough(Body),
}

/// Read up to `limit` bytes of `body` into memory.
async fn buffer_body(body: Body, limit: usize) -> BufferedBody {
    let mut rest = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(chunk) = rest.next().await {
        match chunk {
            Ok(chunk) => {
                total = total.saturating_add(chunk.len());
                chunks.push(chunk);
                if total > limit {
                    debug!(limit, "Request body too large to inspect, skipping email rate limit");
                    let read = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
                    return BufferedBody::Passthrough(Body::from_stream(read.chain(rest)));
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read request body, skipping email rate limit");
                let read = chunks.into_iter().map(Ok).chain(std::iter::once(Err(e)));
                return BufferedBody::Passthrough(Body::from_stream(stream::iter(read)));
            }
        }
    }

    BufferedBody::Complete(Bytes::from(chunks.concat()))
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn with_headers(mut response: Response, result: &RateLimitResult) -> Response {
    result.apply_headers(response.headers_mut());
    response
}
