use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ThrottlerError;
use crate::health::HealthChecker;
use crate::rate_limit_config::RateLimitConfig;
use crate::turnstile::Turnstile;
use crate::validation::RequestValidator;

/// Application state shared by the admin and health handlers
#[derive(Clone)]
pub struct AppState {
    pub turnstile: Arc<Turnstile>,
    pub default_config: Arc<RateLimitConfig>,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(turnstile: Arc<Turnstile>, default_config: RateLimitConfig) -> Self {
        Self {
            health: Arc::new(HealthChecker::new(turnstile.clone())),
            turnstile,
            default_config: Arc::new(default_config),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EndpointQuery {
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: String,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: String,
    pub message: String,
    pub identifier: String,
}

/// Current window usage for an identifier under the default limit
pub async fn get_usage(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(query): Query<EndpointQuery>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let identifier = RequestValidator::validate_identifier(&identifier)?;
    let endpoint = RequestValidator::validate_endpoint(query.endpoint.as_deref())?;

    let usage = state
        .turnstile
        .limiter()
        .get_usage(&identifier, &state.default_config, endpoint.as_deref())
        .await;

    Ok(Json(UsageResponse {
        identifier,
        endpoint,
        used: usage.used,
        limit: usage.limit,
        remaining: usage.remaining,
        reset_at: crate::response::iso_timestamp(usage.reset_at),
    }))
}

/// Clear the window for an identifier
pub async fn reset_rate_limit(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(query): Query<EndpointQuery>,
) -> Result<impl IntoResponse, ThrottlerError> {
    let identifier = RequestValidator::validate_identifier(&identifier)?;
    let endpoint = RequestValidator::validate_endpoint(query.endpoint.as_deref())?;

    state
        .turnstile
        .limiter()
        .reset_rate_limit(&identifier, endpoint.as_deref())
        .await;

    Ok(Json(ResetResponse {
        status: "success".to_string(),
        message: "Rate limit reset".to_string(),
        identifier,
    }))
}

/// Currently blocked IPs
pub async fn list_blocked(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.turnstile.abuse().blocked_ips())
}

/// Lift a block early
pub async fn unblock_ip(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> impl IntoResponse {
    if state.turnstile.abuse().unblock(&ip) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.health.check_store().await;

    if store.is_healthy() {
        (StatusCode::OK, Json(serde_json::json!({
            "status": "ready",
            "store": "connected"
        })))
    } else {
        (StatusCode::OK, Json(serde_json::json!({
            "status": "ready",
            "store": "disconnected",
            "note": "Admitting all requests until the store recovers"
        })))
    }
}

/// Stand-in for the protected application routes
pub async fn protected_ok() -> impl IntoResponse {
    Json(serde_json::json!({ "success": true }))
}
