use crate::api_key::{api_key_auth, ApiKeyRegistry};
use crate::config::Config;
use crate::config_validator::ConfigValidator;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::handlers::{
    get_usage, health_check, list_blocked, protected_ok, readiness_check, reset_rate_limit,
    unblock_ip, AppState,
};
use crate::middleware::{
    api_key_rate_limit, email_rate_limit, ip_rate_limit, logging_middleware, AdapterState,
};
use crate::rate_limit_config::RateLimitConfig;
use crate::store::MemoryStore;
use crate::turnstile::Turnstile;
use axum::routing::{any, delete, get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Limits applied by the demo route groups.
#[derive(Debug, Clone)]
pub struct RouteLimits {
    pub ip: RateLimitConfig,
    pub email: RateLimitConfig,
    /// Used for API keys with neither a global nor a per-endpoint limit.
    pub api_key_default: RateLimitConfig,
}

/// Build the router: admin and health routes, plus one protected route group
/// per adapter.
pub fn create_app(
    turnstile: Arc<Turnstile>,
    limits: RouteLimits,
    api_keys: Arc<ApiKeyRegistry>,
) -> Router {
    let app_state = AppState::new(turnstile.clone(), limits.ip.clone());

    let admin = Router::new()
        .route(
            "/rate-limit/:identifier",
            get(get_usage).delete(reset_rate_limit),
        )
        .route("/blocked", get(list_blocked))
        .route("/blocked/:ip", delete(unblock_ip))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(app_state);

    let by_ip = Router::new()
        .route("/api/*path", any(protected_ok))
        .route_layer(middleware::from_fn_with_state(
            AdapterState::new(turnstile.clone(), limits.ip),
            ip_rate_limit,
        ));

    let by_email = Router::new()
        .route("/bookings", post(protected_ok))
        .route_layer(middleware::from_fn_with_state(
            AdapterState::new(turnstile.clone(), limits.email),
            email_rate_limit,
        ));

    let by_api_key = Router::new()
        .route("/v1/*path", any(protected_ok))
        .route_layer(middleware::from_fn_with_state(
            AdapterState::new(turnstile, limits.api_key_default),
            api_key_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(api_keys, api_key_auth));

    admin
        .merge(by_ip)
        .merge(by_email)
        .merge(by_api_key)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    turnstile: Arc<Turnstile>,
}

impl Server {
    pub fn new(config: Config) -> ThrottlerResult<Self> {
        ConfigValidator::validate_config(&config)
            .map_err(|e| ThrottlerError::Configuration(e.to_string()))?;

        let builder = Turnstile::builder().abuse_config(config.abuse());
        let builder = if config.use_memory_store() {
            tracing::warn!("Using in-memory store; limits are not shared between instances");
            builder.store(Arc::new(MemoryStore::new()))
        } else {
            builder.redis(config.redis())
        };
        let turnstile = Arc::new(builder.build()?);

        let api_keys = match &config.api_keys_path {
            Some(path) => ApiKeyRegistry::from_file(path)?,
            None => ApiKeyRegistry::new(),
        };

        let limits = RouteLimits {
            ip: config.default_limit()?,
            email: config.email_limit()?,
            api_key_default: config.default_limit()?,
        };

        Ok(Self {
            app: create_app(turnstile.clone(), limits, Arc::new(api_keys)),
            bind_addr: config.bind_addr,
            turnstile,
        })
    }

    pub async fn run(self) -> ThrottlerResult<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| ThrottlerError::Internal(format!("Failed to bind {}: {}", self.bind_addr, e)))?;

        self.turnstile.start();

        tracing::info!("Turnstile server listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        // Run server with graceful shutdown
        let served = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        self.turnstile.shutdown().await;

        served.map_err(|e| ThrottlerError::Internal(format!("Server error: {}", e)))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
