use crate::abuse::AbuseConfig;
use crate::error::ThrottlerResult;
use crate::rate_limit_config::RateLimitConfig;
use crate::store::RedisStoreConfig;
use envconfig::Envconfig;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// `redis` or `memory`
    #[envconfig(from = "STORE_BACKEND", default = "redis")]
    pub store_backend: String,

    #[envconfig(from = "REDIS_HOST", default = "127.0.0.1")]
    pub redis_host: String,

    #[envconfig(from = "REDIS_PORT", default = "6379")]
    pub redis_port: u16,

    #[envconfig(from = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    #[envconfig(from = "REDIS_DB", default = "0")]
    pub redis_db: i64,

    /// Connect and command deadline; a timeout counts as a store failure
    #[envconfig(from = "REDIS_TIMEOUT_MS", default = "1000")]
    pub redis_timeout_ms: u64,

    #[envconfig(from = "REDIS_KEY_PREFIX")]
    pub redis_key_prefix: Option<String>,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Default per-IP window
    #[envconfig(from = "DEFAULT_WINDOW_MS", default = "60000")]
    pub default_window_ms: u64,

    #[envconfig(from = "DEFAULT_MAX_REQUESTS", default = "100")]
    pub default_max_requests: u32,

    #[envconfig(from = "EMAIL_WINDOW_MS", default = "3600000")]
    pub email_window_ms: u64,

    #[envconfig(from = "EMAIL_MAX_REQUESTS", default = "5")]
    pub email_max_requests: u32,

    #[envconfig(from = "ABUSE_THRESHOLD", default = "10")]
    pub abuse_threshold: u32,

    #[envconfig(from = "ABUSE_WINDOW_SECS", default = "300")]
    pub abuse_window_secs: u64,

    #[envconfig(from = "BLOCK_DURATION_SECS", default = "3600")]
    pub block_duration_secs: u64,

    /// IP block sweep interval in seconds
    #[envconfig(from = "SWEEP_INTERVAL_SECS", default = "60")]
    pub sweep_interval_secs: u64,

    /// JSON file of API keys for the `/v1` routes
    #[envconfig(from = "API_KEYS_PATH")]
    pub api_keys_path: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn use_memory_store(&self) -> bool {
        self.store_backend.eq_ignore_ascii_case("memory")
    }

    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            host: self.redis_host.clone(),
            port: self.redis_port,
            password: self.redis_password.clone(),
            key_prefix: self.redis_key_prefix.clone(),
            db: self.redis_db,
            timeout: Duration::from_millis(self.redis_timeout_ms),
        }
    }

    pub fn abuse(&self) -> AbuseConfig {
        AbuseConfig {
            threshold: self.abuse_threshold,
            window: Duration::from_secs(self.abuse_window_secs),
            block_duration: Duration::from_secs(self.block_duration_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }

    pub fn default_limit(&self) -> ThrottlerResult<RateLimitConfig> {
        RateLimitConfig::from_millis(self.default_window_ms, self.default_max_requests)
    }

    pub fn email_limit(&self) -> ThrottlerResult<RateLimitConfig> {
        Ok(
            RateLimitConfig::from_millis(self.email_window_ms, self.email_max_requests)?
                .with_message("Too many requests for this email address, please try again later."),
        )
    }
}
