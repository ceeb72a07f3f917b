pub mod abuse;
pub mod api_key;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod store;
pub mod turnstile;
pub mod validation;

pub use abuse::{AbuseConfig, AbuseTracker};
pub use config::Config;
pub use error::{ThrottlerError, ThrottlerResult};
pub use rate_limit_config::RateLimitConfig;
pub use rate_limiter::SlidingWindowLimiter;
pub use response::{RateLimitResult, RateLimitUsage};
pub use server::{create_app, RouteLimits};
pub use store::{MemoryStore, RedisStore, RedisStoreConfig, Store};
pub use turnstile::Turnstile;
