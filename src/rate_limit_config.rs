use crate::error::{ThrottlerError, ThrottlerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Sliding-window limit: at most `max_requests` accepted requests within any
/// `window`-long span of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[validate(range(min = 1, message = "maxRequests must be greater than 0"))]
    pub max_requests: u32,
    #[serde(default)]
    pub message: Option<String>,
}

impl RateLimitConfig {
    pub fn new(window: Duration, max_requests: u32) -> ThrottlerResult<Self> {
        let config = Self {
            window,
            max_requests,
            message: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_millis(window_ms: u64, max_requests: u32) -> ThrottlerResult<Self> {
        Self::new(Duration::from_millis(window_ms), max_requests)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Check limits that deserialization alone does not enforce.
    pub fn validate(&self) -> ThrottlerResult<()> {
        Validate::validate(self)?;
        if self.window_ms() == 0 {
            return Err(ThrottlerError::Validation(
                "window must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Window length in milliseconds, saturating at `u64::MAX`.
    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// TTL for an idle window key, rounded up to whole seconds.
    pub fn window_secs_ceil(&self) -> u64 {
        self.window_ms().div_ceil(1000)
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(DEFAULT_MESSAGE)
    }
}
