use crate::config::Config;
use crate::error::ThrottlerError;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_store_backend(backend: &str) -> Result<(), ThrottlerError> {
        match backend.to_lowercase().as_str() {
            "redis" | "memory" => Ok(()),
            other => Err(ThrottlerError::Validation(format!(
                "Invalid store backend '{}'. Must be 'redis' or 'memory'",
                other
            ))),
        }
    }

    pub fn validate_redis_host(host: &str, port: u16) -> Result<(), ThrottlerError> {
        if host.trim().is_empty() {
            return Err(ThrottlerError::Validation(
                "Redis host cannot be empty".to_string(),
            ));
        }

        if port == 0 {
            return Err(ThrottlerError::Validation(
                "Redis port must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates rate limit parameters
    pub fn validate_rate_limit(window_ms: u64, max_requests: u32) -> Result<(), ThrottlerError> {
        if max_requests == 0 {
            return Err(ThrottlerError::Validation(
                "Rate limit maxRequests must be greater than 0".to_string(),
            ));
        }

        if window_ms == 0 {
            return Err(ThrottlerError::Validation(
                "Rate limit window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn validate_abuse(threshold: u32, window_secs: u64, block_secs: u64) -> Result<(), ThrottlerError> {
        if threshold == 0 {
            return Err(ThrottlerError::Validation(
                "Abuse threshold must be greater than 0".to_string(),
            ));
        }

        if window_secs == 0 || block_secs == 0 {
            return Err(ThrottlerError::Validation(
                "Abuse window and block duration must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates the whole process configuration at startup
    pub fn validate_config(config: &Config) -> Result<(), ThrottlerError> {
        Self::validate_store_backend(&config.store_backend)?;
        if !config.use_memory_store() {
            Self::validate_redis_host(&config.redis_host, config.redis_port)?;
            if config.redis_timeout_ms == 0 {
                return Err(ThrottlerError::Validation(
                    "Redis timeout must be greater than 0".to_string(),
                ));
            }
        }
        Self::validate_rate_limit(config.default_window_ms, config.default_max_requests)?;
        Self::validate_rate_limit(config.email_window_ms, config.email_max_requests)?;
        Self::validate_abuse(
            config.abuse_threshold,
            config.abuse_window_secs,
            config.block_duration_secs,
        )?;

        if config.sweep_interval_secs == 0 {
            return Err(ThrottlerError::Validation(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
