//! Process-wide settings assembled from environment variables.
//!
//! Each component owns its config struct with defaults and validation;
//! [`Settings`] only composes them and applies the environment on top.

use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::ConfigError;
use crate::queue::{QueueConfig, WorkerPoolConfig};
use crate::rate_limit::RateLimitConfig;

/// Default Redis connection URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Settings for every component of the service.
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub queue: QueueConfig,
    pub pool: WorkerPoolConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue: QueueConfig::default(),
            pool: WorkerPoolConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Settings {
    /// Creates settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `AI_QUEUE_NAMESPACE`: Key namespace for the queue (default: ai)
    /// - `AI_QUEUE_MAX_RETRIES`: Retries before an item is discarded (default: 3)
    /// - `AI_QUEUE_PROCESSING_TIMEOUT_SECS`: In-flight deadline (default: 300)
    /// - `AI_QUEUE_WORKERS`: Worker count (default: 4)
    /// - `AI_QUEUE_POLL_INTERVAL_MS`: Idle poll interval (default: 1000)
    /// - `AI_QUEUE_SWEEP_INTERVAL_SECS`: Recovery sweep interval (default: 60)
    /// - `AI_QUEUE_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown bound (default: 60)
    /// - `CACHE_PREFIX`: Cache key prefix (default: cache)
    /// - `CACHE_DEFAULT_TTL_SECS`: Cache entry lifetime (default: 3600)
    /// - `RATE_LIMIT_PREFIX`: Rate limit key prefix (default: ratelimit)
    /// - `RATE_LIMIT_BYPASS`: Disable rate limiting (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting settings fail validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(val) = lookup("REDIS_URL") {
            settings.redis_url = val;
        }

        // Queue
        if let Some(val) = lookup("AI_QUEUE_NAMESPACE") {
            settings.queue.namespace = val;
        }

        if let Some(val) = lookup("AI_QUEUE_MAX_RETRIES") {
            settings.queue.max_retries = parse_env_value(&val, "AI_QUEUE_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("AI_QUEUE_PROCESSING_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "AI_QUEUE_PROCESSING_TIMEOUT_SECS")?;
            settings.queue.processing_timeout = Duration::from_secs(secs);
        }
        // A handler may not outlive its deadline
        settings.pool.handler_timeout = settings.queue.processing_timeout;

        // Worker pool
        if let Some(val) = lookup("AI_QUEUE_WORKERS") {
            settings.pool.num_workers = parse_env_value(&val, "AI_QUEUE_WORKERS")?;
        }

        if let Some(val) = lookup("AI_QUEUE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "AI_QUEUE_POLL_INTERVAL_MS")?;
            settings.pool.poll_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("AI_QUEUE_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "AI_QUEUE_SWEEP_INTERVAL_SECS")?;
            settings.pool.sweep_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("AI_QUEUE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "AI_QUEUE_SHUTDOWN_TIMEOUT_SECS")?;
            settings.pool.shutdown_timeout = Duration::from_secs(secs);
        }

        // Cache
        if let Some(val) = lookup("CACHE_PREFIX") {
            settings.cache.prefix = val;
        }

        if let Some(val) = lookup("CACHE_DEFAULT_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "CACHE_DEFAULT_TTL_SECS")?;
            settings.cache.default_ttl = Duration::from_secs(secs);
        }

        // Rate limiting
        if let Some(val) = lookup("RATE_LIMIT_PREFIX") {
            settings.rate_limit.prefix = val;
        }

        if let Some(val) = lookup("RATE_LIMIT_BYPASS") {
            settings.rate_limit.bypass = parse_env_bool(&val, "RATE_LIMIT_BYPASS")?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validates every component config.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        self.queue.validate()?;
        self.pool.validate()?;
        self.cache.validate()?;
        self.rate_limit.validate()?;

        if self.pool.handler_timeout > self.queue.processing_timeout {
            return Err(ConfigError::ValidationFailed(
                "handler_timeout cannot exceed processing_timeout".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.queue.namespace = namespace.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(settings.queue.namespace, "ai");
        assert_eq!(settings.queue.max_retries, 3);
        assert_eq!(settings.queue.processing_timeout, Duration::from_secs(300));
        assert_eq!(settings.pool.num_workers, 4);
        assert_eq!(settings.pool.poll_interval, Duration::from_millis(1000));
        assert_eq!(settings.pool.sweep_interval, Duration::from_secs(60));
        assert_eq!(settings.cache.prefix, "cache");
        assert_eq!(settings.cache.default_ttl, Duration::from_secs(3600));
        assert_eq!(settings.rate_limit.prefix, "ratelimit");
        assert!(!settings.rate_limit.bypass);
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("REDIS_URL", "redis://cache.internal:6380/2"),
            ("AI_QUEUE_NAMESPACE", "study"),
            ("AI_QUEUE_MAX_RETRIES", "5"),
            ("AI_QUEUE_PROCESSING_TIMEOUT_SECS", "120"),
            ("AI_QUEUE_WORKERS", " 8 "),
            ("AI_QUEUE_POLL_INTERVAL_MS", "250"),
            ("CACHE_DEFAULT_TTL_SECS", "60"),
            ("RATE_LIMIT_BYPASS", "yes"),
        ]))
        .unwrap();

        assert_eq!(settings.redis_url, "redis://cache.internal:6380/2");
        assert_eq!(settings.queue.namespace, "study");
        assert_eq!(settings.queue.max_retries, 5);
        assert_eq!(settings.queue.processing_timeout, Duration::from_secs(120));
        assert_eq!(settings.pool.handler_timeout, Duration::from_secs(120));
        assert_eq!(settings.pool.num_workers, 8);
        assert_eq!(settings.pool.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.cache.default_ttl, Duration::from_secs(60));
        assert!(settings.rate_limit.bypass);
    }

    #[test]
    fn test_invalid_number() {
        let err = Settings::from_lookup(lookup(&[("AI_QUEUE_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "AI_QUEUE_WORKERS"));
    }

    #[test]
    fn test_invalid_bool() {
        let err = Settings::from_lookup(lookup(&[("RATE_LIMIT_BYPASS", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_BYPASS"));
    }

    #[test]
    fn test_validation_failure() {
        let err = Settings::from_lookup(lookup(&[("AI_QUEUE_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));

        let err = Settings::from_lookup(lookup(&[("AI_QUEUE_NAMESPACE", "")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_handler_timeout_bounded_by_deadline() {
        let mut settings = Settings::default();
        settings.pool.handler_timeout = Duration::from_secs(600);
        let result = settings.validate();
        assert!(result.unwrap_err().to_string().contains("handler_timeout"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("ON", "X").unwrap());
        assert!(!parse_env_bool("0", "X").unwrap());
        assert!(parse_env_bool("2", "X").is_err());
    }
}
