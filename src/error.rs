//! Error types for ai-queue operations.
//!
//! Defines error types for each subsystem:
//! - Key-value store access (Redis or in-memory)
//! - Work item encoding and decoding
//! - Queue state transitions
//! - Worker pool lifecycle
//! - Configuration loading and validation

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a key-value store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis command or script failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store is unreachable (used by the in-memory store to simulate outages).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Operation against a key holding the wrong kind of value.
    #[error("Key '{key}' holds a {found}, expected a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A script returned a reply the client could not interpret.
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// Errors that can occur while encoding or decoding queue members.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timestamp {0} ms is outside the scorable range")]
    TimestampOutOfRange(i64),
}

/// Errors returned by queue operations.
///
/// Store errors are propagated as-is; the queue never retries its own
/// store calls.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A member stored in one of the queue sets could not be decoded.
    #[error("Malformed item in '{set}': {source} (member: {member})")]
    MalformedItem {
        set: String,
        member: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = StoreError::WrongType {
            key: "ai:queue".to_string(),
            expected: "sorted set",
            found: "string",
        };
        let msg = err.to_string();
        assert!(msg.contains("ai:queue"));
        assert!(msg.contains("sorted set"));
    }

    #[test]
    fn test_queue_error_from_store() {
        let err: QueueError = StoreError::Unavailable("down".to_string()).into();
        assert!(matches!(err, QueueError::Store(_)));
        assert!(err.to_string().contains("down"));
    }

    #[test]
    fn test_malformed_item_mentions_set() {
        let source = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = QueueError::MalformedItem {
            set: "ai:processing".to_string(),
            member: "{not json".to_string(),
            source,
        };
        assert!(err.to_string().contains("ai:processing"));
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        let err = PoolError::ShutdownTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));
    }
}
