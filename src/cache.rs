//! Response cache over the shared key-value store.
//!
//! Memoizes expensive results (extracted PDF text, generated quizzes) keyed
//! by a content hash, so the same input is not sent to the model twice.
//!
//! # Failure policy
//!
//! The cache must never fail the caller's primary operation. Store errors
//! and undecodable values are logged and swallowed: reads degrade to a miss,
//! writes and deletes become no-ops.
//!
//! # Usage
//!
//! ```ignore
//! use ai_queue::cache::{cache_key, ResponseCache, CacheConfig};
//!
//! let cache = ResponseCache::new(store, CacheConfig::default());
//! let key = cache_key("pdf-text", &document_bytes_as_str);
//! let text: String = cache
//!     .with_cache(&key, None, || async { extract_text(&document).await })
//!     .await?;
//! ```
//!
//! Concurrent callers that miss on the same key will each run their
//! producer; there is no single-flight de-duplication.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::metrics::{CacheLookup, MetricsCollector};
use crate::store::SharedStore;

/// Hash of cached content for efficient lookup and comparison.
///
/// The hash is computed using SHA-256 and stored as a hex-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Create a new content hash from content string.
    pub fn from_content(content: &str) -> Self {
        Self::from_bytes(content.as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Get the hash string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Builds a cache key `{namespace}:{sha256(content)}`.
pub fn cache_key(namespace: &str, content: &str) -> String {
    format!("{}:{}", namespace, ContentHash::from_content(content))
}

/// Configuration for the response cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Prefix separating cache keys from queue and limiter keys.
    pub prefix: String,
    /// TTL used when a write does not specify one.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: "cache".to_string(),
            default_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl CacheConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "cache prefix must not be empty".to_string(),
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "cache default_ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Store failures and undecodable values, on any operation.
    pub errors: u64,
    /// Successful writes.
    pub writes: u64,
}

impl CacheStats {
    /// Hit rate as a value between 0.0 and 1.0, or 0.0 if no lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_lookups();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

#[derive(Default)]
struct SharedCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    writes: AtomicU64,
}

/// Fail-open JSON cache over a [`KvStore`](crate::store::KvStore).
pub struct ResponseCache {
    store: SharedStore,
    config: CacheConfig,
    stats: SharedCacheStats,
    metrics: MetricsCollector,
}

impl ResponseCache {
    pub fn new(store: SharedStore, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            stats: SharedCacheStats::default(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store key for a cache key.
    pub fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.prefix, key)
    }

    /// Returns the cached value, or `None` on miss, store error or a value
    /// that no longer decodes as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = self.full_key(key);

        let raw = match self.store.get(&full_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.record_lookup(CacheLookup::Miss);
                debug!(key = %full_key, "Cache miss");
                return None;
            }
            Err(e) => {
                self.record_lookup(CacheLookup::Error);
                warn!(key = %full_key, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.record_lookup(CacheLookup::Hit);
                debug!(key = %full_key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                self.record_lookup(CacheLookup::Error);
                warn!(key = %full_key, error = %e, "Cached value does not decode, treating as miss");
                None
            }
        }
    }

    /// Stores `value` for `ttl`, or the configured default TTL when `None`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let full_key = self.full_key(key);

        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %full_key, error = %e, "Cache value does not serialize, skipping write");
                return;
            }
        };

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        match self.store.set(&full_key, &raw, Some(ttl)).await {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %full_key, error = %e, "Cache write failed, ignoring");
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        let full_key = self.full_key(key);
        if let Err(e) = self.store.delete(&full_key).await {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %full_key, error = %e, "Cache delete failed, ignoring");
        }
    }

    /// Read-through helper.
    ///
    /// Returns the cached value if present without calling `producer`.
    /// Otherwise runs `producer`, caches an `Ok` result and returns it.
    /// Producer errors are returned as-is and not cached.
    pub async fn with_cache<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }

        let value = producer().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
        }
    }

    fn record_lookup(&self, lookup: CacheLookup) {
        let counter = match lookup {
            CacheLookup::Hit => &self.stats.hits,
            CacheLookup::Miss => &self.stats.misses,
            CacheLookup::Error => &self.stats.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache_lookup(lookup);
    }
}
