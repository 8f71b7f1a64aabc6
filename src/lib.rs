//! ai_queue: Redis-backed work queue for expensive AI requests.
//!
//! This library provides a priority queue with retries and stuck-item
//! recovery, a content-addressed response cache and a sliding-window rate
//! limiter. All three coordinate through a shared key-value store so that
//! any number of processes can enqueue and work items.

// Core modules
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod store;

// Re-export commonly used types
pub use cache::{CacheConfig, ContentHash, ResponseCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Settings;
pub use error::{CodecError, ConfigError, PoolError, QueueError, StoreError};
pub use queue::{AiOperation, AiQueue, EnqueueRequest, Priority, QueueConfig, WorkItem};
pub use rate_limit::{LimitKind, RateLimitConfig, RateLimitDecision, RateLimiter};
pub use store::{KvStore, MemoryStore, RedisStore, SharedStore};
