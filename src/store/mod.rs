//! Key-value store abstraction shared by the queue, cache and rate limiter.
//!
//! The store exposes plain string keys with optional expiry plus a handful of
//! sorted-set primitives. Three composite operations (`zpop_min_into`,
//! `zmove`, `zadd_capped`) must execute atomically in the backing store;
//! they are what make queue claims exclusive and rate-limit windows exact
//! across many stateless processes.
//!
//! Two implementations are provided:
//!
//! - [`RedisStore`]: network store using a Redis `ConnectionManager` and Lua
//!   scripts for the atomic operations.
//! - [`MemoryStore`]: in-process store driven by a [`Clock`](crate::clock::Clock),
//!   used for tests and local development.
//!
//! Clients are constructed explicitly by the host process and passed into
//! components as a [`SharedStore`].

pub mod memory;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Shared, dynamically dispatched store handle.
pub type SharedStore = Arc<dyn KvStore>;

/// A sorted-set member together with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Inclusive score range with an optional `LIMIT offset count`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
    pub offset: usize,
    pub count: Option<usize>,
}

impl ScoreRange {
    /// Every member of the set.
    pub fn all() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            offset: 0,
            count: None,
        }
    }

    /// Members with `score <= max`.
    pub fn up_to(max: f64) -> Self {
        Self {
            max,
            ..Self::all()
        }
    }

    /// Restricts the result to `count` members starting at `offset`.
    pub fn with_limit(mut self, offset: usize, count: usize) -> Self {
        self.offset = offset;
        self.count = Some(count);
        self
    }

    pub fn contains(&self, score: f64) -> bool {
        score >= self.min && score <= self.max
    }
}

/// Outcome of [`KvStore::zadd_capped`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CappedAdd {
    /// Whether the member was inserted.
    pub added: bool,
    /// Set cardinality after the operation.
    pub len: u64,
    /// Lowest remaining score, if the set is non-empty.
    pub min_score: Option<f64>,
}

/// Operations the coordination layer needs from its backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Round-trips to the store.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Sets `key` to `value`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Deletes `key`. Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Adds or re-scores `member` in the sorted set at `key`.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Removes `member`. Returns `true` only for the caller that actually removed it.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Members within `range`, ascending by score (ties broken by member).
    async fn zrange_by_score(
        &self,
        key: &str,
        range: ScoreRange,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Atomically pops the lowest-scored member of `from` and inserts it into
    /// `to` with `score`. Returns `None` when `from` is empty.
    async fn zpop_min_into(
        &self,
        from: &str,
        to: &str,
        score: f64,
    ) -> Result<Option<String>, StoreError>;

    /// Atomically removes `member` from `from` and, only if it was present,
    /// inserts `new_member` into `to` with `score`. Returns whether the move
    /// happened.
    async fn zmove(
        &self,
        from: &str,
        member: &str,
        to: &str,
        new_member: &str,
        score: f64,
    ) -> Result<bool, StoreError>;

    /// Atomically drops members scored below `evict_below`, inserts `member`
    /// with `score` if fewer than `cap` members remain, and refreshes the
    /// key's expiry to `ttl`.
    async fn zadd_capped(
        &self,
        key: &str,
        member: &str,
        score: f64,
        evict_below: f64,
        cap: u64,
        ttl: Duration,
    ) -> Result<CappedAdd, StoreError>;
}
