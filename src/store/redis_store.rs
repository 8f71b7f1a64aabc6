//! Redis implementation of [`KvStore`].
//!
//! Simple operations map to single Redis commands. The composite operations
//! run as Lua scripts so that each executes atomically on the server: two
//! workers racing for the same queue member can never both win.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use super::{CappedAdd, KvStore, ScoreRange, ScoredMember};
use crate::clock::duration_ms;
use crate::error::StoreError;

/// Pops the lowest member of KEYS[1] and adds it to KEYS[2] with score ARGV[1].
const CLAIM_MIN_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1], 1)
if #popped == 0 then
    return false
end
redis.call('ZADD', KEYS[2], ARGV[1], popped[1])
return popped[1]
"#;

/// Removes ARGV[1] from KEYS[1]; if it was present, adds ARGV[2] to KEYS[2]
/// with score ARGV[3].
const MOVE_SCRIPT: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 0 then
    return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return 1
"#;

/// Sliding-window admission: trim scores below ARGV[2], add ARGV[4] with
/// score ARGV[1] when fewer than ARGV[3] members remain, refresh expiry to
/// ARGV[5] milliseconds. Replies {added, len, lowest score or nil}.
const CAPPED_ADD_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[2])
local len = redis.call('ZCARD', KEYS[1])
local added = 0
if len < tonumber(ARGV[3]) then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
    len = len + 1
    added = 1
end
if len > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
end
local first = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {added, len, first[2] or false}
"#;

/// Redis-backed store.
///
/// Cloning is cheap: the underlying `ConnectionManager` multiplexes one
/// connection and reconnects automatically.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    claim_min: Script,
    move_member: Script,
    capped_add: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        info!(redis_url = %redacted(redis_url), "Connected to Redis");
        Ok(Self::from_connection(redis))
    }

    /// Wraps an existing connection manager.
    ///
    /// Useful when sharing one connection across several components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            claim_min: Script::new(CLAIM_MIN_SCRIPT),
            move_member: Script::new(MOVE_SCRIPT),
            capped_add: Script::new(CAPPED_ADD_SCRIPT),
        }
    }
}

/// Formats a score for the wire. Infinite bounds use Redis' `-inf`/`+inf`.
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// Strips credentials from a Redis URL before it is logged.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(duration_ms(ttl).max(1));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score_arg(score))
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: u64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        range: ScoreRange,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key)
            .arg(score_arg(range.min))
            .arg(score_arg(range.max))
            .arg("WITHSCORES");
        if range.offset > 0 || range.count.is_some() {
            let count = range.count.map_or(-1, |c| i64::try_from(c).unwrap_or(i64::MAX));
            cmd.arg("LIMIT").arg(range.offset).arg(count);
        }

        let pairs: Vec<(String, f64)> = cmd.query_async(&mut conn).await?;
        Ok(pairs
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.redis.clone();
        let len: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.redis.clone();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn zpop_min_into(
        &self,
        from: &str,
        to: &str,
        score: f64,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let member: Option<String> = self
            .claim_min
            .key(from)
            .key(to)
            .arg(score_arg(score))
            .invoke_async(&mut conn)
            .await?;
        Ok(member)
    }

    async fn zmove(
        &self,
        from: &str,
        member: &str,
        to: &str,
        new_member: &str,
        score: f64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let moved: i64 = self
            .move_member
            .key(from)
            .key(to)
            .arg(member)
            .arg(new_member)
            .arg(score_arg(score))
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn zadd_capped(
        &self,
        key: &str,
        member: &str,
        score: f64,
        evict_below: f64,
        cap: u64,
        ttl: Duration,
    ) -> Result<CappedAdd, StoreError> {
        let mut conn = self.redis.clone();
        let (added, len, lowest): (i64, u64, Option<String>) = self
            .capped_add
            .key(key)
            .arg(score_arg(score))
            .arg(score_arg(evict_below))
            .arg(cap)
            .arg(member)
            .arg(duration_ms(ttl).max(1))
            .invoke_async(&mut conn)
            .await?;

        let min_score = lowest
            .map(|raw| {
                raw.parse::<f64>().map_err(|_| {
                    StoreError::UnexpectedReply(format!("non-numeric score '{raw}' in {key}"))
                })
            })
            .transpose()?;

        Ok(CappedAdd {
            added: added == 1,
            len,
            min_score,
        })
    }
}
