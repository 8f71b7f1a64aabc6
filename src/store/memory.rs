//! In-process implementation of [`KvStore`].
//!
//! All state lives behind a single async mutex, so every trait method
//! (including the composite ones) is atomic with respect to every other.
//! Expiry is evaluated lazily against the injected clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CappedAdd, KvStore, ScoreRange, ScoredMember};
use crate::clock::{duration_ms, SharedClock};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    SortedSet(HashMap<String, f64>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::SortedSet(_) => "sorted set",
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at_ms: Option<i64>,
}

type Slots = HashMap<String, Slot>;

/// Clock-driven in-memory store.
pub struct MemoryStore {
    clock: SharedClock,
    slots: Mutex<Slots>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            slots: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent operation fail with [`StoreError::Unavailable`]
    /// until switched back. Used to exercise degraded-mode behaviour.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter(|slot| !is_expired(slot, now))
            .count()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

fn is_expired(slot: &Slot, now_ms: i64) -> bool {
    slot.expires_at_ms.is_some_and(|at| at <= now_ms)
}

fn purge_if_expired(slots: &mut Slots, key: &str, now_ms: i64) {
    if slots.get(key).is_some_and(|slot| is_expired(slot, now_ms)) {
        slots.remove(key);
    }
}

/// Returns the live sorted set at `key`, if any.
fn zset<'a>(
    slots: &'a mut Slots,
    key: &str,
    now_ms: i64,
) -> Result<Option<&'a mut HashMap<String, f64>>, StoreError> {
    purge_if_expired(slots, key, now_ms);
    match slots.get_mut(key) {
        None => Ok(None),
        Some(Slot {
            value: Value::SortedSet(set),
            ..
        }) => Ok(Some(set)),
        Some(slot) => Err(StoreError::WrongType {
            key: key.to_string(),
            expected: "sorted set",
            found: slot.value.type_name(),
        }),
    }
}

/// Returns the live sorted set at `key`, creating it when absent.
fn zset_or_create<'a>(
    slots: &'a mut Slots,
    key: &str,
    now_ms: i64,
) -> Result<&'a mut HashMap<String, f64>, StoreError> {
    purge_if_expired(slots, key, now_ms);
    let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
        value: Value::SortedSet(HashMap::new()),
        expires_at_ms: None,
    });
    match &mut slot.value {
        Value::SortedSet(set) => Ok(set),
        other => Err(StoreError::WrongType {
            key: key.to_string(),
            expected: "sorted set",
            found: other.type_name(),
        }),
    }
}

/// Removes the key when its sorted set became empty, as Redis does.
fn drop_if_empty(slots: &mut Slots, key: &str) {
    let empty = matches!(
        slots.get(key),
        Some(Slot { value: Value::SortedSet(set), .. }) if set.is_empty()
    );
    if empty {
        slots.remove(key);
    }
}

fn sorted(set: &HashMap<String, f64>) -> Vec<ScoredMember> {
    let mut members: Vec<ScoredMember> = set
        .iter()
        .map(|(member, score)| ScoredMember {
            member: member.clone(),
            score: *score,
        })
        .collect();
    members.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.member.cmp(&b.member))
    });
    members
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;
        purge_if_expired(&mut slots, key, now);
        match slots.get(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(slot) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "string",
                found: slot.value.type_name(),
            }),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;
        slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at_ms: ttl.map(|ttl| now.saturating_add(duration_ms(ttl).max(1))),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;
        purge_if_expired(&mut slots, key, now);
        Ok(slots.remove(key).is_some())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;
        zset_or_create(&mut slots, key, now)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;
        let removed = match zset(&mut slots, key, now)? {
            Some(set) => set.remove(member).is_some(),
            None => false,
        };
        drop_if_empty(&mut slots, key);
        Ok(removed)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        range: ScoreRange,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;
        let Some(set) = zset(&mut slots, key, now)? else {
            return Ok(Vec::new());
        };
        let matching = sorted(set)
            .into_iter()
            .filter(|m| range.contains(m.score))
            .skip(range.offset);
        Ok(match range.count {
            Some(count) => matching.take(count).collect(),
            None => matching.collect(),
        })
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;
        Ok(zset(&mut slots, key, now)?.map_or(0, |set| set.len() as u64))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;
        Ok(zset(&mut slots, key, now)?.and_then(|set| set.get(member).copied()))
    }

    async fn zpop_min_into(
        &self,
        from: &str,
        to: &str,
        score: f64,
    ) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;

        // Type-check the destination before mutating the source.
        zset(&mut slots, to, now)?;

        let popped = match zset(&mut slots, from, now)? {
            Some(set) => {
                let lowest = sorted(set).into_iter().next();
                if let Some(ref entry) = lowest {
                    set.remove(&entry.member);
                }
                lowest
            }
            None => None,
        };
        drop_if_empty(&mut slots, from);

        match popped {
            Some(entry) => {
                zset_or_create(&mut slots, to, now)?.insert(entry.member.clone(), score);
                Ok(Some(entry.member))
            }
            None => Ok(None),
        }
    }

    async fn zmove(
        &self,
        from: &str,
        member: &str,
        to: &str,
        new_member: &str,
        score: f64,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;

        zset(&mut slots, to, now)?;

        let removed = match zset(&mut slots, from, now)? {
            Some(set) => set.remove(member).is_some(),
            None => false,
        };
        drop_if_empty(&mut slots, from);

        if removed {
            zset_or_create(&mut slots, to, now)?.insert(new_member.to_string(), score);
        }
        Ok(removed)
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
        self.check_available()?;
        let now = self.clock.now_ms();
        let mut slots = self.slots.lock().await;

        let set = zset_or_create(&mut slots, key, now)?;
        set.retain(|_, s| *s >= evict_below);

        let added = (set.len() as u64) < cap;
        if added {
            set.insert(member.to_string(), score);
        }
        let len = set.len() as u64;
        let min_score = set.values().copied().min_by(|a, b| a.total_cmp(b));

        if len == 0 {
            slots.remove(key);
        } else if let Some(slot) = slots.get_mut(key) {
            slot.expires_at_ms = Some(now.saturating_add(duration_ms(ttl).max(1)));
        }

        Ok(CappedAdd {
            added,
            len,
            min_score,
        })
    }
}
