//! Encoding of work items as sorted-set members, and their ordering scores.
//!
//! Pending scores are `priority_weight(priority) + enqueued_at`. Tiers are
//! spaced [`TIER_SPAN_MS`] apart and `enqueued_at` must stay below one span,
//! so a lower-priority item can never sort ahead of a higher-priority one.
//! The largest possible score stays below 2^53, so every score is an exact
//! integer in the store's double-precision representation.

use rand::seq::IndexedRandom;

use super::item::{Operation, Priority, WorkItem};
use crate::error::CodecError;

/// Width of one priority tier in milliseconds (about 31,700 years of epoch time).
pub const TIER_SPAN_MS: i64 = 1_000_000_000_000_000;

/// Length of the random suffix appended to generated ids.
const ID_SUFFIX_LEN: usize = 9;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Additive score offset for a priority. Lower sorts first.
pub fn priority_weight(priority: Priority) -> i64 {
    match priority {
        Priority::High => 0,
        Priority::Normal => TIER_SPAN_MS,
        Priority::Low => 2 * TIER_SPAN_MS,
    }
}

/// Pending-set score for an item of `priority` enqueued at `enqueued_at` ms.
///
/// # Errors
///
/// Returns `CodecError::TimestampOutOfRange` if `enqueued_at` is negative or
/// does not fit inside a tier.
pub fn pending_score(priority: Priority, enqueued_at: i64) -> Result<f64, CodecError> {
    if !(0..TIER_SPAN_MS).contains(&enqueued_at) {
        return Err(CodecError::TimestampOutOfRange(enqueued_at));
    }
    Ok((priority_weight(priority) + enqueued_at) as f64)
}

/// In-flight score: the absolute deadline in ms.
pub fn deadline_score(now_ms: i64, timeout_ms: i64) -> f64 {
    now_ms.saturating_add(timeout_ms) as f64
}

/// Generates an item id: `{now_ms}-{9 random base36 chars}`.
pub fn generate_id(now_ms: i64) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .filter_map(|_| ID_ALPHABET.choose(&mut rng))
        .map(|&b| char::from(b))
        .collect();
    format!("{now_ms}-{suffix}")
}

/// Encodes an item as the string stored in a sorted set.
pub fn encode<P: Operation>(item: &WorkItem<P>) -> Result<String, CodecError> {
    Ok(serde_json::to_string(item)?)
}

/// Decodes a sorted-set member back into an item.
pub fn decode<P: Operation>(member: &str) -> Result<WorkItem<P>, serde_json::Error> {
    serde_json::from_str(member)
}
