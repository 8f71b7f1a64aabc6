//! Priority queue for AI requests with claim deadlines, bounded retries and
//! stuck-item recovery.
//!
//! # Key Structure
//!
//! - `{namespace}:queue`: Pending items, scored by priority tier + enqueue time
//! - `{namespace}:processing`: In-flight items, scored by their claim deadline
//! - `{namespace}:status:{id}`: Status record per item, kept for 7 days
//!
//! # Reliability
//!
//! Every transition between the two sets is a single atomic store
//! operation: a claim pops from pending and inserts into processing in one
//! step, and a requeue removes from processing and inserts into pending in
//! one step. Only the caller whose removal succeeds performs the insert, so
//! concurrent workers and sweepers can race on the same item safely.
//!
//! Store errors are propagated to the caller; the queue never retries its
//! own store calls.
//!
//! Status records are written before an item enters pending, so a failed
//! `enqueue` never leaves a live item behind. Every later status write
//! happens after the transition has committed and is best-effort: a failure
//! is logged and the transition result is still returned.

use std::marker::PhantomData;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::codec;
use super::item::{EnqueueRequest, ItemState, Operation, QueueStatus, StatusRecord, WorkItem};
use crate::clock::{duration_ms, SharedClock};
use crate::error::{CodecError, ConfigError, QueueError};
use crate::store::{ScoreRange, SharedStore};

/// Default number of requeues before an item is discarded.
pub const MAX_RETRIES: u32 = 3;

/// Default time a claimed item may stay in flight before recovery reclaims it.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(300);

/// Status records are kept for 7 days.
const STATUS_TTL: Duration = Duration::from_secs(604_800);

const TIMEOUT_ERROR: &str = "processing deadline exceeded";

/// Configuration for an [`AiQueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Key prefix for the queue's sets and status records.
    pub namespace: String,
    /// Failures tolerated before an item is discarded.
    pub max_retries: u32,
    /// Claim deadline added to the dequeue time.
    pub processing_timeout: Duration,
    /// Expiry of status records.
    pub status_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "ai".to_string(),
            max_retries: MAX_RETRIES,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            status_ttl: STATUS_TTL,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if the namespace is empty or
    /// contains whitespace, or if a duration is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue namespace must not be empty".to_string(),
            ));
        }
        if self.namespace.chars().any(char::is_whitespace) {
            return Err(ConfigError::ValidationFailed(format!(
                "queue namespace '{}' must not contain whitespace",
                self.namespace
            )));
        }
        if self.processing_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "processing_timeout must be greater than zero".to_string(),
            ));
        }
        if self.status_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "status_ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pending_key(&self) -> String {
        format!("{}:queue", self.namespace)
    }

    pub fn processing_key(&self) -> String {
        format!("{}:processing", self.namespace)
    }

    pub fn status_key(&self, id: &str) -> String {
        format!("{}:status:{}", self.namespace, id)
    }
}

/// Result of routing a failed in-flight item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Moved back to pending with an incremented retry count.
    Requeued,
    /// Retries exhausted; removed permanently.
    Discarded,
    /// Not in flight any more (completed, recovered or failed elsewhere).
    NotFound,
}

/// Queue of AI work items over a shared key-value store.
///
/// `P` is the operation type carried by each item. Construct one queue per
/// process and share it behind an `Arc`; it holds no per-call state.
pub struct AiQueue<P> {
    store: SharedStore,
    clock: SharedClock,
    config: QueueConfig,
    pending_key: String,
    processing_key: String,
    _operation: PhantomData<fn() -> P>,
}

impl<P> Clone for AiQueue<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            pending_key: self.pending_key.clone(),
            processing_key: self.processing_key.clone(),
            _operation: PhantomData,
        }
    }
}

impl<P: Operation> AiQueue<P> {
    /// Creates a queue over `store`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if `config` is invalid.
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        config: QueueConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pending_key: config.pending_key(),
            processing_key: config.processing_key(),
            store,
            clock,
            config,
            _operation: PhantomData,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn pending_key(&self) -> &str {
        &self.pending_key
    }

    pub fn processing_key(&self) -> &str {
        &self.processing_key
    }

    /// Adds a new item to pending and returns its id.
    ///
    /// Never waits for a worker.
    pub async fn enqueue(&self, request: EnqueueRequest<P>) -> Result<String, QueueError> {
        let now = self.clock.now_ms();
        let item = WorkItem {
            id: codec::generate_id(now),
            owner_id: request.owner_id,
            operation: request.operation,
            enqueued_at: now,
            priority: request.priority,
            retry_count: 0,
        };

        let score = codec::pending_score(item.priority, item.enqueued_at)?;
        let member = codec::encode(&item)?;
        self.write_status(&StatusRecord::for_item(&item, ItemState::Pending, now))
            .await?;
        self.store.zadd(&self.pending_key, &member, score).await?;

        info!(
            item_id = %item.id,
            operation = %item.kind(),
            priority = %item.priority,
            owner_id = %item.owner_id,
            "Enqueued AI request"
        );
        Ok(item.id)
    }

    /// Claims the highest-priority, oldest pending item.
    ///
    /// The item moves to processing with deadline `now + processing_timeout`.
    /// Returns `None` when nothing is pending; callers poll.
    pub async fn dequeue(&self) -> Result<Option<WorkItem<P>>, QueueError> {
        let now = self.clock.now_ms();
        let deadline = codec::deadline_score(now, duration_ms(self.config.processing_timeout));

        let Some(member) = self
            .store
            .zpop_min_into(&self.pending_key, &self.processing_key, deadline)
            .await?
        else {
            return Ok(None);
        };

        let item = self.decode_member(&self.processing_key, &member)?;
        self.record_transition(StatusRecord::for_item(&item, ItemState::InFlight, now))
            .await;

        debug!(
            item_id = %item.id,
            operation = %item.kind(),
            retry_count = item.retry_count,
            deadline_ms = deadline as i64,
            "Claimed AI request"
        );
        Ok(Some(item))
    }

    /// Removes a finished item from processing.
    ///
    /// Returns `false` if the item was not in flight, which is expected when
    /// recovery already reclaimed it.
    pub async fn complete(&self, id: &str) -> Result<bool, QueueError> {
        let Some((member, item)) = self.find_in_flight(id).await? else {
            debug!(item_id = %id, "Complete for item not in flight, ignoring");
            return Ok(false);
        };

        if !self.store.zrem(&self.processing_key, &member).await? {
            debug!(item_id = %id, "Item left processing concurrently, ignoring complete");
            return Ok(false);
        }

        let now = self.clock.now_ms();
        self.record_transition(StatusRecord::for_item(&item, ItemState::Completed, now))
            .await;

        debug!(item_id = %id, operation = %item.kind(), "Completed AI request");
        Ok(true)
    }

    /// Records a failure of an in-flight item.
    ///
    /// Requeues the item with an incremented retry count while retries
    /// remain and returns `true`. Once retries are exhausted the item is
    /// discarded, the terminal failure is logged and `false` is returned.
    /// Also returns `false` if the item is no longer in flight; use
    /// [`fail_with_outcome`](Self::fail_with_outcome) to tell the two apart.
    pub async fn fail(&self, id: &str, error: &str) -> Result<bool, QueueError> {
        let outcome = self.fail_with_outcome(id, error).await?;
        Ok(outcome == FailureOutcome::Requeued)
    }

    /// Same as [`fail`](Self::fail), reporting whether the item was requeued,
    /// discarded or no longer in flight.
    pub async fn fail_with_outcome(
        &self,
        id: &str,
        error: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let Some((member, item)) = self.find_in_flight(id).await? else {
            debug!(item_id = %id, "Fail for item not in flight, ignoring");
            return Ok(FailureOutcome::NotFound);
        };

        self.route_failure(&member, item, error).await
    }

    /// Permanently removes an in-flight item without retrying it.
    ///
    /// For failures the caller knows cannot succeed on retry. Returns `false`
    /// if the item is no longer in flight.
    pub async fn discard(&self, id: &str, reason: &str) -> Result<bool, QueueError> {
        let Some((member, item)) = self.find_in_flight(id).await? else {
            debug!(item_id = %id, "Discard for item not in flight, ignoring");
            return Ok(false);
        };

        if !self.store.zrem(&self.processing_key, &member).await? {
            return Ok(false);
        }

        let now = self.clock.now_ms();
        self.record_transition(
            StatusRecord::for_item(&item, ItemState::Failed, now).with_error(reason),
        )
        .await;

        error!(
            item_id = %item.id,
            operation = %item.kind(),
            retry_count = item.retry_count,
            owner_id = %item.owner_id,
            error = %reason,
            "AI request discarded without retry"
        );
        Ok(true)
    }

    /// Reclaims in-flight items whose deadline has passed.
    ///
    /// Each expired item goes through the same path as [`fail`](Self::fail)
    /// with a timeout error. Returns how many were requeued; discarded items
    /// are not counted.
    pub async fn recover_stuck(&self) -> Result<usize, QueueError> {
        let now = self.clock.now_ms();
        let candidates = self
            .store
            .zrange_by_score(&self.processing_key, ScoreRange::up_to(now as f64))
            .await?;

        let mut requeued = 0;
        let mut discarded = 0;
        for entry in candidates.into_iter().filter(|e| e.score < now as f64) {
            let item = self.decode_member(&self.processing_key, &entry.member)?;
            let overdue_ms = now - entry.score as i64;
            let error = format!("{TIMEOUT_ERROR} by {overdue_ms}ms");

            match self.route_failure(&entry.member, item, &error).await? {
                FailureOutcome::Requeued => requeued += 1,
                FailureOutcome::Discarded => discarded += 1,
                FailureOutcome::NotFound => {}
            }
        }

        if requeued > 0 || discarded > 0 {
            info!(requeued, discarded, "Recovered stuck AI requests");
        }
        Ok(requeued)
    }

    /// Returns the number of pending and in-flight items.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let (pending, in_flight) = tokio::try_join!(
            self.store.zcard(&self.pending_key),
            self.store.zcard(&self.processing_key)
        )?;
        Ok(QueueStatus { pending, in_flight })
    }

    /// Returns the last recorded status of an item, if still retained.
    pub async fn item_status(&self, id: &str) -> Result<Option<StatusRecord>, QueueError> {
        match self.store.get(&self.config.status_key(id)).await? {
            Some(raw) => {
                let record = serde_json::from_str(&raw).map_err(CodecError::from)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Returns up to `limit` pending items in dequeue order without claiming them.
    pub async fn peek_pending(&self, limit: usize) -> Result<Vec<WorkItem<P>>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let entries = self
            .store
            .zrange_by_score(&self.pending_key, ScoreRange::all().with_limit(0, limit))
            .await?;

        entries
            .iter()
            .map(|entry| self.decode_member(&self.pending_key, &entry.member))
            .collect()
    }

    /// Deletes both sets. Returns the counts that were removed.
    ///
    /// **Warning**: This permanently drops all queued and in-flight work.
    /// Status records are left to expire.
    pub async fn purge(&self) -> Result<QueueStatus, QueueError> {
        let before = self.status().await?;
        self.store.delete(&self.pending_key).await?;
        self.store.delete(&self.processing_key).await?;

        warn!(
            namespace = %self.config.namespace,
            pending = before.pending,
            in_flight = before.in_flight,
            "Purged AI queue"
        );
        Ok(before)
    }

    /// Requeues or discards a failed in-flight item depending on its retry count.
    async fn route_failure(
        &self,
        member: &str,
        item: WorkItem<P>,
        error: &str,
    ) -> Result<FailureOutcome, QueueError> {
        let now = self.clock.now_ms();

        if item.can_retry(self.config.max_retries) {
            let requeued = item.requeued(now);
            let score = codec::pending_score(requeued.priority, requeued.enqueued_at)?;
            let new_member = codec::encode(&requeued)?;

            let moved = self
                .store
                .zmove(
                    &self.processing_key,
                    member,
                    &self.pending_key,
                    &new_member,
                    score,
                )
                .await?;
            if !moved {
                return Ok(FailureOutcome::NotFound);
            }

            self.record_transition(
                StatusRecord::for_item(&requeued, ItemState::Pending, now).with_error(error),
            )
            .await;

            warn!(
                item_id = %requeued.id,
                operation = %requeued.kind(),
                retry_count = requeued.retry_count,
                max_retries = self.config.max_retries,
                error = %error,
                "AI request failed, requeued"
            );
            return Ok(FailureOutcome::Requeued);
        }

        if !self.store.zrem(&self.processing_key, member).await? {
            return Ok(FailureOutcome::NotFound);
        }

        self.record_transition(
            StatusRecord::for_item(&item, ItemState::Failed, now).with_error(error),
        )
        .await;

        error!(
            item_id = %item.id,
            operation = %item.kind(),
            retry_count = item.retry_count,
            owner_id = %item.owner_id,
            error = %error,
            "AI request failed permanently, retries exhausted"
        );
        Ok(FailureOutcome::Discarded)
    }

    /// Finds the processing member whose decoded id is `id`.
    async fn find_in_flight(&self, id: &str) -> Result<Option<(String, WorkItem<P>)>, QueueError> {
        let entries = self
            .store
            .zrange_by_score(&self.processing_key, ScoreRange::all())
            .await?;

        for entry in entries {
            let item = self.decode_member(&self.processing_key, &entry.member)?;
            if item.id == id {
                return Ok(Some((entry.member, item)));
            }
        }
        Ok(None)
    }

    fn decode_member(&self, set: &str, member: &str) -> Result<WorkItem<P>, QueueError> {
        codec::decode(member).map_err(|source| QueueError::MalformedItem {
            set: set.to_string(),
            member: member.to_string(),
            source,
        })
    }

    /// Writes the status of a transition that has already committed.
    async fn record_transition(&self, record: StatusRecord) {
        if let Err(e) = self.write_status(&record).await {
            warn!(
                item_id = %record.id,
                state = %record.state,
                error = %e,
                "Failed to write status record, transition already applied"
            );
        }
    }

    async fn write_status(&self, record: &StatusRecord) -> Result<(), QueueError> {
        let raw = serde_json::to_string(record).map_err(CodecError::from)?;
        self.store
            .set(
                &self.config.status_key(&record.id),
                &raw,
                Some(self.config.status_ttl),
            )
            .await?;
        Ok(())
    }
}
