//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally and binaries decide whether metrics exist.

use super::prometheus::{
    ACTIVE_WORKERS, CACHE_LOOKUPS_TOTAL, ITEMS_TOTAL, PROCESSING_DURATION, QUEUE_DEPTH,
    RATE_LIMIT_DECISIONS_TOTAL, RECOVERED_TOTAL,
};
use crate::queue::{OperationKind, QueueStatus};

/// Final outcome of one worker attempt at an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Retried,
    Discarded,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Completed => "completed",
            ItemOutcome::Retried => "retried",
            ItemOutcome::Discarded => "discarded",
        }
    }
}

/// Result label for a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    Error,
}

impl CacheLookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Error => "error",
        }
    }
}

/// Decision label for a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Denied,
    Bypassed,
    FailOpen,
}

impl LimitDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitDecision::Allowed => "allowed",
            LimitDecision::Denied => "denied",
            LimitDecision::Bypassed => "bypassed",
            LimitDecision::FailOpen => "fail_open",
        }
    }
}

/// Metrics collector for recording ai-queue operational metrics.
///
/// # Example
///
/// ```ignore
/// use ai_queue::metrics::{init_metrics, ItemOutcome, MetricsCollector};
/// use ai_queue::queue::OperationKind;
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_item(OperationKind::QuizGeneration, ItemOutcome::Completed, 12.5);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome and handler duration of one item.
    pub fn record_item(&self, operation: OperationKind, outcome: ItemOutcome, duration_secs: f64) {
        let operation = operation.as_str();

        if let Some(items_total) = ITEMS_TOTAL.get() {
            items_total
                .with_label_values(&[operation, outcome.as_str()])
                .inc();
        }

        if let Some(duration) = PROCESSING_DURATION.get() {
            duration
                .with_label_values(&[operation])
                .observe(duration_secs);
        }

        tracing::trace!(
            operation = operation,
            outcome = outcome.as_str(),
            duration_secs = duration_secs,
            "Recorded item metric"
        );
    }

    /// Record items requeued by a recovery sweep.
    pub fn record_recovered(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(recovered) = RECOVERED_TOTAL.get() {
            recovered.inc_by(count as f64);
        }

        tracing::trace!(count = count, "Recorded recovery metric");
    }

    /// Update the queue depth gauges from a status snapshot.
    pub fn update_queue_depth(&self, status: QueueStatus) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&["pending"])
                .set(status.pending as f64);
            queue_depth
                .with_label_values(&["in_flight"])
                .set(status.in_flight as f64);
        }

        tracing::trace!(
            pending = status.pending,
            in_flight = status.in_flight,
            "Updated queue depth metric"
        );
    }

    pub fn inc_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }

    pub fn record_cache_lookup(&self, result: CacheLookup) {
        if let Some(lookups) = CACHE_LOOKUPS_TOTAL.get() {
            lookups.with_label_values(&[result.as_str()]).inc();
        }
    }

    pub fn record_rate_limit(&self, limit: &str, decision: LimitDecision) {
        if let Some(decisions) = RATE_LIMIT_DECISIONS_TOTAL.get() {
            decisions
                .with_label_values(&[limit, decision.as_str()])
                .inc();
        }

        tracing::trace!(
            limit = limit,
            decision = decision.as_str(),
            "Recorded rate limit metric"
        );
    }
}
