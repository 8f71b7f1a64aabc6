//! Metrics module for Prometheus-based monitoring.
//!
//! Queue depth, worker outcomes, recovery sweeps, cache lookups and
//! rate-limit decisions. The queue itself records nothing; the worker pool,
//! sweeper, cache and rate limiter record through [`MetricsCollector`].
//!
//! # Example
//!
//! ```ignore
//! use ai_queue::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_recovered(3);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{CacheLookup, ItemOutcome, LimitDecision, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CACHE_LOOKUPS_TOTAL, ITEMS_TOTAL, PROCESSING_DURATION, QUEUE_DEPTH,
    RATE_LIMIT_DECISIONS_TOTAL, RECOVERED_TOTAL, REGISTRY,
};
