//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by ai-queue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all ai-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of items in the queue, labeled by state (pending/in_flight).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Items leaving a worker, labeled by operation and outcome
/// (completed/retried/discarded).
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Handler duration in seconds, labeled by operation.
pub static PROCESSING_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total in-flight items requeued by the recovery sweep.
pub static RECOVERED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Number of workers currently executing a handler.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Cache lookups, labeled by result (hit/miss/error).
pub static CACHE_LOOKUPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Rate-limit decisions, labeled by limit name and decision
/// (allowed/denied/bypassed/fail_open).
pub static RATE_LIMIT_DECISIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later calls
/// build a fresh registry but leave the already-installed statics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
///
/// # Example
///
/// ```ignore
/// use ai_queue::metrics::init_metrics;
///
/// fn main() {
///     init_metrics().expect("Failed to initialize metrics");
///     // Application continues...
/// }
/// ```
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("ai_queue_depth", "Number of AI requests in the queue"),
        &["state"],
    )?;

    let items_total = CounterVec::new(
        Opts::new(
            "ai_queue_items_total",
            "AI requests processed by workers, by outcome",
        ),
        &["operation", "outcome"],
    )?;

    let processing_duration = HistogramVec::new(
        HistogramOpts::new(
            "ai_queue_processing_duration_seconds",
            "AI request handler duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["operation"],
    )?;

    let recovered_total = Counter::new(
        "ai_queue_recovered_total",
        "In-flight AI requests requeued after their deadline passed",
    )?;

    // Worker metrics
    let active_workers = Gauge::new(
        "ai_queue_active_workers",
        "Number of workers currently executing a request",
    )?;

    // Cache and rate limiter metrics
    let cache_lookups_total = CounterVec::new(
        Opts::new("ai_queue_cache_lookups_total", "Response cache lookups"),
        &["result"],
    )?;

    let rate_limit_decisions_total = CounterVec::new(
        Opts::new(
            "ai_queue_rate_limit_decisions_total",
            "Rate limiter decisions",
        ),
        &["limit", "decision"],
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(processing_duration.clone()))?;
    registry.register(Box::new(recovered_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(cache_lookups_total.clone()))?;
    registry.register(Box::new(rate_limit_decisions_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = PROCESSING_DURATION.set(processing_duration);
    let _ = RECOVERED_TOTAL.set(recovered_total);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = CACHE_LOOKUPS_TOTAL.set(cache_lookups_total);
    let _ = RATE_LIMIT_DECISIONS_TOTAL.set(rate_limit_decisions_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line instead of metrics if the registry
/// has not been initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_never_empty() {
        // Either real output or the uninitialized notice, depending on test order
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(recovered) = RECOVERED_TOTAL.get() {
            recovered.inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("ai_queue_recovered_total"));
    }
}
