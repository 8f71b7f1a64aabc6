//! Worker pool for processing AI requests from the queue.
//!
//! Each worker runs as an independent tokio task that polls
//! [`AiQueue::dequeue`], executes the request through an [`AiHandler`] with
//! a time bound, and reports the outcome back to the queue:
//!
//! - `Ok(())` → `complete`
//! - `HandlerError::Retryable` or handler timeout → `fail` (requeue or
//!   terminal discard once retries are exhausted)
//! - `HandlerError::Permanent` → `discard`
//!
//! A [`RecoverySweeper`] runs alongside the workers. Shutdown is broadcast to
//! every task; workers finish their current item before stopping.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ai_queue::{AiQueue, FailureOutcome};
use super::item::{Operation, WorkItem};
use super::sweeper::RecoverySweeper;
use crate::error::{ConfigError, PoolError};
use crate::metrics::{ItemOutcome, MetricsCollector};

/// Failure reported by an [`AiHandler`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth retrying: upstream timeout, rate limited, transient outage.
    #[error("{0}")]
    Retryable(String),

    /// Will fail again on retry: malformed payload, unsupported document.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Executes the AI operation carried by a work item.
///
/// Implementations call the model, store results wherever the application
/// keeps them, and classify failures.
#[async_trait]
pub trait AiHandler<P: Operation>: Send + Sync {
    async fn handle(&self, item: &WorkItem<P>) -> Result<(), HandlerError>;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,
    /// Maximum time a handler may run before the attempt counts as failed.
    pub handler_timeout: Duration,
    /// Interval between recovery sweeps.
    pub sweep_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if there are no workers or an
    /// interval is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("handler_timeout", self.handler_timeout),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a handler.
    pub active_workers: usize,
    pub items_completed: u64,
    /// Failures that went back to pending.
    pub items_retried: u64,
    /// Failures that ended the item: retries exhausted or permanent.
    pub items_discarded: u64,
    /// Average handler duration across all attempts.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the number of handler attempts (completed + retried + discarded).
    pub fn total_processed(&self) -> u64 {
        self.items_completed + self.items_retried + self.items_discarded
    }

    /// Returns the share of attempts that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.items_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    items_completed: AtomicU64,
    items_retried: AtomicU64,
    items_discarded: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            items_completed: AtomicU64::new(0),
            items_retried: AtomicU64::new(0),
            items_discarded: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: ItemOutcome, duration: Duration) {
        let counter = match outcome {
            ItemOutcome::Completed => &self.items_completed,
            ItemOutcome::Retried => &self.items_retried,
            ItemOutcome::Discarded => &self.items_discarded,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.items_completed.load(Ordering::SeqCst);
        let retried = self.items_retried.load(Ordering::SeqCst);
        let discarded = self.items_discarded.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + retried + discarded;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            items_completed: completed,
            items_retried: retried,
            items_discarded: discarded,
            average_duration,
        }
    }
}

/// Pool of workers plus a recovery sweeper over one queue.
pub struct WorkerPool<P: Operation> {
    config: WorkerPoolConfig,
    queue: Arc<AiQueue<P>>,
    handler: Arc<dyn AiHandler<P>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl<P: Operation> WorkerPool<P> {
    /// Creates a worker pool over an existing queue.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if `config` is invalid or its
    /// handler timeout outlasts the queue's processing timeout.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<AiQueue<P>>,
        handler: Arc<dyn AiHandler<P>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        // A handler still running past the deadline races the sweeper's retry
        let processing_timeout = queue.config().processing_timeout;
        if config.handler_timeout > processing_timeout {
            return Err(ConfigError::ValidationFailed(format!(
                "handler_timeout ({:?}) cannot exceed the queue's processing_timeout ({:?})",
                config.handler_timeout, processing_timeout
            )));
        }

        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            queue,
            handler,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Starts all workers and the recovery sweeper.
    ///
    /// Runs one recovery pass first so work stranded by a previous crash is
    /// picked up immediately.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.queue.recover_stuck().await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!(recovered = recovered, "Recovered stuck items on startup");
                }
                MetricsCollector::new().record_recovered(recovered);
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover stuck items on startup");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.queue),
                Arc::clone(&self.handler),
                self.shutdown_tx.subscribe(),
                self.config.poll_interval,
                self.config.handler_timeout,
                Arc::clone(&self.stats),
            );
            self.handles.push(tokio::spawn(worker.run()));
        }

        let sweeper = RecoverySweeper::new(
            Arc::clone(&self.queue),
            self.config.sweep_interval,
            self.shutdown_tx.subscribe(),
        );
        self.handles.push(tokio::spawn(sweeper.run()));

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers and the sweeper.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool was not started, or
    /// `PoolError::ShutdownTimeout` if tasks don't stop within the
    /// configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Tasks may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            let results = futures::future::join_all(self.handles.drain(..)).await;
            for result in results {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue(&self) -> &Arc<AiQueue<P>> {
        &self.queue
    }
}

/// A single worker that processes items from the queue.
pub struct Worker<P: Operation> {
    id: String,
    queue: Arc<AiQueue<P>>,
    handler: Arc<dyn AiHandler<P>>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Interval between poll attempts when the queue is empty.
    poll_interval: Duration,
    handler_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl<P: Operation> Worker<P> {
    fn new(
        id: String,
        queue: Arc<AiQueue<P>>,
        handler: Arc<dyn AiHandler<P>>,
        shutdown_rx: broadcast::Receiver<()>,
        poll_interval: Duration,
        handler_timeout: Duration,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            queue,
            handler,
            shutdown_rx,
            poll_interval,
            handler_timeout,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Main worker loop.
    ///
    /// Polls for items and processes them until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let idle = match self.queue.dequeue().await {
                Ok(Some(item)) => {
                    self.process_item(item).await;
                    false
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No items available");
                    true
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue item");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown_rx.recv() => {
                        info!(worker_id = %self.id, "Worker received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Executes one claimed item and reports the outcome to the queue.
    async fn process_item(&self, item: WorkItem<P>) {
        let start_time = Instant::now();
        let kind = item.kind();

        info!(
            worker_id = %self.id,
            item_id = %item.id,
            operation = %kind,
            attempt = item.retry_count + 1,
            "Processing AI request"
        );

        self.stats.increment_active();
        self.metrics.inc_active_workers();

        let result = match tokio::time::timeout(self.handler_timeout, self.handler.handle(&item))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(HandlerError::retryable(format!(
                "handler timed out after {:?}",
                self.handler_timeout
            ))),
        };
        let duration = start_time.elapsed();

        self.stats.decrement_active();
        self.metrics.dec_active_workers();

        let outcome = match result {
            Ok(()) => match self.queue.complete(&item.id).await {
                Ok(false) => {
                    self.log_stale(&item.id);
                    None
                }
                Ok(true) => {
                    info!(
                        worker_id = %self.id,
                        item_id = %item.id,
                        duration_ms = duration.as_millis(),
                        "AI request completed"
                    );
                    Some(ItemOutcome::Completed)
                }
                Err(e) => {
                    error!(
                        worker_id = %self.id,
                        item_id = %item.id,
                        error = %e,
                        "Failed to mark item complete"
                    );
                    None
                }
            },
            Err(HandlerError::Retryable(message)) => {
                match self.queue.fail_with_outcome(&item.id, &message).await {
                    Ok(FailureOutcome::Requeued) => Some(ItemOutcome::Retried),
                    Ok(FailureOutcome::Discarded) => Some(ItemOutcome::Discarded),
                    Ok(FailureOutcome::NotFound) => {
                        self.log_stale(&item.id);
                        None
                    }
                    Err(e) => {
                        error!(
                            worker_id = %self.id,
                            item_id = %item.id,
                            error = %e,
                            "Failed to record item failure"
                        );
                        None
                    }
                }
            }
            Err(HandlerError::Permanent(message)) => {
                match self.queue.discard(&item.id, &message).await {
                    Ok(true) => Some(ItemOutcome::Discarded),
                    Ok(false) => {
                        self.log_stale(&item.id);
                        None
                    }
                    Err(e) => {
                        error!(
                            worker_id = %self.id,
                            item_id = %item.id,
                            error = %e,
                            "Failed to discard item"
                        );
                        None
                    }
                }
            }
        };

        // Items left in flight by a queue error are reclaimed by the sweeper;
        // stale items were already settled by whoever took them over
        if let Some(outcome) = outcome {
            self.stats.record(outcome, duration);
            self.metrics
                .record_item(kind, outcome, duration.as_secs_f64());
        }
    }

    fn log_stale(&self, item_id: &str) {
        warn!(
            worker_id = %self.id,
            item_id = %item_id,
            "Item no longer in flight, outcome not recorded"
        );
    }
}
