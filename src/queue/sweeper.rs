//! Periodic recovery of in-flight items whose deadline has passed.
//!
//! The sweep is the only mechanism that reclaims work from a worker that
//! crashed or hung without calling `complete` or `fail`. It can run inside a
//! [`WorkerPool`](super::WorkerPool), as a standalone task, or once from the
//! operator CLI.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::ai_queue::AiQueue;
use super::item::{Operation, QueueStatus};
use crate::error::QueueError;
use crate::metrics::MetricsCollector;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Items moved back to pending.
    pub requeued: usize,
    /// Queue cardinalities after the sweep.
    pub status: QueueStatus,
}

/// Recovers stuck items once and refreshes the queue depth gauges.
pub async fn sweep_once<P: Operation>(
    queue: &AiQueue<P>,
    metrics: &MetricsCollector,
) -> Result<SweepReport, QueueError> {
    let requeued = queue.recover_stuck().await?;
    metrics.record_recovered(requeued);

    let status = queue.status().await?;
    metrics.update_queue_depth(status);

    Ok(SweepReport { requeued, status })
}

/// Runs [`sweep_once`] on a fixed interval until shutdown.
pub struct RecoverySweeper<P> {
    queue: Arc<AiQueue<P>>,
    interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
    metrics: MetricsCollector,
}

impl<P: Operation> RecoverySweeper<P> {
    pub fn new(
        queue: Arc<AiQueue<P>>,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            queue,
            interval,
            shutdown_rx,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sweeps every `interval`, starting one interval from now.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Recovery sweeper started");

        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    match sweep_once(&self.queue, &self.metrics).await {
                        Ok(report) => debug!(
                            requeued = report.requeued,
                            pending = report.status.pending,
                            in_flight = report.status.in_flight,
                            "Recovery sweep finished"
                        ),
                        Err(e) => error!(error = %e, "Recovery sweep failed"),
                    }
                }
            }
        }

        info!("Recovery sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::{AiOperation, EnqueueRequest, Priority, QueueConfig, QuizGenerationPayload};
    use crate::store::MemoryStore;

    fn quiz() -> AiOperation {
        AiOperation::QuizGeneration(QuizGenerationPayload {
            source_text: "Cell biology".to_string(),
            question_count: 3,
            difficulty: None,
            section_id: None,
        })
    }

    #[tokio::test]
    async fn test_sweep_once_reports_status() {
        let clock = ManualClock::shared(1_000);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let queue: AiQueue<AiOperation> = AiQueue::new(
            store,
            clock.clone(),
            QueueConfig::new().with_processing_timeout(Duration::from_secs(10)),
        )
        .unwrap();

        queue
            .enqueue(EnqueueRequest::new("u", quiz(), Priority::High))
            .await
            .unwrap();
        queue
            .enqueue(EnqueueRequest::new("u", quiz(), Priority::Low))
            .await
            .unwrap();
        queue.dequeue().await.unwrap();

        let metrics = MetricsCollector::new();
        let report = sweep_once(&queue, &metrics).await.unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(report.status.in_flight, 1);

        clock.advance(Duration::from_secs(11));
        let report = sweep_once(&queue, &metrics).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(
            report.status,
            QueueStatus {
                pending: 2,
                in_flight: 0
            }
        );
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let clock = ManualClock::shared(1_000);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let queue: Arc<AiQueue<AiOperation>> =
            Arc::new(AiQueue::new(store, clock, QueueConfig::default()).unwrap());

        let (tx, rx) = broadcast::channel(1);
        let sweeper = RecoverySweeper::new(queue, Duration::from_millis(10), rx);
        let handle = tokio::spawn(sweeper.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
