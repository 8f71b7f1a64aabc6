//! End-to-end queue, cache and rate limiter behavior over the in-memory store.
//!
//! Everything here runs without Redis; time is driven by a `ManualClock`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ai_queue::cache::{CacheConfig, ResponseCache};
use ai_queue::clock::ManualClock;
use ai_queue::queue::{
    AiHandler, AiOperation, AiQueue, EnqueueRequest, FlashcardGenerationPayload, HandlerError,
    ItemState, PdfExtractionPayload, Priority, QueueConfig, QueueStatus, QuizGenerationPayload,
    WorkItem, WorkerPool, WorkerPoolConfig,
};
use ai_queue::rate_limit::{LimitKind, RateLimitConfig, RateLimiter};
use ai_queue::store::MemoryStore;
use async_trait::async_trait;

const START_MS: i64 = 1_700_000_000_000;

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    queue: Arc<AiQueue<AiOperation>>,
}

fn harness(config: QueueConfig) -> Harness {
    let clock = ManualClock::shared(START_MS);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let queue = Arc::new(AiQueue::new(store.clone(), clock.clone(), config).expect("valid config"));
    Harness {
        clock,
        store,
        queue,
    }
}

fn pdf(url: &str) -> AiOperation {
    AiOperation::PdfExtraction(PdfExtractionPayload {
        document_url: url.to_string(),
        section_id: None,
        page_start: Some(1),
        page_end: Some(12),
    })
}

fn quiz(text: &str) -> AiOperation {
    AiOperation::QuizGeneration(QuizGenerationPayload {
        source_text: text.to_string(),
        question_count: 5,
        difficulty: Some("medium".to_string()),
        section_id: None,
    })
}

fn flashcards(text: &str) -> AiOperation {
    AiOperation::FlashcardGeneration(FlashcardGenerationPayload {
        source_text: text.to_string(),
        card_count: 20,
        section_id: Some("sec-1".to_string()),
    })
}

async fn enqueue(queue: &AiQueue<AiOperation>, op: AiOperation, priority: Priority) -> String {
    queue
        .enqueue(EnqueueRequest::new("user-1", op, priority))
        .await
        .expect("enqueue should succeed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dequeue_never_duplicates() {
    let h = harness(QueueConfig::default());
    let mut expected = HashSet::new();
    for i in 0..50 {
        let priority = Priority::ALL[i % Priority::ALL.len()];
        expected.insert(enqueue(&h.queue, quiz(&format!("chapter {i}")), priority).await);
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&h.queue);
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(item) = queue.dequeue().await.expect("dequeue should succeed") {
                claimed.push(item.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.expect("task should not panic") {
            assert!(seen.insert(id.clone()), "item {id} claimed twice");
        }
    }
    assert_eq!(seen, expected);
    assert_eq!(
        h.queue.status().await.unwrap(),
        QueueStatus {
            pending: 0,
            in_flight: 50
        }
    );
}

#[tokio::test]
async fn test_priority_beats_arrival_order() {
    let h = harness(QueueConfig::default());

    let a = enqueue(&h.queue, pdf("https://files/a.pdf"), Priority::Low).await;
    h.clock.advance_ms(1);
    let b = enqueue(&h.queue, quiz("b"), Priority::High).await;
    h.clock.advance_ms(1);
    let c = enqueue(&h.queue, flashcards("c"), Priority::Normal).await;

    let order: Vec<String> = [
        h.queue.dequeue().await.unwrap(),
        h.queue.dequeue().await.unwrap(),
        h.queue.dequeue().await.unwrap(),
    ]
    .into_iter()
    .map(|item| item.expect("item should be pending").id)
    .collect();

    assert_eq!(order, vec![b, c, a]);
    assert!(h.queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
async fn test_fifo_within_priority() {
    let h = harness(QueueConfig::default());
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(enqueue(&h.queue, quiz(&format!("q{i}")), Priority::Normal).await);
        h.clock.advance_ms(10);
    }

    for id in ids {
        let item = h.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(item.id, id);
    }
}

#[tokio::test]
async fn test_retry_bound_then_discard() {
    let h = harness(QueueConfig::default());
    let id = enqueue(&h.queue, flashcards("D"), Priority::Normal).await;

    for attempt in 1..=3 {
        let item = h.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.retry_count, attempt - 1);
        assert!(h.queue.fail(&id, "model overloaded").await.unwrap());
    }

    let item = h.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(item.retry_count, 3);
    assert!(!h.queue.fail(&id, "model overloaded").await.unwrap());

    assert_eq!(h.queue.status().await.unwrap().total(), 0);
    let record = h.queue.item_status(&id).await.unwrap().unwrap();
    assert_eq!(record.state, ItemState::Failed);
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.last_error.as_deref(), Some("model overloaded"));
}

#[tokio::test]
async fn test_recovery_with_nothing_expired_is_noop() {
    let h = harness(QueueConfig::default());
    assert_eq!(h.queue.recover_stuck().await.unwrap(), 0);

    enqueue(&h.queue, quiz("fresh"), Priority::High).await;
    h.queue.dequeue().await.unwrap();
    h.clock.advance(Duration::from_secs(299));
    assert_eq!(h.queue.recover_stuck().await.unwrap(), 0);
    assert_eq!(h.queue.status().await.unwrap().in_flight, 1);
}

#[tokio::test]
async fn test_recovery_after_deadline() {
    let h = harness(QueueConfig::new().with_processing_timeout(Duration::from_secs(30)));
    let id = enqueue(&h.queue, pdf("https://files/big.pdf"), Priority::Normal).await;
    h.queue.dequeue().await.unwrap();

    // Exactly at the deadline the claim still holds
    h.clock.set_ms(START_MS + 30_000);
    assert_eq!(h.queue.recover_stuck().await.unwrap(), 0);

    h.clock.advance_ms(1);
    assert_eq!(h.queue.recover_stuck().await.unwrap(), 1);

    let item = h.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(item.id, id);
    assert_eq!(item.retry_count, 1);
}

#[tokio::test]
async fn test_recovery_discards_exhausted_item() {
    let h = harness(QueueConfig::new().with_max_retries(0));
    let id = enqueue(&h.queue, quiz("stalled"), Priority::Normal).await;
    h.queue.dequeue().await.unwrap();

    h.clock.advance(Duration::from_secs(301));
    assert_eq!(h.queue.recover_stuck().await.unwrap(), 0);
    assert_eq!(h.queue.status().await.unwrap().total(), 0);
    assert!(h.queue.dequeue().await.unwrap().is_none());

    let record = h.queue.item_status(&id).await.unwrap().unwrap();
    assert_eq!(record.state, ItemState::Failed);
    assert_eq!(record.retry_count, 0);
    assert!(record
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("processing deadline exceeded")));
}

#[tokio::test]
async fn test_recovery_requeues_and_discards_in_one_pass() {
    let h = harness(QueueConfig::new().with_max_retries(1));
    let exhausted = enqueue(&h.queue, pdf("https://files/scan.pdf"), Priority::High).await;
    h.queue.dequeue().await.unwrap();
    assert!(h.queue.fail(&exhausted, "upstream 503").await.unwrap());

    let fresh = enqueue(&h.queue, flashcards("E"), Priority::Low).await;
    assert_eq!(h.queue.dequeue().await.unwrap().unwrap().id, exhausted);
    assert_eq!(h.queue.dequeue().await.unwrap().unwrap().id, fresh);

    h.clock.advance(Duration::from_secs(301));
    assert_eq!(h.queue.recover_stuck().await.unwrap(), 1);
    assert_eq!(
        h.queue.status().await.unwrap(),
        QueueStatus {
            pending: 1,
            in_flight: 0
        }
    );

    let dropped = h.queue.item_status(&exhausted).await.unwrap().unwrap();
    assert_eq!(dropped.state, ItemState::Failed);
    assert_eq!(dropped.retry_count, 1);

    let retried = h.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(retried.id, fresh);
    assert_eq!(retried.retry_count, 1);
}

#[tokio::test]
async fn test_complete_is_idempotent() {
    let h = harness(QueueConfig::default());
    let id = enqueue(&h.queue, quiz("done"), Priority::Low).await;
    h.queue.dequeue().await.unwrap();

    assert!(h.queue.complete(&id).await.unwrap());
    assert!(!h.queue.complete(&id).await.unwrap());
    assert!(!h.queue.fail(&id, "late failure").await.unwrap());
    assert_eq!(
        h.queue.item_status(&id).await.unwrap().unwrap().state,
        ItemState::Completed
    );
}

#[tokio::test]
async fn test_queues_isolated_by_namespace() {
    let h = harness(QueueConfig::default());
    let other: AiQueue<AiOperation> = AiQueue::new(
        h.store.clone(),
        h.clock.clone(),
        QueueConfig::new().with_namespace("other"),
    )
    .unwrap();

    enqueue(&h.queue, quiz("mine"), Priority::High).await;
    assert!(other.dequeue().await.unwrap().is_none());
    assert_eq!(h.queue.status().await.unwrap().pending, 1);
}

struct FlakyHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl AiHandler<AiOperation> for FlakyHandler {
    async fn handle(&self, item: &WorkItem<AiOperation>) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &item.operation {
            AiOperation::PdfExtraction(_) => Err(HandlerError::permanent("unreadable document")),
            _ if item.retry_count == 0 => Err(HandlerError::retryable("rate limited upstream")),
            _ => Ok(()),
        }
    }
}

#[tokio::test]
async fn test_worker_pool_drains_queue() {
    let h = harness(QueueConfig::default());
    let quiz_id = enqueue(&h.queue, quiz("pool"), Priority::Normal).await;
    let pdf_id = enqueue(&h.queue, pdf("https://files/broken.pdf"), Priority::High).await;

    let handler = Arc::new(FlakyHandler {
        calls: AtomicUsize::new(0),
    });
    let config = WorkerPoolConfig::new(2)
        .with_poll_interval(Duration::from_millis(5))
        .with_shutdown_timeout(Duration::from_secs(5));
    let mut pool = WorkerPool::new(config, h.queue.clone(), handler.clone()).unwrap();
    pool.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pool.stats().total_processed() < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.items_completed, 1);
    assert_eq!(stats.items_retried, 1);
    assert_eq!(stats.items_discarded, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.queue.status().await.unwrap().total(), 0);

    let quiz_record = h.queue.item_status(&quiz_id).await.unwrap().unwrap();
    assert_eq!(quiz_record.state, ItemState::Completed);
    assert_eq!(quiz_record.retry_count, 1);
    let pdf_record = h.queue.item_status(&pdf_id).await.unwrap().unwrap();
    assert_eq!(pdf_record.state, ItemState::Failed);
    assert_eq!(pdf_record.last_error.as_deref(), Some("unreadable document"));
}

#[tokio::test]
async fn test_cache_round_trip_and_expiry() {
    let h = harness(QueueConfig::default());
    let cache = ResponseCache::new(h.store.clone(), CacheConfig::default());

    cache
        .set("quiz:abc", &vec!["Q1", "Q2"], Some(Duration::from_secs(60)))
        .await;
    let hit: Option<Vec<String>> = cache.get("quiz:abc").await;
    assert_eq!(hit, Some(vec!["Q1".to_string(), "Q2".to_string()]));

    h.clock.advance(Duration::from_secs(61));
    let expired: Option<Vec<String>> = cache.get("quiz:abc").await;
    assert!(expired.is_none());

    cache.set("quiz:def", &1u32, None).await;
    cache.delete("quiz:def").await;
    assert!(cache.get::<u32>("quiz:def").await.is_none());
}

#[tokio::test]
async fn test_with_cache_skips_producer_on_hit() {
    let h = harness(QueueConfig::default());
    let cache = ResponseCache::new(h.store.clone(), CacheConfig::default());
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let value: Result<String, std::io::Error> = cache
            .with_cache("summary:1", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("summary text".to_string())
            })
            .await;
        assert_eq!(value.unwrap(), "summary text");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rate_limit_window() {
    let h = harness(QueueConfig::default());
    let limiter = RateLimiter::new(
        h.store.clone(),
        h.clock.clone(),
        RateLimitConfig::default(),
    )
    .unwrap();

    for _ in 0..5 {
        assert!(limiter.check(LimitKind::Auth, "203.0.113.7").await.allowed);
    }
    let denied = limiter.check(LimitKind::Auth, "203.0.113.7").await;
    assert!(!denied.allowed);
    assert_eq!(denied.reset_at_ms, START_MS + 900_000);

    h.clock.advance(Duration::from_secs(900));
    assert!(limiter.check(LimitKind::Auth, "203.0.113.7").await.allowed);
}
