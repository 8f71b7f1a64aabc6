//! Integration tests against a live Redis.
//!
//! Each test uses its own random namespace and cleans up after itself.
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_integration -- --ignored

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ai_queue::cache::{CacheConfig, ResponseCache};
use ai_queue::clock::system_clock;
use ai_queue::queue::{
    AiOperation, AiQueue, EnqueueRequest, ItemState, Priority, QueueConfig, QuizGenerationPayload,
};
use ai_queue::rate_limit::{LimitKind, RateLimitConfig, RateLimiter};
use ai_queue::store::{KvStore, RedisStore, SharedStore};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn connect() -> SharedStore {
    let store = RedisStore::connect(&redis_url())
        .await
        .expect("Redis must be reachable for integration tests");
    Arc::new(store)
}

fn unique(prefix: &str) -> String {
    use rand::RngExt;
    format!("{prefix}-test-{}", rand::rng().random_range(0..u32::MAX))
}

fn quiz(text: &str) -> AiOperation {
    AiOperation::QuizGeneration(QuizGenerationPayload {
        source_text: text.to_string(),
        question_count: 3,
        difficulty: None,
        section_id: None,
    })
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_ping() {
    let store = connect().await;
    assert!(store.ping().await.is_ok());
}

#[tokio::test]
#[ignore]
async fn test_queue_lifecycle() {
    let store = connect().await;
    let queue: AiQueue<AiOperation> = AiQueue::new(
        store,
        system_clock(),
        QueueConfig::new().with_namespace(unique("ai")),
    )
    .expect("valid config");

    let low = queue
        .enqueue(EnqueueRequest::new("user-1", quiz("low"), Priority::Low))
        .await
        .unwrap();
    let high = queue
        .enqueue(EnqueueRequest::new("user-1", quiz("high"), Priority::High))
        .await
        .unwrap();

    let first = queue.dequeue().await.unwrap().expect("item should be pending");
    assert_eq!(first.id, high);
    assert!(queue.fail(&high, "transient").await.unwrap());

    let second = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(second.id, high);
    assert_eq!(second.retry_count, 1);
    assert!(queue.complete(&high).await.unwrap());

    let third = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(third.id, low);
    assert!(queue.discard(&low, "invalid input").await.unwrap());

    assert_eq!(queue.status().await.unwrap().total(), 0);
    assert_eq!(
        queue.item_status(&low).await.unwrap().unwrap().state,
        ItemState::Failed
    );
    queue.purge().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_concurrent_claims_are_exclusive() {
    let store = connect().await;
    let queue: Arc<AiQueue<AiOperation>> = Arc::new(
        AiQueue::new(
            store,
            system_clock(),
            QueueConfig::new().with_namespace(unique("ai")),
        )
        .expect("valid config"),
    );

    for i in 0..40 {
        queue
            .enqueue(EnqueueRequest::new("user-1", quiz(&i.to_string()), Priority::Normal))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(item) = queue.dequeue().await.unwrap() {
                ids.push(item.id);
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "duplicate claim");
        }
    }
    assert_eq!(seen.len(), 40);
    queue.purge().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_cache_expiry() {
    let store = connect().await;
    let cache = ResponseCache::new(store, CacheConfig::default().with_prefix(unique("cache")));

    cache
        .set("greeting", &"hello".to_string(), Some(Duration::from_secs(1)))
        .await;
    assert_eq!(cache.get::<String>("greeting").await.as_deref(), Some("hello"));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(cache.get::<String>("greeting").await.is_none());
}

#[tokio::test]
#[ignore]
async fn test_rate_limit_window() {
    let store = connect().await;
    let config = RateLimitConfig::default()
        .with_prefix(unique("ratelimit"))
        .with_rule(LimitKind::Auth, 3, Duration::from_secs(1));
    let limiter = RateLimiter::new(store, system_clock(), config).unwrap();

    for _ in 0..3 {
        assert!(limiter.check(LimitKind::Auth, "client").await.allowed);
    }
    assert!(!limiter.check(LimitKind::Auth, "client").await.allowed);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(limiter.check(LimitKind::Auth, "client").await.allowed);
    limiter.reset(LimitKind::Auth, "client").await;
}
