//! Priority queue for expensive AI requests, coordinated through a shared store.
//!
//! This module provides:
//!
//! - **AiQueue**: enqueue, claim, complete, fail-with-retry, discard and
//!   stuck-item recovery over two sorted sets
//! - **WorkItem**: the unit of work, generic over its operation payload
//! - **WorkerPool**: tokio workers that drive items through an [`AiHandler`]
//! - **RecoverySweeper**: periodic reclaim of items whose deadline passed
//!
//! # Lifecycle
//!
//! ```text
//!   enqueue ──► Pending ──dequeue──► InFlight ──complete──► done
//!                  ▲                    │
//!                  └──fail / recover────┤ (retries left)
//!                                       │
//!                                       └──fail / recover / discard──► failed
//! ```
//!
//! Processes share nothing but the store. Workers poll; `dequeue` returning
//! `None` is the signal to back off.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ai_queue::clock::system_clock;
//! use ai_queue::queue::{AiOperation, AiQueue, EnqueueRequest, Priority, QueueConfig};
//! use ai_queue::store::RedisStore;
//!
//! let store = Arc::new(RedisStore::connect("redis://localhost:6379").await?);
//! let queue: AiQueue<AiOperation> = AiQueue::new(store, system_clock(), QueueConfig::default())?;
//!
//! let id = queue.enqueue(EnqueueRequest::new("user-42", operation, Priority::High)).await?;
//!
//! if let Some(item) = queue.dequeue().await? {
//!     match run_model(&item).await {
//!         Ok(()) => { queue.complete(&item.id).await?; }
//!         Err(e) => { queue.fail(&item.id, &e.to_string()).await?; }
//!     }
//! }
//! ```

pub mod ai_queue;
pub mod codec;
pub mod item;
pub mod sweeper;
pub mod worker_pool;

pub use ai_queue::{AiQueue, FailureOutcome, QueueConfig, DEFAULT_PROCESSING_TIMEOUT, MAX_RETRIES};
pub use item::{
    AiOperation, EnqueueRequest, FlashcardGenerationPayload, ItemState, Operation, OperationKind,
    PdfExtractionPayload, Priority, QueueStatus, QuizGenerationPayload, StatusRecord, WorkItem,
};
pub use sweeper::{sweep_once, RecoverySweeper, SweepReport};
pub use worker_pool::{AiHandler, HandlerError, PoolStats, Worker, WorkerPool, WorkerPoolConfig};
