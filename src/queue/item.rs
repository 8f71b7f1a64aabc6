//! Work item definitions for the AI queue.
//!
//! This module defines the records that travel through the queue:
//!
//! - `WorkItem`: A unit of deferred AI work stored as a sorted-set member
//! - `Operation` / `AiOperation`: The typed operation a worker executes
//! - `EnqueueRequest`: What a producer supplies to `enqueue`
//! - `StatusRecord`: Side-channel status a producer can poll by id

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Scheduling priority. Determines ordering, never preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!(
                "unknown priority '{other}' (expected low, normal or high)"
            )),
        }
    }
}

/// Closed set of operation tags understood by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    PdfExtraction,
    QuizGeneration,
    FlashcardGeneration,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::PdfExtraction,
        OperationKind::QuizGeneration,
        OperationKind::FlashcardGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::PdfExtraction => "pdf-extraction",
            OperationKind::QuizGeneration => "quiz-generation",
            OperationKind::FlashcardGeneration => "flashcard-generation",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown operation kind '{s}'"))
    }
}

/// An operation payload the queue can carry.
///
/// The queue only needs to serialize the operation and report its kind; it
/// never looks inside. Implementors are usually tagged enums so that each
/// kind has its own payload shape.
pub trait Operation: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn kind(&self) -> OperationKind;
}

/// Input for [`AiOperation::PdfExtraction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfExtractionPayload {
    /// Location of the uploaded document.
    pub document_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    /// First page to extract (1-based), if not the whole document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_end: Option<u32>,
}

/// Input for [`AiOperation::QuizGeneration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizGenerationPayload {
    pub source_text: String,
    pub question_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

/// Input for [`AiOperation::FlashcardGeneration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashcardGenerationPayload {
    pub source_text: String,
    pub card_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

/// The AI operations of the learning platform, one payload shape per kind.
///
/// Serialized as `{"operationKind": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operationKind", content = "payload", rename_all = "kebab-case")]
pub enum AiOperation {
    PdfExtraction(PdfExtractionPayload),
    QuizGeneration(QuizGenerationPayload),
    FlashcardGeneration(FlashcardGenerationPayload),
}

impl Operation for AiOperation {
    fn kind(&self) -> OperationKind {
        match self {
            AiOperation::PdfExtraction(_) => OperationKind::PdfExtraction,
            AiOperation::QuizGeneration(_) => OperationKind::QuizGeneration,
            AiOperation::FlashcardGeneration(_) => OperationKind::FlashcardGeneration,
        }
    }
}

/// A unit of deferred work.
///
/// Stored JSON-encoded as a member of either the pending or the in-flight
/// sorted set. Items are never mutated inside a set; every transition
/// removes the old encoding and inserts a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem<P> {
    /// Unique identifier, assigned at enqueue and never reused.
    pub id: String,
    /// Requesting principal. Attribution only; the queue enforces nothing.
    pub owner_id: String,
    /// The work to perform.
    pub operation: P,
    /// Milliseconds since epoch of the most recent insertion into pending.
    pub enqueued_at: i64,
    pub priority: Priority,
    /// Number of times the item has been requeued after a failure.
    pub retry_count: u32,
}

impl<P: Operation> WorkItem<P> {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Returns whether another failure would still be retried.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    /// Returns the copy that goes back to pending after a failure.
    pub fn requeued(&self, now_ms: i64) -> Self {
        Self {
            enqueued_at: now_ms,
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Milliseconds since the item last entered pending.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.enqueued_at)
    }
}

/// What a producer supplies to enqueue work.
///
/// Priority is required; there is no implicit default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest<P> {
    pub owner_id: String,
    pub operation: P,
    pub priority: Priority,
}

impl<P: Operation> EnqueueRequest<P> {
    pub fn new(owner_id: impl Into<String>, operation: P, priority: Priority) -> Self {
        Self {
            owner_id: owner_id.into(),
            operation,
            priority,
        }
    }
}

/// Lifecycle state recorded in the status side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    InFlight,
    /// Terminal success.
    Completed,
    /// Terminal failure: retries exhausted or discarded.
    Failed,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Completed | ItemState::Failed)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Pending => write!(f, "pending"),
            ItemState::InFlight => write!(f, "in-flight"),
            ItemState::Completed => write!(f, "completed"),
            ItemState::Failed => write!(f, "failed"),
        }
    }
}

/// Status of an item, written on every transition and polled by producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub id: String,
    pub owner_id: String,
    pub operation_kind: OperationKind,
    pub state: ItemState,
    pub retry_count: u32,
    /// Error from the most recent failure, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at_ms: i64,
}

impl StatusRecord {
    pub fn for_item<P: Operation>(item: &WorkItem<P>, state: ItemState, now_ms: i64) -> Self {
        Self {
            id: item.id.clone(),
            owner_id: item.owner_id.clone(),
            operation_kind: item.kind(),
            state,
            retry_count: item.retry_count,
            last_error: None,
            updated_at_ms: now_ms,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Cardinalities of the two queue sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: u64,
    pub in_flight: u64,
}

impl QueueStatus {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiz() -> AiOperation {
        AiOperation::QuizGeneration(QuizGenerationPayload {
            source_text: "Photosynthesis converts light into chemical energy.".to_string(),
            question_count: 5,
            difficulty: Some("easy".to_string()),
            section_id: None,
        })
    }

    fn item(retry_count: u32) -> WorkItem<AiOperation> {
        WorkItem {
            id: "1700000000000-abc123xyz".to_string(),
            owner_id: "user-1".to_string(),
            operation: quiz(),
            enqueued_at: 1_700_000_000_000,
            priority: Priority::Normal,
            retry_count,
        }
    }

    #[test]
    fn test_priority_parse_and_display() {
        for priority in Priority::ALL {
            assert_eq!(priority.to_string().parse::<Priority>(), Ok(priority));
        }
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_operation_kind_parse() {
        assert_eq!(
            "flashcard-generation".parse::<OperationKind>(),
            Ok(OperationKind::FlashcardGeneration)
        );
        assert!("image-generation".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_ai_operation_wire_shape() {
        let json = serde_json::to_value(quiz()).unwrap();
        assert_eq!(json["operationKind"], "quiz-generation");
        assert_eq!(json["payload"]["questionCount"], 5);
        assert!(json["payload"].get("sectionId").is_none());
    }

    #[test]
    fn test_ai_operation_rejects_unknown_kind() {
        let raw = r#"{"operationKind":"video-generation","payload":{}}"#;
        assert!(serde_json::from_str::<AiOperation>(raw).is_err());
    }

    #[test]
    fn test_operation_kind_matches_variant() {
        let pdf = AiOperation::PdfExtraction(PdfExtractionPayload {
            document_url: "https://files.example/notes.pdf".to_string(),
            section_id: Some("sec-1".to_string()),
            page_start: None,
            page_end: None,
        });
        assert_eq!(pdf.kind(), OperationKind::PdfExtraction);
        assert_eq!(quiz().kind(), OperationKind::QuizGeneration);
    }

    #[test]
    fn test_requeued_bumps_retry_and_timestamp() {
        let original = item(1);
        let requeued = original.requeued(1_700_000_005_000);

        assert_eq!(requeued.id, original.id);
        assert_eq!(requeued.retry_count, 2);
        assert_eq!(requeued.enqueued_at, 1_700_000_005_000);
        assert_eq!(requeued.priority, original.priority);
    }

    #[test]
    fn test_can_retry() {
        assert!(item(0).can_retry(3));
        assert!(item(2).can_retry(3));
        assert!(!item(3).can_retry(3));
        assert!(!item(0).can_retry(0));
    }

    #[test]
    fn test_work_item_field_names() {
        let json = serde_json::to_value(item(0)).unwrap();
        assert!(json.get("ownerId").is_some());
        assert!(json.get("enqueuedAt").is_some());
        assert!(json.get("retryCount").is_some());
        assert_eq!(json["priority"], "normal");
    }

    #[test]
    fn test_status_record_for_item() {
        let record = StatusRecord::for_item(&item(2), ItemState::Failed, 42).with_error("boom");
        assert_eq!(record.operation_kind, OperationKind::QuizGeneration);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
        assert!(record.state.is_terminal());
        assert!(!ItemState::InFlight.is_terminal());
        assert_eq!(ItemState::InFlight.to_string(), "in-flight");
    }

    #[test]
    fn test_queue_status_total() {
        let status = QueueStatus {
            pending: 3,
            in_flight: 2,
        };
        assert_eq!(status.total(), 5);
    }
}
