//! Storage contracts the pipeline depends on

use crate::error::Result;
use crate::types::{Message, Observation, Role, Sequence};
use async_trait::async_trait;

/// Append-only, per-thread ordered log of raw turns
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, assigning the next sequence number atomically
    async fn append(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message>;

    /// Messages with `from_exclusive < sequence <= to_inclusive` (or to the end), oldest first
    async fn read_range(
        &self,
        thread_id: &str,
        from_exclusive: Sequence,
        to_inclusive: Option<Sequence>,
    ) -> Result<Vec<Message>>;

    /// Highest sequence appended to the thread, 0 when empty
    async fn latest_sequence(&self, thread_id: &str) -> Result<Sequence>;

    /// Delete messages at or below `through`. Returns the number removed.
    async fn delete_through(&self, thread_id: &str, through: Sequence) -> Result<usize>;

    /// Number of messages currently held for the thread
    async fn count(&self, thread_id: &str) -> Result<usize>;
}

/// Ordered observation log plus the compression marker it accounts for
///
/// Implementations commit entries and marker together: a reader sees either
/// the state before a write or the state after it.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// All entries in insertion order
    async fn read_all(&self, thread_id: &str) -> Result<Vec<Observation>>;

    /// Append entries and raise the marker to their highest `covers_through`
    async fn append(&self, thread_id: &str, entries: &[Observation]) -> Result<()>;

    /// Replace the whole log. The marker never moves backwards.
    async fn replace_all(&self, thread_id: &str, entries: &[Observation]) -> Result<()>;

    /// Highest message sequence summarized by the log, 0 if none
    async fn compressed_through(&self, thread_id: &str) -> Result<Sequence>;
}

/// A backend holding both halves of a thread
#[async_trait]
pub trait ThreadStore: MessageStore + ObservationStore {
    fn backend_name(&self) -> &'static str;

    /// Remove every message, observation and marker of a thread
    async fn clear_thread(&self, thread_id: &str) -> Result<()>;
}
