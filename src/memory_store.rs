//! In-process storage backend. No persistence; intended for tests and demos.

use crate::error::Result;
use crate::storage_traits::{MessageStore, ObservationStore, ThreadStore};
use crate::types::{Message, Observation, Role, Sequence};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct ThreadData {
    messages: Vec<Message>,
    next_sequence: Sequence,
    observations: Vec<Observation>,
    compressed_through: Sequence,
}

/// HashMap-backed store guarded by a single async lock
#[derive(Debug, Default)]
pub struct InMemoryStore {
    threads: RwLock<HashMap<String, ThreadData>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn append(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message> {
        let mut threads = self.threads.write().await;
        let thread = threads.entry(thread_id.to_string()).or_default();
        thread.next_sequence += 1;

        let message = Message {
            thread_id: thread_id.to_string(),
            role,
            content: content.to_string(),
            sequence: thread.next_sequence,
            timestamp: Utc::now(),
            metadata,
        };
        thread.messages.push(message.clone());
        Ok(message)
    }

    async fn read_range(
        &self,
        thread_id: &str,
        from_exclusive: Sequence,
        to_inclusive: Option<Sequence>,
    ) -> Result<Vec<Message>> {
        let threads = self.threads.read().await;
        let Some(thread) = threads.get(thread_id) else {
            return Ok(Vec::new());
        };
        let upper = to_inclusive.unwrap_or(Sequence::MAX);
        Ok(thread
            .messages
            .iter()
            .filter(|m| m.sequence > from_exclusive && m.sequence <= upper)
            .cloned()
            .collect())
    }

    async fn latest_sequence(&self, thread_id: &str) -> Result<Sequence> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).map(|t| t.next_sequence).unwrap_or(0))
    }

    async fn delete_through(&self, thread_id: &str, through: Sequence) -> Result<usize> {
        let mut threads = self.threads.write().await;
        let Some(thread) = threads.get_mut(thread_id) else {
            return Ok(0);
        };
        let before = thread.messages.len();
        thread.messages.retain(|m| m.sequence > through);
        Ok(before - thread.messages.len())
    }

    async fn count(&self, thread_id: &str) -> Result<usize> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).map(|t| t.messages.len()).unwrap_or(0))
    }
}

#[async_trait]
impl ObservationStore for InMemoryStore {
    async fn read_all(&self, thread_id: &str) -> Result<Vec<Observation>> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|t| t.observations.clone())
            .unwrap_or_default())
    }

    async fn append(&self, thread_id: &str, entries: &[Observation]) -> Result<()> {
        let mut threads = self.threads.write().await;
        let thread = threads.entry(thread_id.to_string()).or_default();
        thread.observations.extend_from_slice(entries);
        if let Some(max) = entries.iter().map(|o| o.covers_through).max() {
            thread.compressed_through = thread.compressed_through.max(max);
        }
        Ok(())
    }

    async fn replace_all(&self, thread_id: &str, entries: &[Observation]) -> Result<()> {
        let mut threads = self.threads.write().await;
        let thread = threads.entry(thread_id.to_string()).or_default();
        thread.observations = entries.to_vec();
        if let Some(max) = entries.iter().map(|o| o.covers_through).max() {
            thread.compressed_through = thread.compressed_through.max(max);
        }
        Ok(())
    }

    async fn compressed_through(&self, thread_id: &str) -> Result<Sequence> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .map(|t| t.compressed_through)
            .unwrap_or(0))
    }
}

#[async_trait]
impl ThreadStore for InMemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn clear_thread(&self, thread_id: &str) -> Result<()> {
        self.threads.write().await.remove(thread_id);
        Ok(())
    }
}
