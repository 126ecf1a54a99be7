//! Pipeline pulses - event stream for compression activity
//!
//! Hosts subscribe to learn when messages land, when the Observer or Reflector
//! runs, and when a pass is abandoned. Pulses carry ids, sequences and token
//! counts, never message content.
//!
//! Example:
//! ```rust,no_run
//! use obsmem::{ObservationalMemory, Pulse};
//! # async fn run(memory: ObservationalMemory) {
//! let mut subscriber = memory.pulses().subscribe();
//! tokio::spawn(async move {
//!     while let Ok(pulse) = subscriber.recv().await {
//!         if let Pulse::ObserverCompleted { thread_id, entries, .. } = pulse {
//!             println!("{thread_id}: {entries} new observations");
//!         }
//!     }
//! });
//! # }
//! ```

use crate::types::{Sequence, ThreadId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// A pulse (event) emitted by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Pulse {
    /// A message was durably appended
    MessageAdded {
        thread_id: ThreadId,
        sequence: Sequence,
        timestamp: DateTime<Utc>,
    },

    /// The raw window crossed the Observer threshold (or a pass was forced)
    ObserverTriggered {
        thread_id: ThreadId,
        raw_tokens: usize,
        timestamp: DateTime<Utc>,
    },

    /// Observer entries were committed
    ObserverCompleted {
        thread_id: ThreadId,
        entries: usize,
        covers_through: Sequence,
        input_tokens: usize,
        output_tokens: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The observation log crossed the Reflector threshold (or a pass was forced)
    ReflectorTriggered {
        thread_id: ThreadId,
        observation_tokens: usize,
        timestamp: DateTime<Utc>,
    },

    /// The observation log was rewritten
    ReflectorCompleted {
        thread_id: ThreadId,
        entries_before: usize,
        entries_after: usize,
        input_tokens: usize,
        output_tokens: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A pass was abandoned; stores are unchanged
    CompressionFailed {
        thread_id: ThreadId,
        stage: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A context window was assembled
    ContextBuilt {
        thread_id: ThreadId,
        observation_tokens: usize,
        message_tokens: usize,
        timestamp: DateTime<Utc>,
    },
}

impl Pulse {
    /// Get the timestamp of the pulse
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Pulse::MessageAdded { timestamp, .. }
            | Pulse::ObserverTriggered { timestamp, .. }
            | Pulse::ObserverCompleted { timestamp, .. }
            | Pulse::ReflectorTriggered { timestamp, .. }
            | Pulse::ReflectorCompleted { timestamp, .. }
            | Pulse::CompressionFailed { timestamp, .. }
            | Pulse::ContextBuilt { timestamp, .. } => *timestamp,
        }
    }

    /// Thread the pulse is about
    pub fn thread_id(&self) -> &str {
        match self {
            Pulse::MessageAdded { thread_id, .. }
            | Pulse::ObserverTriggered { thread_id, .. }
            | Pulse::ObserverCompleted { thread_id, .. }
            | Pulse::ReflectorTriggered { thread_id, .. }
            | Pulse::ReflectorCompleted { thread_id, .. }
            | Pulse::CompressionFailed { thread_id, .. }
            | Pulse::ContextBuilt { thread_id, .. } => thread_id,
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> String {
        match self {
            Pulse::MessageAdded {
                thread_id,
                sequence,
                ..
            } => format!("Message {} added to {}", sequence, thread_id),
            Pulse::ObserverTriggered {
                thread_id,
                raw_tokens,
                ..
            } => format!("Observer triggered for {} ({} raw tokens)", thread_id, raw_tokens),
            Pulse::ObserverCompleted {
                thread_id,
                entries,
                covers_through,
                ..
            } => format!(
                "Observer added {} entries to {} (through {})",
                entries, thread_id, covers_through
            ),
            Pulse::ReflectorTriggered {
                thread_id,
                observation_tokens,
                ..
            } => format!(
                "Reflector triggered for {} ({} observation tokens)",
                thread_id, observation_tokens
            ),
            Pulse::ReflectorCompleted {
                thread_id,
                entries_before,
                entries_after,
                ..
            } => format!(
                "Reflector rewrote {}: {} -> {} entries",
                thread_id, entries_before, entries_after
            ),
            Pulse::CompressionFailed {
                thread_id,
                stage,
                error,
                ..
            } => format!("{} pass for {} abandoned: {}", stage, thread_id, error),
            Pulse::ContextBuilt {
                thread_id,
                observation_tokens,
                message_tokens,
                ..
            } => format!(
                "Context for {}: {} observation + {} message tokens",
                thread_id, observation_tokens, message_tokens
            ),
        }
    }
}

/// Types of pulses (for stats)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PulseType {
    MessageAdded,
    ObserverTriggered,
    ObserverCompleted,
    ReflectorTriggered,
    ReflectorCompleted,
    CompressionFailed,
    ContextBuilt,
}

impl From<&Pulse> for PulseType {
    fn from(pulse: &Pulse) -> Self {
        match pulse {
            Pulse::MessageAdded { .. } => PulseType::MessageAdded,
            Pulse::ObserverTriggered { .. } => PulseType::ObserverTriggered,
            Pulse::ObserverCompleted { .. } => PulseType::ObserverCompleted,
            Pulse::ReflectorTriggered { .. } => PulseType::ReflectorTriggered,
            Pulse::ReflectorCompleted { .. } => PulseType::ReflectorCompleted,
            Pulse::CompressionFailed { .. } => PulseType::CompressionFailed,
            Pulse::ContextBuilt { .. } => PulseType::ContextBuilt,
        }
    }
}

/// Event bus for the pipeline
#[derive(Debug, Clone)]
pub struct MemoryPulses {
    sender: broadcast::Sender<Pulse>,
    stats: Arc<RwLock<PulseStats>>,
}

impl MemoryPulses {
    /// Create a pulse bus buffering up to `capacity` undelivered pulses per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(RwLock::new(PulseStats::default())),
        }
    }

    /// Subscribe to all pulses
    pub fn subscribe(&self) -> broadcast::Receiver<Pulse> {
        self.sender.subscribe()
    }

    /// Emit a pulse
    pub async fn emit(&self, pulse: Pulse) {
        {
            let mut stats = self.stats.write().await;
            stats.total_emitted += 1;
            stats.last_emitted = Some(pulse.timestamp());
            *stats.by_type.entry(PulseType::from(&pulse)).or_insert(0) += 1;
        }

        // No subscribers is the common case
        if self.sender.send(pulse).is_err() {
            tracing::trace!("Pulse dropped, no subscribers");
        }
    }

    /// Get current stats
    pub async fn stats(&self) -> PulseStats {
        self.stats.read().await.clone()
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryPulses {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Statistics for pulse monitoring
#[derive(Debug, Clone, Default)]
pub struct PulseStats {
    pub total_emitted: u64,
    pub last_emitted: Option<DateTime<Utc>>,
    pub by_type: HashMap<PulseType, u64>,
}

/// Helper functions for creating common pulses
pub mod pulse {
    use super::*;

    pub fn message_added(thread_id: &str, sequence: Sequence) -> Pulse {
        Pulse::MessageAdded {
            thread_id: thread_id.to_string(),
            sequence,
            timestamp: Utc::now(),
        }
    }

    pub fn observer_triggered(thread_id: &str, raw_tokens: usize) -> Pulse {
        Pulse::ObserverTriggered {
            thread_id: thread_id.to_string(),
            raw_tokens,
            timestamp: Utc::now(),
        }
    }

    pub fn reflector_triggered(thread_id: &str, observation_tokens: usize) -> Pulse {
        Pulse::ReflectorTriggered {
            thread_id: thread_id.to_string(),
            observation_tokens,
            timestamp: Utc::now(),
        }
    }

    pub fn compression_failed(thread_id: &str, stage: &str, error: impl ToString) -> Pulse {
        Pulse::CompressionFailed {
            thread_id: thread_id.to_string(),
            stage: stage.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn context_built(thread_id: &str, observation_tokens: usize, message_tokens: usize) -> Pulse {
        Pulse::ContextBuilt {
            thread_id: thread_id.to_string(),
            observation_tokens,
            message_tokens,
            timestamp: Utc::now(),
        }
    }
}
