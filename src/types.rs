//! Messages, observation entries and per-thread compression state

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-supplied key identifying a conversation thread
pub type ThreadId = String;

/// Position of a message inside its thread. The first message is 1; 0 means "nothing".
pub type Sequence = u64;

/// Author of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Ok(Role::User),
            "assistant" | "ai" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A raw conversation turn. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Thread this message belongs to
    pub thread_id: ThreadId,
    /// Who wrote it
    pub role: Role,
    /// Message text
    pub content: String,
    /// Assigned by the store; strictly increasing within a thread
    pub sequence: Sequence,
    /// When the message was appended
    pub timestamp: DateTime<Utc>,
    /// Free-form caller metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// Line used for prompts, token estimation and the recent block
    pub fn render(&self) -> String {
        format!("{}: {}", self.role, self.content)
    }
}

/// Priority tag carried by each observation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Decisions, deadlines, requirements, names
    Critical,
    /// Preferences, considerations, open questions
    Important,
    /// Minor details
    Info,
}

impl Priority {
    pub const ALL: &'static [Priority] = &[Priority::Critical, Priority::Important, Priority::Info];

    /// Marker used in the observation line format
    pub fn marker(&self) -> &'static str {
        match self {
            Priority::Critical => "🔴",
            Priority::Important => "🟡",
            Priority::Info => "🟢",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Important => "important",
            Priority::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => Priority::Critical,
            "important" => Priority::Important,
            _ => Priority::Info,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.marker())
    }
}

/// A dense summary of durable facts extracted from a span of raw conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub id: String,
    pub thread_id: ThreadId,
    /// The summary itself
    pub text: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Highest message sequence whose content this entry accounts for
    pub covers_through: Sequence,
    /// Date the underlying event happened, when the conversation named one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_date: Option<NaiveDate>,
    /// Human phrasing of the referenced date ("next Friday")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_date: Option<String>,
}

impl Observation {
    pub fn new(
        thread_id: impl Into<ThreadId>,
        text: impl Into<String>,
        covers_through: Sequence,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            text: text.into(),
            priority: Priority::Info,
            created_at: Utc::now(),
            covers_through,
            referenced_date: None,
            relative_date: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_referenced_date(mut self, date: NaiveDate) -> Self {
        self.referenced_date = Some(date);
        self
    }

    pub fn with_relative_date(mut self, relative: impl Into<String>) -> Self {
        self.relative_date = Some(relative.into());
        self
    }

    /// Line used for prompts and token estimation
    pub fn render(&self) -> String {
        format!("{} {}", self.priority, self.text)
    }
}

/// Which pass, if any, currently owns a thread
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPhase {
    #[default]
    Idle,
    Observing,
    Reflecting,
}

impl std::fmt::Display for CompressionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompressionPhase::Idle => "idle",
            CompressionPhase::Observing => "observing",
            CompressionPhase::Reflecting => "reflecting",
        };
        f.write_str(s)
    }
}

/// Snapshot of a thread's compression bookkeeping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CompressionState {
    /// Messages at or below this sequence are summarized by the observation log
    pub last_compressed_sequence: Sequence,
    pub observation_token_estimate: usize,
    /// Estimate of the messages above `last_compressed_sequence`
    pub raw_token_estimate: usize,
    pub compression_in_progress: bool,
    pub phase: CompressionPhase,
}
