//! Context window assembly
//!
//! Block 1 is the observation log, a stable prefix that only changes when a
//! pass commits. Block 2 is the tail of raw messages the log does not cover
//! yet. Rendering depends only on stored state, so identical state yields
//! byte-identical output.

use crate::error::Result;
use crate::parsing::{CURRENT_TASK_PREFIX, SUGGESTED_NEXT_PREFIX};
use crate::token_estimator::TokenEstimator;
use crate::types::{Message, Observation, ThreadId};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;

/// Rendered when the log is empty
pub const EMPTY_MEMORY: &str = "No previous memory observed.";

const MEMORY_HEADER: &str = "=== CONVERSATION MEMORY ===";
const RECENT_HEADER: &str = "=== RECENT MESSAGES ===";

/// The two-block context returned to the host
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreadContext {
    pub thread_id: ThreadId,
    /// Rendered observation log
    pub observations_block: String,
    /// Rendered recent messages, oldest first
    pub recent_block: String,
    /// The messages behind `recent_block`
    pub messages: Vec<Message>,
    pub observation_tokens: usize,
    pub message_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_next: Option<String>,
}

impl ThreadContext {
    pub fn total_tokens(&self) -> usize {
        self.observation_tokens + self.message_tokens
    }

    /// Single string ready to prepend to a model prompt
    pub fn to_prompt(&self, include_header: bool) -> String {
        let mut blocks = Vec::with_capacity(4);
        if include_header {
            blocks.push(MEMORY_HEADER.to_string());
        }
        blocks.push(self.observations_block.clone());

        if !self.messages.is_empty() {
            if include_header {
                blocks.push(format!("\n{RECENT_HEADER}"));
            }
            blocks.push(self.recent_block.clone());
        }
        blocks.join("\n")
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Builds [`ThreadContext`] values from stored state. Never mutates anything.
#[derive(Clone)]
pub struct ContextBuilder {
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder").finish_non_exhaustive()
    }
}

impl ContextBuilder {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    /// Assemble the context.
    ///
    /// `candidates` are the messages eligible for the recent block, oldest
    /// first. The newest ones are kept while they fit `budget`, but the
    /// newest `retention` are always kept even when they alone exceed it.
    pub fn build(
        &self,
        thread_id: &str,
        observations: &[Observation],
        candidates: Vec<Message>,
        retention: usize,
        budget: usize,
    ) -> ThreadContext {
        let messages = select_recent(self.estimator.as_ref(), candidates, retention, budget);
        let (current_task, suggested_next) = extract_task(observations);

        ThreadContext {
            thread_id: thread_id.to_string(),
            observations_block: render_observations(observations),
            recent_block: render_messages(&messages),
            observation_tokens: self.estimator.estimate_observations(observations),
            message_tokens: self.estimator.estimate_messages(&messages),
            messages,
            current_task,
            suggested_next,
        }
    }
}

fn select_recent(
    estimator: &dyn TokenEstimator,
    mut candidates: Vec<Message>,
    retention: usize,
    budget: usize,
) -> Vec<Message> {
    let floor = retention.min(candidates.len());
    let mut used = 0usize;
    let mut keep = 0usize;

    for (taken, msg) in candidates.iter().rev().enumerate() {
        let cost = estimator.estimate_message(msg);
        if taken >= floor && used + cost > budget {
            break;
        }
        used += cost;
        keep += 1;
    }

    candidates.split_off(candidates.len() - keep)
}

/// Log lines in stored order, with a `Date:` header whenever the day changes
pub fn render_observations(observations: &[Observation]) -> String {
    if observations.is_empty() {
        return EMPTY_MEMORY.to_string();
    }

    let mut out = String::new();
    let mut current: Option<NaiveDate> = None;
    for obs in observations {
        let day = obs.created_at.date_naive();
        if current != Some(day) {
            if current.is_some() {
                out.push('\n');
            }
            let _ = write!(out, "Date: {}", day.format("%Y-%m-%d"));
            current = Some(day);
        }
        let _ = write!(
            out,
            "\n- {} {} {}",
            obs.priority,
            obs.created_at.format("%H:%M"),
            obs.text
        );

        let mut reference = Vec::new();
        if let Some(date) = obs.referenced_date {
            reference.push(format!("referenced: {}", date.format("%Y-%m-%d")));
        }
        if let Some(relative) = &obs.relative_date {
            reference.push(format!("meaning \"{relative}\""));
        }
        if !reference.is_empty() {
            let _ = write!(out, " ({})", reference.join(", "));
        }
    }
    out
}

fn render_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(Message::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Latest task and next-step entries in the log
fn extract_task(observations: &[Observation]) -> (Option<String>, Option<String>) {
    let mut task = None;
    let mut next = None;
    for obs in observations {
        if let Some(rest) = obs.text.strip_prefix(CURRENT_TASK_PREFIX) {
            task = Some(rest.trim().to_string());
        } else if let Some(rest) = obs.text.strip_prefix(SUGGESTED_NEXT_PREFIX) {
            next = Some(rest.trim().to_string());
        }
    }
    (task, next)
}
