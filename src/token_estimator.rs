//! Token estimation for threshold decisions
//!
//! Estimates only need to be consistent with the thresholds they are compared
//! against. Every estimator here is monotonic: appending text never lowers the
//! estimate.

use crate::types::{Message, Observation};
use std::sync::Arc;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate for a single message as it appears in prompts
    fn estimate_message(&self, message: &Message) -> usize {
        self.estimate(&message.render())
    }

    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    fn estimate_observations(&self, observations: &[Observation]) -> usize {
        observations.iter().map(|o| self.estimate(&o.render())).sum()
    }
}

/// Word-based estimator (one token per 0.75 words by default)
#[derive(Debug, Clone)]
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self {
            tokens_per_word: tokens_per_word.max(0.0),
        }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.0 / 0.75)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Character-ratio estimator (~4 characters per token for English text)
#[derive(Debug, Clone)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token > 0.0 { chars_per_token } else { 4.0 },
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4.0)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}

/// Tiktoken-based estimator using cl100k_base (GPT-4, GPT-3.5-turbo)
#[cfg(feature = "tiktoken")]
pub struct TiktokenEstimator {
    bpe: Arc<tiktoken_rs::CoreBPE>,
}

#[cfg(feature = "tiktoken")]
impl TiktokenEstimator {
    pub fn new() -> crate::error::Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

#[cfg(feature = "tiktoken")]
impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Estimator used when the caller does not inject one
pub fn default_estimator() -> Arc<dyn TokenEstimator> {
    Arc::new(WordBasedEstimator::default())
}
