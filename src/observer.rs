//! Observer: compresses a window of raw messages into observation entries

use crate::parsing::parse_observations;
use crate::prompts::{observer_payload, OBSERVER_INSTRUCTIONS};
use crate::provider::{LlmProvider, Prompt, ProviderError};
use crate::token_estimator::TokenEstimator;
use crate::types::{Message, Observation, Sequence};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of a successful Observer call, not yet committed
#[derive(Debug, Clone)]
pub struct ObserverOutput {
    /// New entries, in the order they should be appended
    pub entries: Vec<Observation>,
    /// Sequence of the last message in the window
    pub covers_through: Sequence,
    pub messages_compressed: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Builds the summarization request and parses the reply
#[derive(Clone)]
pub struct Observer {
    provider: Arc<dyn LlmProvider>,
    estimator: Arc<dyn TokenEstimator>,
    instructions: String,
    timeout: Duration,
}

impl Observer {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        estimator: Arc<dyn TokenEstimator>,
        instructions: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            estimator,
            instructions: instructions.unwrap_or_else(|| OBSERVER_INSTRUCTIONS.to_string()),
            timeout,
        }
    }

    /// Run one pass over `messages` (oldest first).
    ///
    /// Nothing is written here; the caller commits the returned entries.
    pub async fn observe(
        &self,
        thread_id: &str,
        existing: &[Observation],
        messages: &[Message],
    ) -> Result<ObserverOutput, ProviderError> {
        let Some(last) = messages.last() else {
            return Err(ProviderError::UnusableOutput(
                "no messages to compress".to_string(),
            ));
        };
        let covers_through = last.sequence;

        let prompt = Prompt::new(self.instructions.clone(), observer_payload(existing, messages));
        let input_tokens = self.estimator.estimate(&prompt.system) + self.estimator.estimate(&prompt.user);

        debug!(
            "Observer calling {} for {} ({} messages, through {})",
            self.provider.model_name(),
            thread_id,
            messages.len(),
            covers_through
        );

        let response = match tokio::time::timeout(
            self.timeout,
            self.provider.complete(&prompt, self.timeout),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ProviderError::Timeout(self.timeout)),
        };

        let entries = parse_observations(&response, thread_id, covers_through, Utc::now());
        if entries.is_empty() {
            return Err(ProviderError::UnusableOutput(
                "observer response contained no observations".to_string(),
            ));
        }

        Ok(ObserverOutput {
            output_tokens: self.estimator.estimate(&response),
            entries,
            covers_through,
            messages_compressed: messages.len(),
            input_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_estimator::WordBasedEstimator;
    use crate::types::Role;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Canned {
        reply: Result<String, ProviderError>,
        delay: Duration,
        seen: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl LlmProvider for Canned {
        async fn complete(&self, prompt: &Prompt, _timeout: Duration) -> Result<String, ProviderError> {
            self.seen.lock().unwrap().push(prompt.clone());
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    fn observer(reply: Result<String, ProviderError>, delay: Duration) -> (Observer, Arc<Canned>) {
        let provider = Arc::new(Canned {
            reply,
            delay,
            seen: Mutex::new(Vec::new()),
        });
        let observer = Observer::new(
            provider.clone(),
            Arc::new(WordBasedEstimator::default()),
            None,
            Duration::from_millis(200),
        );
        (observer, provider)
    }

    fn messages() -> Vec<Message> {
        (1..=3)
            .map(|i| Message {
                thread_id: "t".into(),
                role: Role::User,
                content: format!("message number {i}"),
                sequence: i,
                timestamp: Utc::now(),
                metadata: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_observe_parses_entries_covering_window() {
        let (observer, provider) = observer(
            Ok("- 🔴 10:00 User counts messages\nCURRENT_TASK: counting".to_string()),
            Duration::ZERO,
        );
        let out = observer.observe("t", &[], &messages()).await.unwrap();

        assert_eq!(out.covers_through, 3);
        assert_eq!(out.entries.len(), 2);
        assert!(out.entries.iter().all(|e| e.covers_through == 3));
        assert_eq!(out.messages_compressed, 3);
        assert!(out.input_tokens > 0 && out.output_tokens > 0);

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].system, OBSERVER_INSTRUCTIONS);
        assert!(seen[0].user.contains("user: message number 2"));
    }

    #[tokio::test]
    async fn test_prose_reply_is_unusable() {
        let (observer, _) = observer(Ok("I could not find anything.".to_string()), Duration::ZERO);
        let err = observer.observe("t", &[], &messages()).await.unwrap_err();
        assert!(matches!(err, ProviderError::UnusableOutput(_)));
    }

    #[tokio::test]
    async fn test_provider_error_passes_through() {
        let (observer, _) = observer(Err(ProviderError::ApiError("503".into())), Duration::ZERO);
        let err = observer.observe("t", &[], &messages()).await.unwrap_err();
        assert_eq!(err, ProviderError::ApiError("503".into()));
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let (observer, _) = observer(Ok("- 🟢 late".to_string()), Duration::from_secs(5));
        let err = observer.observe("t", &[], &messages()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_empty_window_is_rejected() {
        let (observer, provider) = observer(Ok("- 🟢 x".to_string()), Duration::ZERO);
        assert!(observer.observe("t", &[], &[]).await.is_err());
        assert!(provider.seen.lock().unwrap().is_empty());
    }
}
