//! Reflector: rewrites an oversized observation log into a smaller equivalent

use crate::parsing::parse_observations;
use crate::prompts::{reflector_payload, REFLECTOR_INSTRUCTIONS};
use crate::provider::{LlmProvider, Prompt, ProviderError};
use crate::token_estimator::TokenEstimator;
use crate::types::{Observation, Sequence};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A rewritten log ready for `replace_all`
#[derive(Debug, Clone)]
pub struct ReflectorOutput {
    pub entries: Vec<Observation>,
    /// Highest `covers_through` of the input, carried by every rewritten entry
    pub covers_through: Sequence,
    pub entries_before: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[derive(Clone)]
pub struct Reflector {
    provider: Arc<dyn LlmProvider>,
    estimator: Arc<dyn TokenEstimator>,
    instructions: String,
    timeout: Duration,
}

impl Reflector {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        estimator: Arc<dyn TokenEstimator>,
        instructions: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            estimator,
            instructions: instructions.unwrap_or_else(|| REFLECTOR_INSTRUCTIONS.to_string()),
            timeout,
        }
    }

    /// Ask the provider for a merged, pruned version of `log`
    pub async fn reflect(
        &self,
        thread_id: &str,
        log: &[Observation],
    ) -> Result<ReflectorOutput, ProviderError> {
        if log.is_empty() {
            return Err(ProviderError::UnusableOutput(
                "no observations to reflect on".to_string(),
            ));
        }
        let covers_through = log.iter().map(|o| o.covers_through).max().unwrap_or(0);

        let prompt = Prompt::new(self.instructions.clone(), reflector_payload(log));
        let input_tokens = self.estimator.estimate(&prompt.system) + self.estimator.estimate(&prompt.user);

        debug!(
            "Reflector calling {} for {} ({} entries)",
            self.provider.model_name(),
            thread_id,
            log.len()
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
                "reflector response contained no observations".to_string(),
            ));
        }

        Ok(ReflectorOutput {
            output_tokens: self.estimator.estimate(&response),
            entries,
            covers_through,
            entries_before: log.len(),
            input_tokens,
        })
    }
}
