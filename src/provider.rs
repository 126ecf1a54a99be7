//! LLM provider capability used by the Observer and Reflector
//!
//! The pipeline only ever needs `complete(prompt, timeout) -> text`. Each
//! backend is a separate implementation of [`LlmProvider`]; none of their
//! request shapes leak into the core.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// System instructions plus the user payload for one completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Provider trait for text completion backends
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete the prompt, giving up after `timeout`
    async fn complete(&self, prompt: &Prompt, timeout: Duration) -> Result<String, ProviderError>;

    /// Model identifier, used in logs and stats
    fn model_name(&self) -> &str;
}

/// Provider errors
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProviderError {
    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unusable output: {0}")]
    UnusableOutput(String),
}

/// Configuration for an OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_retries: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_retries: 2,
            temperature: Some(0.3),
            max_tokens: None,
        }
    }
}

/// Provider for any server speaking the OpenAI chat completions protocol
/// (OpenAI, LiteLLM proxies, vLLM, llama.cpp server)
pub struct OpenAiCompatibleProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        if config.model.trim().is_empty() {
            return Err(ProviderError::InitializationError("model must not be empty".into()));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| ProviderError::InitializationError(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    async fn send_once(
        &self,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let mut req = self
            .client
            .post(&self.config.endpoint)
            .timeout(timeout)
            .json(request);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req.send().await.map_err(|e| classify(e, timeout))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError(format!("HTTP {}: {}", status, body)));
        }

        let parsed = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::ApiError("No choices in response".to_string()))
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, prompt: &Prompt, timeout: Duration) -> Result<String, ProviderError> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: chat_messages(prompt),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!("Retry attempt {} against {}", attempt, self.config.endpoint);
                tokio::time::sleep(Duration::from_millis(100 * (1 << attempt))).await;
            }
            match self.send_once(&request, timeout).await {
                Ok(text) => return Ok(text),
                Err(e) => last_error = Some(e),
            }
        }

        warn!(
            "Completion failed after {} attempts",
            self.config.max_retries + 1
        );
        Err(last_error.unwrap_or_else(|| ProviderError::ApiError("no attempt made".into())))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Provider for a local Ollama daemon (`/api/chat`, non-streaming)
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ProviderError::InitializationError(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(&self, prompt: &Prompt, timeout: Duration) -> Result<String, ProviderError> {
        let request = OllamaChatRequest {
            model: self.model.clone(),
            messages: chat_messages(prompt),
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError(format!("HTTP {}: {}", status, body)));
        }

        let parsed = response
            .json::<OllamaChatResponse>()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))?;
        Ok(parsed.message.map(|m| m.content).unwrap_or_default())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::NetworkError(error.to_string())
    }
}

fn chat_messages(prompt: &Prompt) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if !prompt.system.is_empty() {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: prompt.system.clone(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: prompt.user.clone(),
    });
    messages
}

// OpenAI-compatible API types
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<ChatMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> Prompt {
        Prompt::new("You observe.", "user: hello")
    }

    #[test]
    fn test_openai_config_default() {
        let config = OpenAiConfig::default();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn test_empty_model_rejected() {
        let config = OpenAiConfig {
            model: " ".into(),
            ..OpenAiConfig::default()
        };
        assert!(matches!(
            OpenAiCompatibleProvider::new(config),
            Err(ProviderError::InitializationError(_))
        ));
    }

    #[test]
    fn test_chat_messages_skip_empty_system() {
        let messages = chat_messages(&Prompt::new("", "only user"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[tokio::test]
    async fn test_openai_provider_reads_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"Date: 2026-03-01\n- 🔴 12:00 ok"}}]}"#)
            .create_async()
            .await;

        let provider = OpenAiCompatibleProvider::new(OpenAiConfig {
            endpoint: format!("{}/v1/chat/completions", server.url()),
            api_key: Some("sk-test".into()),
            max_retries: 0,
            ..OpenAiConfig::default()
        })
        .unwrap();

        let text = provider.complete(&prompt(), Duration::from_secs(5)).await.unwrap();
        assert!(text.contains("🔴 12:00 ok"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_openai_provider_surfaces_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body("quota exceeded")
            .expect(2)
            .create_async()
            .await;

        let provider = OpenAiCompatibleProvider::new(OpenAiConfig {
            endpoint: format!("{}/v1/chat/completions", server.url()),
            max_retries: 1,
            ..OpenAiConfig::default()
        })
        .unwrap();

        let err = provider
            .complete(&prompt(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ApiError(ref msg) if msg.contains("429")));
    }

    #[tokio::test]
    async fn test_ollama_provider_reads_message_content() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/chat")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":{"role":"assistant","content":"- 🟢 09:00 local"}}"#)
            .create_async()
            .await;

        let provider = OllamaProvider::new(format!("{}/", server.url()), "llama3.2").unwrap();
        let text = provider.complete(&prompt(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(text, "- 🟢 09:00 local");
        assert_eq!(provider.model_name(), "llama3.2");
    }
}
