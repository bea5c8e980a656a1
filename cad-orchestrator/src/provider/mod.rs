//! LLM provider abstraction and the completion client
//!
//! Providers surface every failure as a typed [`ProviderError`]. The
//! [`CompletionClient`] sits on top and turns the outcome of a single call
//! into "text or nothing", logging what happened, so retry decisions stay
//! with the pipeline.

mod anthropic;
mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::LlmConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur when interacting with an LLM provider
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Response has no completion text")]
    MissingContent,

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Unknown provider type: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    /// Classify a transport error, separating timeouts out
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::HttpError(err)
        }
    }
}

/// Request to send to an LLM
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    /// System prompt
    pub system: String,

    /// User message/prompt
    pub prompt: String,

    /// Temperature (0.0 - 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }
}

/// Response from an LLM
#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    /// The generated text
    pub content: String,

    /// Token usage statistics
    pub usage: Option<TokenUsage>,

    /// Time taken for generation (ms)
    pub duration_ms: Option<u64>,
}

/// Token usage statistics
#[derive(Debug, Clone, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name for logging/identification
    fn name(&self) -> &str;

    /// Get the model being used
    fn model(&self) -> &str;

    /// Send a completion request to the LLM
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ProviderError>;
}

/// Build the configured provider. Returns `Ok(None)` when no credential is
/// configured, which puts the pipeline in permanent fallback mode.
pub fn provider_from_config(
    config: &LlmConfig,
) -> Result<Option<Arc<dyn LlmProvider>>, ProviderError> {
    let Some(api_key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
        return Ok(None);
    };
    let timeout = Duration::from_secs(config.timeout_secs);

    let provider: Arc<dyn LlmProvider> = match config.provider_type.as_str() {
        "anthropic" => Arc::new(AnthropicProvider::new(
            config.base_url(),
            api_key,
            &config.model,
            timeout,
        )?),
        "openai" => Arc::new(OpenAiProvider::new(
            config.base_url(),
            api_key,
            &config.model,
            timeout,
        )?),
        other => return Err(ProviderError::UnknownProvider(other.to_string())),
    };

    Ok(Some(provider))
}

/// One completion call per invocation; failures become `None`
pub struct CompletionClient {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: u32,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Returns the completion text, or `None` on any failure or empty answer
    pub async fn complete(&self, system: &str, user: &str) -> Option<String> {
        let request = LlmRequest::new(system, user)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        let start = Instant::now();
        let result = self.provider.complete(&request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) if !response.content.trim().is_empty() => {
                info!(
                    provider = self.provider.name(),
                    model = self.provider.model(),
                    elapsed_ms,
                    content_len = response.content.len(),
                    "Completion received"
                );
                debug!(content = %response.content, "Raw completion");
                Some(response.content)
            }
            Ok(_) => {
                warn!(
                    provider = self.provider.name(),
                    elapsed_ms, "Completion contained no text"
                );
                None
            }
            Err(ProviderError::Status { status, body }) => {
                warn!(
                    provider = self.provider.name(),
                    status,
                    elapsed_ms,
                    body = %body,
                    "Completion call rejected"
                );
                None
            }
            Err(e) => {
                warn!(
                    provider = self.provider.name(),
                    elapsed_ms,
                    error = %e,
                    "Completion call failed"
                );
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;

    fn config_with_key(provider_type: &str, key: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider_type: provider_type.to_string(),
            api_key: key.map(str::to_string),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_no_credential_means_no_provider() {
        assert!(provider_from_config(&config_with_key("anthropic", None))
            .unwrap()
            .is_none());
        assert!(provider_from_config(&config_with_key("anthropic", Some("  ")))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_builds_configured_provider() {
        let provider = provider_from_config(&config_with_key("anthropic", Some("sk-test")))
            .unwrap()
            .unwrap();
        assert_eq!(provider.name(), "anthropic");

        let provider = provider_from_config(&config_with_key("openai", Some("sk-test")))
            .unwrap()
            .unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn test_unknown_provider_type_is_an_error() {
        let result = provider_from_config(&config_with_key("carrier-pigeon", Some("k")));
        assert!(matches!(result, Err(ProviderError::UnknownProvider(_))));
    }

    #[test]
    fn test_request_builder() {
        let request = LlmRequest::new("sys", "user")
            .with_temperature(0.3)
            .with_max_tokens(2000);
        assert_eq!(request.temperature, Some(0.3));
        assert_eq!(request.max_tokens, Some(2000));
    }

    #[tokio::test]
    async fn test_completion_client_swallows_failures() {
        let provider = Arc::new(ScriptedProvider::new(vec![None, Some("   "), Some("hello")]));
        let client = CompletionClient::new(provider.clone(), &LlmConfig::default());

        assert_eq!(client.complete("sys", "user").await, None);
        assert_eq!(client.complete("sys", "user").await, None);
        assert_eq!(client.complete("sys", "user").await.as_deref(), Some("hello"));
        assert_eq!(provider.calls(), 3);
    }
}
