use crate::anthropic::AnthropicClient;
use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse};
use std::time::Duration;

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
}

impl Provider {
    /// Parses a configured provider name; `None` means "infer from the model".
    pub fn parse(value: &str) -> Result<Option<Self>> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(None),
            "openai" => Ok(Some(Self::OpenAI)),
            "anthropic" => Ok(Some(Self::Anthropic)),
            other => Err(LlmError::InvalidInput(format!(
                "unsupported llm provider {other:?}; expected openai, anthropic or auto"
            ))),
        }
    }

    /// Infers the provider from a model name.
    pub fn detect(model: &str) -> Self {
        let m = model.to_ascii_lowercase();
        if m.starts_with("claude-") {
            return Self::Anthropic;
        }
        Self::OpenAI
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(LlmError::InvalidInput("api key is empty".to_string()));
        }
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            provider: Provider::detect(model),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: None,
            client,
        })
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    /// Points the client at an API-compatible endpoint instead of the vendor default.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = Some(base_url.trim_end_matches('/').to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one chat completion request; `timeout` bounds the whole HTTP exchange.
    #[tracing::instrument(level = "info", skip_all, fields(provider = ?self.provider, model = %self.model))]
    pub async fn chat(&self, messages: &[ChatMessage], timeout: Duration) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput("no messages to send".to_string()));
        }
        match self.provider {
            Provider::OpenAI => {
                let c = OpenAiClient::new(
                    self.client.clone(),
                    &self.api_key,
                    &self.model,
                    self.base_url.as_deref(),
                );
                c.chat(messages, timeout).await
            }
            Provider::Anthropic => {
                let c = AnthropicClient::new(
                    self.client.clone(),
                    &self.api_key,
                    &self.model,
                    self.base_url.as_deref(),
                );
                c.chat(messages, timeout).await
            }
        }
    }
}
