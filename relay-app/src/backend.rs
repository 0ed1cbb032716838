//! AI completion backend seam used by the workers.

use crate::config::RelayConfig;
use crate::request::Payload;
use async_trait::async_trait;
use relay_llm::{ChatMessage, LlmClient, LlmError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Worth another attempt: timeouts, rate limits, 5xx, transport failures.
    #[error("retryable backend error: {0}")]
    Retryable(String),

    #[error("terminal backend error: {0}")]
    Terminal(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<LlmError> for BackendError {
    fn from(e: LlmError) -> Self {
        if e.is_retryable() {
            Self::Retryable(e.to_string())
        } else {
            Self::Terminal(e.to_string())
        }
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Produces a single completion for `payload`. `timeout` bounds this call.
    async fn complete(&self, payload: &Payload, timeout: Duration) -> Result<String, BackendError>;
}

/// Single-turn chat completion over `relay_llm`, with the configured system prompt.
pub struct LlmBackend {
    client: LlmClient,
    system_prompt: String,
}

impl LlmBackend {
    pub fn new(client: LlmClient, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn from_config(cfg: &RelayConfig) -> anyhow::Result<Self> {
        let api_key = cfg
            .api_key()
            .ok_or_else(|| anyhow::anyhow!("llm.api_key is required"))?;
        let mut client = LlmClient::new(api_key, &cfg.llm.model)?.with_provider(cfg.provider()?);
        if let Some(base_url) = &cfg.llm.base_url {
            client = client.with_base_url(base_url.clone());
        }
        tracing::info!(provider = ?client.provider(), model = %client.model(), "llm backend configured");
        Ok(Self::new(client, cfg.llm.system_prompt.clone()))
    }

    fn build_messages(&self, payload: &Payload) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.push(ChatMessage::user(payload.text.clone()));
        messages
    }
}

#[async_trait]
impl CompletionBackend for LlmBackend {
    async fn complete(&self, payload: &Payload, timeout: Duration) -> Result<String, BackendError> {
        if payload.text.trim().is_empty() {
            return Err(BackendError::Terminal("empty message".to_string()));
        }
        let messages = self.build_messages(payload);
        let response = self.client.chat(&messages, timeout).await?;
        tracing::debug!(
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            finish_reason = %response.finish_reason,
            "completion received"
        );
        let text = response.message.content.trim().to_string();
        if text.is_empty() {
            return Err(BackendError::Terminal("empty completion".to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_channels::SenderId;
    use relay_llm::Role;

    fn payload(text: &str) -> Payload {
        Payload {
            text: text.to_string(),
            sender_id: SenderId::from("1"),
            locale: None,
        }
    }

    #[test]
    fn llm_errors_are_classified() {
        let retryable: BackendError = LlmError::Status {
            status: 503,
            body: "busy".to_string(),
        }
        .into();
        assert!(retryable.is_retryable());

        let limited: BackendError = LlmError::Status {
            status: 429,
            body: String::new(),
        }
        .into();
        assert!(limited.is_retryable());

        let terminal: BackendError = LlmError::Status {
            status: 400,
            body: "bad request".to_string(),
        }
        .into();
        assert!(!terminal.is_retryable());

        let malformed: BackendError = LlmError::ResponseFormat("no choices".to_string()).into();
        assert!(!malformed.is_retryable());
    }

    #[test]
    fn system_prompt_is_prepended_when_set() {
        let client = LlmClient::new("key", "gpt-4o-mini").expect("client");
        let backend = LlmBackend::new(client.clone(), "Be brief.");
        let messages = backend.build_messages(&payload("hello"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "hello");

        let bare = LlmBackend::new(client, "  ");
        assert_eq!(bare.build_messages(&payload("hello")).len(), 1);
    }

    #[tokio::test]
    async fn empty_message_is_terminal_without_a_network_call() {
        let client = LlmClient::new("key", "gpt-4o-mini")
            .expect("client")
            .with_base_url("http://127.0.0.1:9");
        let backend = LlmBackend::new(client, "");
        let err = backend
            .complete(&payload("   "), Duration::from_secs(1))
            .await
            .expect_err("empty");
        assert!(!err.is_retryable());
    }
}
