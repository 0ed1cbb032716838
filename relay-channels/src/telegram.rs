use crate::error::DeliveryError;
use crate::traits::ChatPlatform;
use crate::types::{OriginContext, PlatformEvent};
use anyhow::Result;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;

const TELEGRAM_PLATFORM_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Debug, Default)]
struct PollState {
    /// Confirmed to Telegram only by the next `getUpdates`, which is not sent
    /// until `pending` is empty, so unrelayed events are redelivered after a
    /// restart.
    offset: i64,
    consecutive_failures: u32,
    pending: VecDeque<PlatformEvent>,
}

pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
    poll: Mutex<PollState>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!("telegram bot token is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.trim().to_string(),
            api_base: TELEGRAM_API_BASE.to_string(),
            poll: Mutex::new(PollState::default()),
        })
    }

    /// Overrides the Bot API host, e.g. for a self-hosted Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, self.bot_token, method
        ))?)
    }
}

#[async_trait::async_trait]
impl ChatPlatform for TelegramAdapter {
    fn platform_id(&self) -> &str {
        TELEGRAM_PLATFORM_ID
    }

    async fn verify(&self) -> Result<()> {
        let url = self.api_url("getMe")?;
        let resp = self.http.get(url).send().await.map_err(redact)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "telegram getMe failed (check bot token): status={status} body={body}"
            ));
        }
        let me: TelegramGetMeResponse = resp.json().await.map_err(redact)?;
        tracing::info!(
            bot_id = me.result.id,
            bot_username = ?me.result.username,
            "telegram credentials verified"
        );
        Ok(())
    }

    async fn receive_event(&self) -> Result<Option<PlatformEvent>> {
        let mut state = self.poll.lock().await;
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Ok(Some(event));
            }
            self.poll_once(&mut state).await?;
        }
    }

    async fn send_reply(&self, origin: &OriginContext, text: &str) -> Result<(), DeliveryError> {
        let url = self
            .api_url("sendMessage")
            .map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        let mut body = serde_json::json!({
            "chat_id": origin.chat_id.as_str(),
            "text": text,
        });
        if let Some(reply_to) = origin.reply_to.as_ref().and_then(|m| m.parse::<i64>().ok()) {
            body["reply_parameters"] = serde_json::json!({
                "message_id": reply_to,
                "allow_sending_without_reply": true,
            });
        }

        let resp = match self.http.post(url).json(&body).send().await {
            Ok(resp) => resp,
            Err(error) => return Err(DeliveryError::Transient(redact(error).to_string())),
        };
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        let detail = format!("telegram sendMessage failed: status={status} body={text}");
        if is_transient_status(status) {
            Err(DeliveryError::Transient(detail))
        } else {
            Err(DeliveryError::Permanent(detail))
        }
    }

    fn max_message_chars(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_CHARS
    }
}

impl TelegramAdapter {
    /// One long-poll round trip. Failures are absorbed with a backoff sleep so
    /// the ingestion loop stays alive across network trouble.
    #[tracing::instrument(level = "debug", skip_all, fields(offset = state.offset))]
    async fn poll_once(&self, state: &mut PollState) -> Result<()> {
        let url = self.api_url("getUpdates")?;
        let response = match self
            .http
            .get(url)
            .query(&[
                ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                ("offset", &state.offset.to_string()),
                ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                let error = redact(error);
                state.consecutive_failures += 1;
                let delay = transient_retry_delay(state.consecutive_failures);
                tracing::warn!(
                    %error,
                    attempt = state.consecutive_failures,
                    ?delay,
                    "telegram getUpdates request failed; retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                return Ok(());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|error| {
                format!("<failed to read telegram error body: {}>", redact(error))
            });
            if is_transient_status(status) {
                state.consecutive_failures += 1;
                let delay = transient_retry_delay(state.consecutive_failures);
                tracing::warn!(
                    %status,
                    %body,
                    attempt = state.consecutive_failures,
                    ?delay,
                    "telegram getUpdates transient failure; retrying with backoff"
                );
                tokio::time::sleep(delay).await;
            } else {
                state.consecutive_failures = 0;
                tracing::error!(
                    %status,
                    %body,
                    ?TELEGRAM_NON_TRANSIENT_DELAY,
                    "telegram getUpdates non-transient failure; keeping poll loop alive"
                );
                tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
            }
            return Ok(());
        }

        let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
            Ok(parsed) => parsed,
            Err(error) => {
                let error = redact(error);
                state.consecutive_failures += 1;
                let delay = transient_retry_delay(state.consecutive_failures);
                tracing::warn!(
                    %error,
                    attempt = state.consecutive_failures,
                    ?delay,
                    "telegram getUpdates payload parse failed; retrying with backoff"
                );
                tokio::time::sleep(delay).await;
                return Ok(());
            }
        };

        state.consecutive_failures = 0;
        let (next_offset, events) = collect_events(state.offset, parsed.result);
        state.offset = next_offset;
        state.pending.extend(events);
        Ok(())
    }
}

/// Converts a batch of updates into events and returns the offset to poll
/// from next. The offset advances past every update, including ones that
/// carry nothing relayable, so a poison update is never replayed.
fn collect_events(offset: i64, mut updates: Vec<TelegramUpdate>) -> (i64, Vec<PlatformEvent>) {
    let mut next_offset = offset;
    let mut events = Vec::new();
    updates.sort_by_key(|update| update.update_id);
    for update in updates {
        if update.update_id < next_offset {
            continue;
        }
        next_offset = update.update_id.saturating_add(1);
        if let Some(event) = build_event(update.update_id, update.message.as_ref()) {
            events.push(event);
        }
    }
    (next_offset, events)
}

/// Request URLs carry the bot token; strip them before an error is logged.
fn redact(error: reqwest::Error) -> reqwest::Error {
    error.without_url()
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_event(update_id: i64, message: Option<&TelegramMessage>) -> Option<PlatformEvent> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    let text = extract_message_text(message)?;
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}:message"));

    Some(PlatformEvent {
        platform_id: TELEGRAM_PLATFORM_ID.to_string(),
        message_id: message_id.into(),
        chat_id: chat.id.to_string().into(),
        sender_id: sender_id.into(),
        is_group: chat.r#type != "private",
        locale: message
            .from
            .as_ref()
            .and_then(|user| user.language_code.clone()),
        text,
        received_at: Utc::now(),
    })
}

fn extract_message_text(message: &TelegramMessage) -> Option<String> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(caption) = message.caption.as_deref().map(str::trim) {
        if !caption.is_empty() {
            return Some(caption.to_string());
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct TelegramGetMeResponse {
    result: TelegramUser,
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    language_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}
