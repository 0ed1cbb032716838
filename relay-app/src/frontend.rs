//! Chat front end: the ingestion loop (platform -> queue) and the reply loop
//! (workers -> platform).

use crate::authorizer::{AuthReason, Authorizer};
use crate::commands::ChatCommand;
use crate::config::FrontendConfig;
use crate::messages::{Localization, MessageKey};
use crate::queue::{QueueError, RequestQueue};
use crate::request::{Payload, Request, RequestId, RequestIdGenerator, Response};
use relay_channels::{ChatPlatform, DeliveryError, OriginContext, PlatformEvent, split_message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FrontendSettings {
    pub delivery_attempts: u32,
    pub delivery_backoff: Duration,
    pub ack_enqueued: bool,
}

impl FrontendSettings {
    pub fn from_config(cfg: &FrontendConfig) -> Self {
        Self {
            delivery_attempts: cfg.delivery_attempts.max(1),
            delivery_backoff: Duration::from_millis(cfg.delivery_backoff_ms),
            ack_enqueued: cfg.ack_enqueued,
        }
    }
}

/// What happened to one inbound platform event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Enqueued(RequestId),
    Denied(AuthReason),
    Overloaded,
    Closed,
    Command(ChatCommand),
    Ignored,
}

pub struct ChatFrontend {
    platform: Arc<dyn ChatPlatform>,
    authorizer: Arc<dyn Authorizer>,
    queue: Arc<RequestQueue>,
    localization: Arc<Localization>,
    ids: Arc<RequestIdGenerator>,
    settings: FrontendSettings,
}

impl ChatFrontend {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        authorizer: Arc<dyn Authorizer>,
        queue: Arc<RequestQueue>,
        localization: Arc<Localization>,
        ids: Arc<RequestIdGenerator>,
        settings: FrontendSettings,
    ) -> Self {
        Self {
            platform,
            authorizer,
            queue,
            localization,
            ids,
            settings,
        }
    }

    /// Pulls platform events until `stop` fires or the platform closes its
    /// stream. A closed stream cancels `stop` so the rest of the process
    /// winds down too.
    #[tracing::instrument(level = "info", skip_all, fields(platform = %self.platform.platform_id()))]
    pub async fn run_ingestion(self: Arc<Self>, stop: CancellationToken) {
        tracing::info!("ingestion loop started");
        loop {
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = self.platform.receive_event() => received,
            };

            match received {
                Ok(Some(event)) => {
                    let outcome = self.handle_event(event).await;
                    tracing::debug!(?outcome, "event handled");
                }
                Ok(None) => {
                    tracing::info!("platform event stream ended");
                    stop.cancel();
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "receive_event failed");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_PAUSE) => {}
                    }
                }
            }
        }
        tracing::info!("ingestion loop stopped");
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(sender = %event.sender_id, chat = %event.chat_id, message = %event.message_id)
    )]
    pub async fn handle_event(&self, event: PlatformEvent) -> IngestOutcome {
        let text = event.text.trim();
        if text.is_empty() {
            return IngestOutcome::Ignored;
        }
        let origin = event.origin();
        let locale = event.locale.as_deref();

        let decision = self.authorizer.authorize(event.sender_id.as_str());
        if !decision.allowed {
            let key = match &decision.reason {
                AuthReason::Unavailable(detail) => {
                    tracing::warn!(identity = %decision.identity, %detail, "authorizer unavailable; request denied");
                    MessageKey::Unavailable
                }
                reason => {
                    tracing::info!(identity = %decision.identity, %reason, "request denied");
                    MessageKey::Denied
                }
            };
            let notice = self.localization.render(
                key,
                locale,
                &[("user_id", event.sender_id.to_string())],
            );
            self.send_notice(&origin, &notice).await;
            return IngestOutcome::Denied(decision.reason);
        }

        if let Some(command) = ChatCommand::parse(text) {
            self.answer_command(&origin, locale, command).await;
            return IngestOutcome::Command(command);
        }

        let request = Request::new(
            self.ids.next_id(),
            origin.clone(),
            Payload {
                text: text.to_string(),
                sender_id: event.sender_id.clone(),
                locale: event.locale.clone(),
            },
        );
        let request_id = request.id;

        match self.queue.enqueue(request) {
            Ok(()) => {
                let depth = self.queue.len();
                tracing::info!(request_id = %request_id, %origin, depth, state = "queued", "request enqueued");
                if self.settings.ack_enqueued {
                    let notice = self.localization.render(
                        MessageKey::Queued,
                        locale,
                        &[("position", depth.to_string())],
                    );
                    self.send_notice(&origin, &notice).await;
                }
                IngestOutcome::Enqueued(request_id)
            }
            Err(QueueError::Full { capacity, .. }) => {
                tracing::warn!(request_id = %request_id, %origin, capacity, "queue full; request rejected");
                let notice = self.localization.render(MessageKey::Overloaded, locale, &[]);
                self.send_notice(&origin, &notice).await;
                IngestOutcome::Overloaded
            }
            Err(QueueError::Closed { .. }) => {
                tracing::info!(request_id = %request_id, %origin, "queue closed; request rejected");
                let notice = self.localization.render(MessageKey::Unavailable, locale, &[]);
                self.send_notice(&origin, &notice).await;
                IngestOutcome::Closed
            }
        }
    }

    async fn answer_command(&self, origin: &OriginContext, locale: Option<&str>, command: ChatCommand) {
        let reply = match command {
            ChatCommand::Start => self.localization.render(MessageKey::Start, locale, &[]),
            ChatCommand::Help | ChatCommand::Unknown => {
                self.localization.render(MessageKey::Help, locale, &[])
            }
            ChatCommand::Queue => {
                let capacity = match self.queue.capacity() {
                    0 => "unbounded".to_string(),
                    n => n.to_string(),
                };
                self.localization.render(
                    MessageKey::QueueStatus,
                    locale,
                    &[("depth", self.queue.len().to_string()), ("capacity", capacity)],
                )
            }
        };
        tracing::debug!(?command, %origin, "command answered");
        self.send_notice(origin, &reply).await;
    }

    /// Single-attempt delivery for notices sent from the ingestion loop.
    async fn send_notice(&self, origin: &OriginContext, text: &str) {
        if let Err(e) = self.platform.send_reply(origin, text).await {
            tracing::warn!(%origin, error = %e, "notice delivery failed");
        }
    }

    /// Delivers every response until all senders are dropped and the
    /// channel is drained.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_replies(self: Arc<Self>, mut replies: mpsc::Receiver<Response>) {
        tracing::info!("reply loop started");
        let mut delivered = 0u64;
        let mut lost = 0u64;
        while let Some(response) = replies.recv().await {
            if self.deliver_response(&response).await {
                delivered += 1;
            } else {
                lost += 1;
            }
        }
        tracing::info!(delivered, lost, "reply loop stopped");
    }

    /// Sends the completion (or a localized failure notice) back to the
    /// request's origin. Returns false if the reply was lost.
    pub async fn deliver_response(&self, response: &Response) -> bool {
        let text = match &response.result {
            Ok(text) => text.clone(),
            Err(kind) => {
                tracing::debug!(request_id = %response.request_id, failure = %kind, "sending failure notice");
                self.localization
                    .render(kind.message_key(), response.locale.as_deref(), &[])
            }
        };

        let chunks = split_message(&text, self.platform.max_message_chars());
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            if let Err(e) = self.send_with_retry(&response.origin, chunk).await {
                tracing::error!(
                    request_id = %response.request_id,
                    origin = %response.origin,
                    chunk = index + 1,
                    chunks = total,
                    error = %e,
                    "reply lost"
                );
                return false;
            }
        }
        tracing::info!(
            request_id = %response.request_id,
            origin = %response.origin,
            success = response.is_success(),
            attempts = response.attempts,
            chunks = total,
            "reply delivered"
        );
        true
    }

    async fn send_with_retry(&self, origin: &OriginContext, text: &str) -> Result<(), DeliveryError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.platform.send_reply(origin, text).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.settings.delivery_attempts => {
                    let delay = self.settings.delivery_backoff.saturating_mul(attempt);
                    tracing::warn!(%origin, attempt, delay_ms = delay.as_millis() as u64, error = %e, "delivery failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
