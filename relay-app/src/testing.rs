//! In-memory collaborators shared by the unit tests.

use crate::backend::{BackendError, CompletionBackend};
use crate::request::{Payload, Request, RequestId};
use async_trait::async_trait;
use chrono::Utc;
use relay_channels::{
    ChatId, ChatPlatform, DeliveryError, MessageId, OriginContext, PlatformEvent, SenderId,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

pub const PLATFORM_ID: &str = "fake";

pub fn origin(chat: &str) -> OriginContext {
    OriginContext {
        platform_id: PLATFORM_ID.to_string(),
        chat_id: ChatId::from(chat),
        reply_to: None,
    }
}

pub fn request(id: u64, chat: &str, text: &str) -> Request {
    Request::new(
        RequestId::new(id),
        origin(chat),
        Payload {
            text: text.to_string(),
            sender_id: SenderId::from(chat),
            locale: None,
        },
    )
}

pub fn event(message_id: u64, sender: &str, text: &str) -> PlatformEvent {
    PlatformEvent {
        platform_id: PLATFORM_ID.to_string(),
        message_id: MessageId::new(message_id.to_string()),
        chat_id: ChatId::from(sender),
        sender_id: SenderId::from(sender),
        is_group: false,
        locale: None,
        text: text.to_string(),
        received_at: Utc::now(),
    }
}

pub struct FakePlatform {
    inbound: Mutex<Option<mpsc::UnboundedSender<PlatformEvent>>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<PlatformEvent>>,
    sent: Mutex<Vec<(OriginContext, String)>>,
    delivery_failures: Mutex<VecDeque<DeliveryError>>,
    send_attempts: AtomicUsize,
    max_chars: usize,
}

impl FakePlatform {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inbound: Mutex::new(Some(tx)),
            events: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            delivery_failures: Mutex::new(VecDeque::new()),
            send_attempts: AtomicUsize::new(0),
            max_chars: 4096,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn inject(&self, event: PlatformEvent) {
        if let Some(tx) = self.inbound.lock().expect("inbound lock").as_ref() {
            tx.send(event).expect("platform receiver alive");
        }
    }

    /// Ends the event stream once already injected events are consumed.
    pub fn close(&self) {
        self.inbound.lock().expect("inbound lock").take();
    }

    /// The next `send_reply` calls fail with these errors, in order.
    pub fn fail_deliveries(&self, errors: impl IntoIterator<Item = DeliveryError>) {
        self.delivery_failures
            .lock()
            .expect("failures lock")
            .extend(errors);
    }

    pub fn sent(&self) -> Vec<(OriginContext, String)> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` messages were delivered.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<(OriginContext, String)> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} delivered messages, got {sent:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ChatPlatform for FakePlatform {
    fn platform_id(&self) -> &str {
        PLATFORM_ID
    }

    async fn receive_event(&self) -> anyhow::Result<Option<PlatformEvent>> {
        Ok(self.events.lock().await.recv().await)
    }

    async fn send_reply(&self, origin: &OriginContext, text: &str) -> Result<(), DeliveryError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .delivery_failures
            .lock()
            .expect("failures lock")
            .pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((origin.clone(), text.to_string()));
        Ok(())
    }

    fn max_message_chars(&self) -> usize {
        self.max_chars
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Echo,
    Retryable,
    Terminal,
    Hang,
}

pub struct FakeBackend {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    calls: AtomicU32,
}

impl FakeBackend {
    pub fn new(fallback: Step) -> Self {
        Self::scripted([], fallback)
    }

    pub fn scripted(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for FakeBackend {
    async fn complete(&self, payload: &Payload, _timeout: Duration) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match step {
            Step::Reply(text) => Ok(text),
            Step::Echo => Ok(format!("echo: {}", payload.text)),
            Step::Retryable => Err(BackendError::Retryable("HTTP 503".to_string())),
            Step::Terminal => Err(BackendError::Terminal("HTTP 400".to_string())),
            Step::Hang => std::future::pending().await,
        }
    }
}
