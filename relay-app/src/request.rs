//! Request/response pairing for the relay engine.

use crate::messages::MessageKey;
use chrono::{DateTime, Utc};
use relay_channels::{OriginContext, SenderId};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing request ids, starting at 1.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub text: String,
    pub sender_id: SenderId,
    pub locale: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub origin: OriginContext,
    pub payload: Payload,
    pub enqueued_at: DateTime<Utc>,
}

impl Request {
    pub fn new(id: RequestId, origin: OriginContext, payload: Payload) -> Self {
        Self {
            id,
            origin,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Why a request produced no completion. Never carries backend diagnostics,
/// those stay in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BackendTerminal,
    RetriesExhausted,
    TimedOut,
    Cancelled,
}

impl FailureKind {
    pub fn message_key(self) -> MessageKey {
        match self {
            Self::BackendTerminal | Self::RetriesExhausted | Self::TimedOut => MessageKey::Error,
            Self::Cancelled => MessageKey::Unavailable,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BackendTerminal => "backend_terminal",
            Self::RetriesExhausted => "retries_exhausted",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub origin: OriginContext,
    pub locale: Option<String>,
    pub result: Result<String, FailureKind>,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl Response {
    pub fn for_request(request: &Request, result: Result<String, FailureKind>, attempts: u32) -> Self {
        Self {
            request_id: request.id,
            origin: request.origin.clone(),
            locale: request.payload.locale.clone(),
            result,
            attempts,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}
