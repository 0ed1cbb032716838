use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChatId);
id_newtype!(SenderId);

/// Everything needed to route a reply back to where the request came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginContext {
    pub platform_id: String,
    pub chat_id: ChatId,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl fmt::Display for OriginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform_id, self.chat_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub platform_id: String,
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: SenderId,
    pub is_group: bool,
    /// IETF language tag reported by the platform, if any.
    #[serde(default)]
    pub locale: Option<String>,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl PlatformEvent {
    pub fn origin(&self) -> OriginContext {
        OriginContext {
            platform_id: self.platform_id.clone(),
            chat_id: self.chat_id.clone(),
            reply_to: Some(self.message_id.clone()),
        }
    }
}

/// Splits `text` into chunks of at most `max_chars` characters, preferring
/// to break after a newline when one falls in the second half of a chunk.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut out = Vec::new();
    let mut rest = text;
    while rest.chars().count() > max_chars {
        let hard_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let head = &rest[..hard_end];
        let split_at = match head.rfind('\n') {
            Some(idx) if head[..idx].chars().count() >= max_chars / 2 => idx + 1,
            _ => hard_end,
        };
        out.push(rest[..split_at].to_string());
        rest = &rest[split_at..];
    }
    if !rest.is_empty() || out.is_empty() {
        out.push(rest.to_string());
    }
    out
}
