use crate::error::DeliveryError;
use crate::types::{OriginContext, PlatformEvent};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Unique platform identifier: "telegram".
    fn platform_id(&self) -> &str;

    /// Checks credentials before any loop starts. Errors are fatal at startup.
    async fn verify(&self) -> Result<()> {
        Ok(())
    }

    /// Waits for the next inbound user message.
    ///
    /// Returns `Ok(None)` once the platform will never produce another event.
    /// Implementations must be cancel safe: dropping the future must not lose
    /// an event that was already taken off the platform.
    async fn receive_event(&self) -> Result<Option<PlatformEvent>>;

    /// Delivers one message to the chat identified by `origin`.
    async fn send_reply(&self, origin: &OriginContext, text: &str) -> Result<(), DeliveryError>;

    /// Longest text accepted by a single `send_reply` call, in characters.
    fn max_message_chars(&self) -> usize {
        4096
    }
}
