//! Chat-platform adapters for chatrelay.
//!
//! Adapters are pure I/O: they turn platform updates into `PlatformEvent`s
//! and deliver reply text back to an `OriginContext`.

mod error;
mod telegram;
mod traits;
mod types;

pub use error::DeliveryError;
pub use telegram::TelegramAdapter;
pub use traits::ChatPlatform;
pub use types::{ChatId, MessageId, OriginContext, PlatformEvent, SenderId, split_message};
