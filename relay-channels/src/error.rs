use thiserror::Error;

/// Failure to deliver a reply to the originating chat.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The platform may accept the same message later (network, 429, 5xx).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The platform rejected the message; resending will not help.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
