//! BYO-key LLM client for chatrelay.
//!
//! Pure HTTP client for single-turn chat completions. Errors carry enough
//! classification for callers to decide whether a retry is worthwhile.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
