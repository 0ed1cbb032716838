//! chatrelay configuration loader.
//!
//! `settings.json` is the primary format; a path ending in `.toml` is parsed
//! as TOML instead. Every section except `telegram` and `llm` is optional.

use relay_llm::Provider;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub telegram: TelegramConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Override for the Bot API base URL (self-hosted Bot API servers).
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// `openai`, `anthropic` or `auto` (inferred from the model name).
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_provider() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Every well-formed identity is admitted.
    Open,
    /// Only admins and allow-listed identities are admitted.
    Allowlist,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default = "default_access_mode")]
    pub mode: AccessMode,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    /// Optional file with one identity per line, re-read at most once per `cache_ttl_ms`.
    #[serde(default)]
    pub allowlist_path: Option<PathBuf>,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

fn default_access_mode() -> AccessMode {
    AccessMode::Allowlist
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            mode: default_access_mode(),
            allowed_users: Vec::new(),
            admins: Vec::new(),
            allowlist_path: None,
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// `0` means unbounded.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Total backend invocations per request, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_worker_count() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_attempt_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    180
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontendConfig {
    #[serde(default = "default_delivery_attempts")]
    pub delivery_attempts: u32,
    #[serde(default = "default_delivery_backoff_ms")]
    pub delivery_backoff_ms: u64,
    /// Tell users their queue position right after enqueueing.
    #[serde(default)]
    pub ack_enqueued: bool,
}

fn default_delivery_attempts() -> u32 {
    3
}

fn default_delivery_backoff_ms() -> u64 {
    500
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            delivery_attempts: default_delivery_attempts(),
            delivery_backoff_ms: default_delivery_backoff_ms(),
            ack_enqueued: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Time workers get to publish `Cancelled` replies before their tasks are aborted.
    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_abort_grace_secs() -> u64 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace_secs(),
            abort_grace_secs: default_abort_grace_secs(),
        }
    }
}

impl RelayConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(path, &contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        tracing::info!(
            path = %path.display(),
            model = %cfg.llm.model,
            mode = ?cfg.authorization.mode,
            queue_capacity = cfg.queue.capacity,
            workers = cfg.worker.count,
            "config loaded"
        );
        Ok(cfg)
    }

    fn parse(path: &Path, contents: &str) -> anyhow::Result<Self> {
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Ok(toml::from_str(contents)?)
        } else {
            Ok(serde_json::from_str(contents)?)
        }
    }

    /// Applies environment overrides; `env` is the variable lookup.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CHATRELAY_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        let key_var = match self.provider() {
            Ok(Provider::Anthropic) => "ANTHROPIC_API_KEY",
            _ => "OPENAI_API_KEY",
        };
        if let Some(v) = get(key_var) {
            self.llm.api_key = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "telegram.bot_token is required (or set TELEGRAM_BOT_TOKEN)"
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        self.provider()?;
        if self.api_key().is_none() {
            return Err(anyhow::anyhow!(
                "llm.api_key is required (or set OPENAI_API_KEY / ANTHROPIC_API_KEY)"
            ));
        }
        if self.worker.count == 0 {
            return Err(anyhow::anyhow!("worker.count must be > 0"));
        }
        if self.worker.max_attempts == 0 {
            return Err(anyhow::anyhow!("worker.max_attempts must be > 0"));
        }
        if self.worker.backoff_max_ms < self.worker.backoff_base_ms {
            return Err(anyhow::anyhow!(
                "worker.backoff_max_ms must be >= worker.backoff_base_ms"
            ));
        }
        if self.worker.attempt_timeout_secs == 0 || self.worker.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("worker timeouts must be > 0"));
        }
        if self.frontend.delivery_attempts == 0 {
            return Err(anyhow::anyhow!("frontend.delivery_attempts must be > 0"));
        }
        if self.authorization.mode == AccessMode::Allowlist
            && self.authorization.allowed_users.is_empty()
            && self.authorization.admins.is_empty()
            && self.authorization.allowlist_path.is_none()
        {
            tracing::warn!("authorization.mode is allowlist but no identities are configured");
        }
        Ok(())
    }

    /// Explicit provider, or the one inferred from the model name.
    pub fn provider(&self) -> anyhow::Result<Provider> {
        Ok(Provider::parse(&self.llm.provider)?.unwrap_or_else(|| Provider::detect(&self.llm.model)))
    }

    pub fn api_key(&self) -> Option<&str> {
        self.llm
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.supervisor.shutdown_grace_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.supervisor.abort_grace_secs)
    }
}
