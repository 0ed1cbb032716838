//! chatrelay entry points: `serve` runs the relay, `check` validates setup.

use crate::authorizer::{AllowListAuthorizer, Authorizer};
use crate::backend::LlmBackend;
use crate::config::RelayConfig;
use crate::messages::Localization;
use crate::supervisor::{Components, ProcessSupervisor, SupervisorSettings};
use anyhow::Result;
use relay_channels::{ChatPlatform, TelegramAdapter};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn serve(settings_path: &Path, messages_path: &Path) -> Result<()> {
    let cfg = RelayConfig::load(settings_path).await?;
    let localization = Arc::new(load_localization(messages_path).await?);

    let platform = Arc::new(build_telegram(&cfg)?);
    platform.verify().await?;
    tracing::info!(platform = %platform.platform_id(), "chat platform verified");

    let backend = Arc::new(LlmBackend::from_config(&cfg)?);
    let authorizer = Arc::new(AllowListAuthorizer::from_config(&cfg.authorization));

    let supervisor = ProcessSupervisor::start(
        Components {
            platform,
            authorizer,
            backend,
            localization,
        },
        SupervisorSettings::from_config(&cfg),
    )?;

    shutdown_signal(supervisor.stop_token()).await;
    let report = supervisor.shutdown().await;
    if !report.drained {
        tracing::warn!(aborted = ?report.aborted_tasks, "some requests were cancelled during shutdown");
    }
    tracing::info!("chatrelay stopped");
    Ok(())
}

/// Loads and validates config and messages without connecting anywhere.
pub async fn check(settings_path: &Path, messages_path: &Path) -> Result<()> {
    let cfg = RelayConfig::load(settings_path).await?;
    let localization = load_localization(messages_path).await?;
    let authorizer = AllowListAuthorizer::from_config(&cfg.authorization);
    authorizer.ready()?;
    build_telegram(&cfg)?;
    LlmBackend::from_config(&cfg)?;

    println!("settings: {}", settings_path.display());
    println!("  provider: {:?}", cfg.provider()?);
    println!("  model: {}", cfg.llm.model);
    println!("  authorization: {:?}", authorizer.mode());
    println!("  queue capacity: {}", cfg.queue.capacity);
    println!("  workers: {}", cfg.worker.count);
    println!("  max attempts: {}", cfg.worker.max_attempts);
    println!("messages: {}", messages_path.display());
    println!("  locales: {}", localization.locale_names().join(", "));
    println!("ok");
    Ok(())
}

fn build_telegram(cfg: &RelayConfig) -> Result<TelegramAdapter> {
    let mut adapter = TelegramAdapter::new(&cfg.telegram.bot_token)?;
    if let Some(api_base) = &cfg.telegram.api_base {
        adapter = adapter.with_api_base(api_base.clone());
    }
    Ok(adapter)
}

/// A missing messages file falls back to the built-in English texts; an
/// unreadable or malformed one is fatal.
async fn load_localization(path: &Path) -> Result<Localization> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        tracing::warn!(path = %path.display(), "messages file not found; using built-in texts");
        return Ok(Localization::builtin());
    }
    Localization::load(path).await
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(ctrlc_err) = result {
                            tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {
                tracing::warn!("relay requested shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {
                tracing::warn!("relay requested shutdown");
            }
        }
    }
    shutdown.cancel();
}
