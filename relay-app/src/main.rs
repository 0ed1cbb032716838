//! chatrelay main binary.

mod authorizer;
mod backend;
mod commands;
mod config;
mod frontend;
mod messages;
mod queue;
mod request;
mod server;
mod supervisor;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, Parser)]
#[command(name = "chatrelay", version, about = "Relays chat messages to an AI backend")]
struct Cli {
    /// Settings file (JSON, or TOML when the name ends in `.toml`).
    #[arg(long, env = "CHATRELAY_SETTINGS_FILE", default_value = "settings.json")]
    settings: PathBuf,

    /// Localized user-facing messages.
    #[arg(long, env = "CHATRELAY_MESSAGES_FILE", default_value = "messages.json")]
    messages: PathBuf,

    /// Directory for per-run log files.
    #[arg(long, env = "CHATRELAY_LOGS_DIR", default_value = "logs")]
    logs_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay (default).
    Serve,
    /// Validate settings and messages, then exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_file = init_tracing(&cli.logs_dir)?;
    install_panic_hook();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_file.display(),
        "chatrelay starting"
    );

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(&cli.settings, &cli.messages).await,
        Command::Check => server::check(&cli.settings, &cli.messages).await,
    };
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "chatrelay exited with an error");
    }
    result
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Console output in the format chosen by `CHATRELAY_LOG_FORMAT`, plus a
/// plain-text copy in `<logs_dir>/<timestamp>.log`. Returns the log file path.
fn init_tracing(logs_dir: &Path) -> anyhow::Result<PathBuf> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,chatrelay=debug,relay_app=debug,relay_channels=debug,relay_llm=debug",
        ),
    };
    let log_format = std::env::var("CHATRELAY_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let console: BoxedLayer = match log_format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .boxed(),
        "compact" => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .compact()
            .boxed(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported CHATRELAY_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    };

    std::fs::create_dir_all(logs_dir)
        .map_err(|e| anyhow::anyhow!("create logs dir {}: {e}", logs_dir.display()))?;
    let log_path = logs_dir.join(format!(
        "{}.log",
        chrono::Local::now().format("%Y_%m_%d_%H_%M_%S")
    ));
    let file = File::create(&log_path)
        .map_err(|e| anyhow::anyhow!("create log file {}: {e}", log_path.display()))?;
    let file_layer: BoxedLayer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(Mutex::new(file))
        .boxed();

    tracing_subscriber::registry()
        .with(vec![console, file_layer])
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(log_path)
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
