use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ExecutorConfig;

/// Prefix of the daily log files; the appender adds the date.
pub const LOG_FILE_PREFIX: &str = "cellexec.log";

/// Installs the server's subscriber: an ANSI console layer and, when
/// `log_to_file` is set, a daily-rolling file under `log_dir`.
pub fn init_logging(config: &ExecutorConfig) -> Result<()> {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), &config.log_level)?;

    let console_layer = fmt::layer()
        .with_ansi(true)
        .with_target(false);

    let file_layer = if config.log_to_file {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("Failed to create log directory {}", config.log_dir))?;
        let (writer, guard) = non_blocking(rolling::daily(&config.log_dir, LOG_FILE_PREFIX));
        // Flushes on drop; lives as long as the process
        std::mem::forget(guard);

        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if config.log_to_file {
        info!("Logging initialized - logs will be written to {}/{}.*", config.log_dir, LOG_FILE_PREFIX);
    } else {
        info!("Logging initialized - console only");
    }
    Ok(())
}

/// Console-only logging for short-lived client commands.
pub fn init_cli_logging() {
    let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), "warn")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

/// `rust_log` wins over the configured directives when it is non-empty.
fn build_filter(rust_log: Option<&str>, configured: &str) -> Result<EnvFilter> {
    let directives = match rust_log {
        Some(directives) if !directives.trim().is_empty() => directives,
        _ => configured,
    };
    EnvFilter::try_new(directives).with_context(|| format!("Invalid log filter {directives:?}"))
}
