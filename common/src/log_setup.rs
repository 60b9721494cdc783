use std::path::Path;
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("Invalid log filter: {0}")]
    Filter(String),
    #[error("Failed to create log directory {dir}: {source}")]
    Directory {
        dir: String,
        source: std::io::Error,
    },
    #[error("Failed to create log file appender: {0}")]
    Appender(String),
    #[error("Logging already initialized")]
    AlreadyInitialized,
}

/// Installs the global subscriber: console output plus a daily rolling file
/// under `log_dir` named `{file_prefix}.*.log`.
///
/// `RUST_LOG` takes precedence over `base_level` when set.
pub fn setup_logging(base_level: &str, log_dir: &Path, file_prefix: &str) -> Result<(), LogSetupError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(base_level))
        .map_err(|e| LogSetupError::Filter(e.to_string()))?;

    std::fs::create_dir_all(log_dir).map_err(|source| LogSetupError::Directory {
        dir: log_dir.display().to_string(),
        source,
    })?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(file_prefix)
        .filename_suffix("log")
        .max_log_files(5)
        .build(log_dir)
        .map_err(|e| LogSetupError::Appender(e.to_string()))?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD
        .set(guard)
        .map_err(|_| LogSetupError::AlreadyInitialized)?;

    let console_writer = std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .with_writer(console_writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LogSetupError::AlreadyInitialized)
}
