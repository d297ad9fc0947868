//! Tracing setup: human-readable stderr plus an optional JSON-lines file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;
use crate::error::ConfigError;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `config.filter`. When `config.json_dir` is set,
/// events are also written as JSON lines to a daily-rotated file there; the
/// returned guard flushes that file and must be kept alive.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| ConfigError::InvalidValue {
            key: "ASSIST_RUNNER_LOG".to_string(),
            message: e.to_string(),
        })?;

    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file, guard) = match &config.json_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.json_file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(guard)
}
