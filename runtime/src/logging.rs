//! Tracing initialisation.

use enclave_core::config::{ConfigError, EnvReader, FromEnv};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Output format of log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per record
    Json,
    /// Human-readable lines
    Text,
}

/// Logging settings.
///
/// | Key | Default |
/// |---|---|
/// | `RUST_LOG` | `info` |
/// | `LOG_FORMAT` | `json` (`json` or `text`) |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives
    pub filter: String,
    /// Record format
    pub format: LogFormat,
}

impl FromEnv for LoggingConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        let filter = env.string_or("RUST_LOG", "info");
        EnvFilter::try_new(&filter)
            .map_err(|e| ConfigError::invalid("RUST_LOG", &filter, e.to_string()))?;

        let format = match env.string_or("LOG_FORMAT", "json").to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => return Err(ConfigError::invalid("LOG_FORMAT", other, "expected json or text")),
        };

        Ok(Self { filter, format })
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed; the existing one
/// is kept.
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init().is_ok(),
        LogFormat::Text => registry.with(fmt::layer()).try_init().is_ok(),
    };

    if installed {
        tracing::debug!(filter = %config.filter, format = ?config.format, "Logging initialised");
    } else {
        tracing::debug!("Global tracing subscriber already initialised, keeping it");
    }
    installed
}

/// Load `.env` into the process environment, if present.
///
/// Runs before logging exists, so the outcome is returned for the caller to
/// log with [`log_dotenv`].
pub fn load_dotenv() -> Result<Option<PathBuf>, dotenvy::Error> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Log the outcome of [`load_dotenv`].
pub fn log_dotenv(outcome: &Result<Option<PathBuf>, dotenvy::Error>) {
    match outcome {
        Ok(Some(path)) => tracing::info!(path = %path.display(), "Loaded environment file"),
        Ok(None) => tracing::debug!("No environment file found"),
        Err(e) => tracing::warn!(error = %e, "Failed to load environment file"),
    }
}
