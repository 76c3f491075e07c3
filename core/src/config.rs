//! Environment-based configuration loading.
//!
//! Every resource in an Enclave application is configured from plain
//! key/value environment settings. This module provides the small reader used
//! by all configuration structs:
//!
//! - [`EnvSource`]: where values come from (the process environment, or a map in tests)
//! - [`EnvReader`]: typed accessors with defaults and attributable errors
//! - [`FromEnv`]: implemented by every configuration struct
//!
//! Configuration is read once at startup. A malformed or out-of-range value is
//! a [`ConfigError`] naming the offending key, and it is reported before any
//! resource is constructed.
//!
//! # Example
//!
//! ```
//! use enclave_core::config::{EnvReader, FromEnv, ConfigError};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! struct PollConfig {
//!     interval: Duration,
//! }
//!
//! impl FromEnv for PollConfig {
//!     fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
//!         Ok(Self {
//!             interval: env.duration_or("POLL_INTERVAL", Duration::from_millis(500))?,
//!         })
//!     }
//! }
//!
//! let source = HashMap::from([("POLL_INTERVAL".to_string(), "2s".to_string())]);
//! let config = PollConfig::from_source(&source).unwrap();
//! assert_eq!(config.interval, Duration::from_secs(2));
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is not present.
    #[error("missing required setting {key}")]
    Missing {
        /// The environment key
        key: String,
    },

    /// A setting is present but malformed or out of range.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// The environment key
        key: String,
        /// The raw value
        value: String,
        /// Why the value was rejected
        reason: String,
    },
}

impl ConfigError {
    /// Build an [`ConfigError::Invalid`] error.
    pub fn invalid(key: &str, value: impl Display, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// The environment key this error refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Missing { key } | Self::Invalid { key, .. } => key,
        }
    }
}

/// A source of configuration values.
pub trait EnvSource: Send + Sync {
    /// Look up a raw value.
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Typed accessors over an [`EnvSource`].
///
/// Empty values are treated as unset, so `KAFKA_CLIENT_ID=` behaves like an
/// absent key and falls back to its default.
#[derive(Clone, Copy)]
pub struct EnvReader<'a> {
    source: &'a dyn EnvSource,
}

impl<'a> EnvReader<'a> {
    /// Create a reader over the given source.
    #[must_use]
    pub fn new(source: &'a dyn EnvSource) -> Self {
        Self { source }
    }

    /// Optional string value (trimmed, empty treated as unset).
    #[must_use]
    pub fn string(&self, key: &str) -> Option<String> {
        self.source
            .var(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// String value with a default.
    #[must_use]
    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    /// Required string value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the key is unset or empty.
    pub fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.string(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
        })
    }

    /// Parse an optional value with [`FromStr`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value does not parse.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| ConfigError::invalid(key, &raw, e.to_string()))
            })
            .transpose()
    }

    /// Parse a value with [`FromStr`], falling back to `default` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value does not parse.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Boolean value with a default.
    ///
    /// Accepts `true/false`, `1/0`, `yes/no`, `on/off` (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for any other literal.
    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.string(key) else {
            return Ok(default);
        };
        match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
        }
    }

    /// Optional duration value (see [`parse_duration`]).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value is not a duration.
    pub fn duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        self.string(key)
            .map(|raw| {
                parse_duration(&raw).map_err(|reason| ConfigError::invalid(key, &raw, reason))
            })
            .transpose()
    }

    /// Duration value with a default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value is not a duration.
    pub fn duration_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self.duration(key)?.unwrap_or(default))
    }

    /// Comma-separated list; empty entries are kept so callers can reject them.
    #[must_use]
    pub fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default()
    }
}

/// Configuration structs loadable from the environment.
pub trait FromEnv: Sized {
    /// Read the configuration through a reader.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing or invalid settings.
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError>;

    /// Read the configuration from an arbitrary source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing or invalid settings.
    fn from_source(source: &dyn EnvSource) -> Result<Self, ConfigError> {
        Self::from_reader(&EnvReader::new(source))
    }

    /// Read the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing or invalid settings.
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }
}

/// Parse a duration in Go notation (`500ms`, `5s`, `1m30s`, `2h`).
///
/// Supported units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. A bare integer is
/// read as seconds. Negative durations are rejected.
///
/// # Errors
///
/// Returns a description of the problem when the input is malformed.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if input.starts_with('-') {
        return Err("duration must not be negative".to_string());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in {input:?}"))?;
        if number_len == 0 {
            return Err(format!("expected a number in {input:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("bad number in {input:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit: f64 = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            other => return Err(format!("unknown unit {other:?} in {input:?}")),
        };
        rest = &rest[unit_len..];

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // value is non-negative
        let nanos = (value * nanos_per_unit).round() as u64;
        total = total
            .checked_add(Duration::from_nanos(nanos))
            .ok_or_else(|| format!("duration overflow in {input:?}"))?;
    }
    Ok(total)
}
