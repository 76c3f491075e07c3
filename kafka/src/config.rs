//! Kafka configuration read from `KAFKA_*` variables.
//!
//! Each client variant reads the groups it needs:
//!
//! | Variant | Groups |
//! |---|---|
//! | writer | [`KafkaConfig`], [`WriterConfig`] |
//! | transactional writer | the writer groups plus `KAFKA_TRANSACTIONAL_ID` |
//! | reader manager | [`KafkaConfig`], [`ConsumerConfig`], [`ConsumerGroupConfig`], loop tuning |

use enclave_core::config::{ConfigError, EnvReader, FromEnv};
use enclave_core::stream::ReaderSettings;
use std::time::Duration;

/// Compression names accepted in `KAFKA_BATCH_COMPRESSIONS`.
pub const COMPRESSIONS: &[&str] = &["gzip", "snappy", "lz4", "zstd", "none"];

/// Reset policies accepted in `KAFKA_RESET_OFFSET`.
pub const RESET_OFFSETS: &[&str] = &["earliest", "latest", "committed"];

const MAX_GROUP_ID_LEN: usize = 255;

/// Settings shared by every client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    /// Seed brokers (`KAFKA_BROKERS`, required)
    pub brokers: Vec<String>,
    /// Client id (`KAFKA_CLIENT_ID`), defaults to the application name
    pub client_id: Option<String>,
    /// Static membership id (`KAFKA_INSTANCE_ID`), defaults to the instance name
    pub instance_id: Option<String>,
    /// Let brokers create unknown topics (`KAFKA_ALLOW_AUTO_TOPIC_CREATION`)
    pub allow_auto_topic_creation: bool,
}

impl FromEnv for KafkaConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        let raw = env.required("KAFKA_BROKERS")?;
        let brokers = env.list("KAFKA_BROKERS");
        if brokers.iter().any(String::is_empty) {
            return Err(ConfigError::invalid("KAFKA_BROKERS", raw, "empty broker address"));
        }

        Ok(Self {
            brokers,
            client_id: env.string("KAFKA_CLIENT_ID"),
            instance_id: env.string("KAFKA_INSTANCE_ID"),
            allow_auto_topic_creation: env.bool_or("KAFKA_ALLOW_AUTO_TOPIC_CREATION", false)?,
        })
    }
}

/// Producer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// `KAFKA_REQUIRED_ACKS`: `-1`, `0` or `1`
    pub required_acks: i16,
    /// `KAFKA_BATCH_COMPRESSIONS`, in preference order
    pub batch_compressions: Vec<String>,
    /// `KAFKA_WRITE_TIMEOUT`: how long a write waits for acknowledgement
    pub write_timeout: Duration,
}

impl FromEnv for WriterConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        let required_acks: i16 = env.parse_or("KAFKA_REQUIRED_ACKS", -1)?;
        if !(-1..=1).contains(&required_acks) {
            return Err(ConfigError::invalid(
                "KAFKA_REQUIRED_ACKS",
                required_acks,
                "expected -1, 0 or 1",
            ));
        }

        let batch_compressions = env.list("KAFKA_BATCH_COMPRESSIONS");
        if let Some(unknown) = batch_compressions
            .iter()
            .find(|name| !COMPRESSIONS.contains(&name.as_str()))
        {
            return Err(ConfigError::invalid(
                "KAFKA_BATCH_COMPRESSIONS",
                unknown,
                format!("expected one of {}", COMPRESSIONS.join(", ")),
            ));
        }

        Ok(Self {
            required_acks,
            batch_compressions,
            write_timeout: env.duration_or("KAFKA_WRITE_TIMEOUT", Duration::from_secs(5))?,
        })
    }
}

/// Fetch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// `KAFKA_RESET_OFFSET`: `earliest`, `latest` or `committed`
    pub reset_offset: String,
    /// `KAFKA_FETCH_ISOLATION_LEVEL`: `0` (uncommitted) or `1` (committed)
    pub fetch_isolation_level: i8,
}

impl FromEnv for ConsumerConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        let reset_offset = env.string_or("KAFKA_RESET_OFFSET", "committed");
        if !RESET_OFFSETS.contains(&reset_offset.as_str()) {
            return Err(ConfigError::invalid(
                "KAFKA_RESET_OFFSET",
                &reset_offset,
                format!("expected one of {}", RESET_OFFSETS.join(", ")),
            ));
        }

        let fetch_isolation_level: i8 = env.parse_or("KAFKA_FETCH_ISOLATION_LEVEL", 0)?;
        if !(0..=1).contains(&fetch_isolation_level) {
            return Err(ConfigError::invalid(
                "KAFKA_FETCH_ISOLATION_LEVEL",
                fetch_isolation_level,
                "expected 0 or 1",
            ));
        }

        Ok(Self {
            reset_offset,
            fetch_isolation_level,
        })
    }
}

/// Consumer group settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupConfig {
    /// `KAFKA_CONSUMER_GROUP_ID`, defaults to the application name
    pub group_id: Option<String>,
    /// `KAFKA_DISABLE_AUTOCOMMIT`
    pub disable_autocommit: bool,
    /// `KAFKA_AUTOCOMMIT_INTERVAL`
    pub autocommit_interval: Duration,
}

impl FromEnv for ConsumerGroupConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        let group_id = env.string("KAFKA_CONSUMER_GROUP_ID");
        if let Some(id) = &group_id {
            if id.len() > MAX_GROUP_ID_LEN {
                return Err(ConfigError::invalid(
                    "KAFKA_CONSUMER_GROUP_ID",
                    id,
                    format!("longer than {MAX_GROUP_ID_LEN} characters"),
                ));
            }
        }

        Ok(Self {
            group_id,
            disable_autocommit: env.bool_or("KAFKA_DISABLE_AUTOCOMMIT", true)?,
            autocommit_interval: env
                .duration_or("KAFKA_AUTOCOMMIT_INTERVAL", Duration::from_secs(5))?,
        })
    }
}

/// Everything a plain writer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterClientConfig {
    /// Shared settings
    pub kafka: KafkaConfig,
    /// Producer settings
    pub writer: WriterConfig,
}

impl FromEnv for WriterClientConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            kafka: KafkaConfig::from_reader(env)?,
            writer: WriterConfig::from_reader(env)?,
        })
    }
}

/// Everything a transactional writer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxWriterClientConfig {
    /// Shared settings
    pub kafka: KafkaConfig,
    /// Producer settings
    pub writer: WriterConfig,
    /// `KAFKA_TRANSACTIONAL_ID`, defaults to the instance name
    pub transactional_id: Option<String>,
}

impl FromEnv for TxWriterClientConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            kafka: KafkaConfig::from_reader(env)?,
            writer: WriterConfig::from_reader(env)?,
            transactional_id: env.string("KAFKA_TRANSACTIONAL_ID"),
        })
    }
}

/// Everything a reader manager needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderManagerConfig {
    /// Shared settings
    pub kafka: KafkaConfig,
    /// Fetch settings
    pub consumer: ConsumerConfig,
    /// Group settings
    pub group: ConsumerGroupConfig,
    /// `KAFKA_POLL_BATCH_SIZE` (at least 1)
    pub poll_batch_size: usize,
    /// `KAFKA_POLL_INTERVAL`
    pub poll_interval: Duration,
    /// `KAFKA_READER_POOL_SIZE` (at least 1)
    pub pool_size: usize,
    /// `KAFKA_READER_HANDLER_TIMEOUT`; zero disables it
    pub handler_timeout: Duration,
}

impl FromEnv for ReaderManagerConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        let defaults = ReaderSettings::default();
        let poll_batch_size = at_least_one(env, "KAFKA_POLL_BATCH_SIZE", defaults.poll_batch_size)?;
        let pool_size = at_least_one(env, "KAFKA_READER_POOL_SIZE", defaults.pool_size)?;

        Ok(Self {
            kafka: KafkaConfig::from_reader(env)?,
            consumer: ConsumerConfig::from_reader(env)?,
            group: ConsumerGroupConfig::from_reader(env)?,
            poll_batch_size,
            poll_interval: env.duration_or("KAFKA_POLL_INTERVAL", defaults.poll_interval)?,
            pool_size,
            handler_timeout: env
                .duration_or("KAFKA_READER_HANDLER_TIMEOUT", defaults.handler_timeout)?,
        })
    }
}

impl ReaderManagerConfig {
    /// Consumption loop tuning.
    #[must_use]
    pub const fn settings(&self) -> ReaderSettings {
        ReaderSettings {
            poll_batch_size: self.poll_batch_size,
            poll_interval: self.poll_interval,
            pool_size: self.pool_size,
            handler_timeout: self.handler_timeout,
        }
    }
}

fn at_least_one(env: &EnvReader<'_>, key: &str, default: usize) -> Result<usize, ConfigError> {
    let value: usize = env.parse_or(key, default)?;
    if value == 0 {
        return Err(ConfigError::invalid(key, value, "must be at least 1"));
    }
    Ok(value)
}
