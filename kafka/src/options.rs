//! Translation of configuration values into Kafka client options.
//!
//! Every translator is total: values it does not recognise map to a safe
//! default instead of an error. Literal validation happens earlier, in
//! [`crate::config`].

use rdkafka::config::ClientConfig;
use std::fmt;
use std::time::Duration;

/// Producer acknowledgement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Fire and forget
    None,
    /// Partition leader only
    Leader,
    /// Every in-sync replica
    AllInSync,
}

impl AckPolicy {
    /// Value of the `acks` client property.
    #[must_use]
    pub const fn config_value(self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::AllInSync => "all",
        }
    }
}

/// Batch compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionCodec {
    /// Uncompressed
    None,
    /// gzip
    Gzip,
    /// Snappy
    Snappy,
    /// LZ4
    Lz4,
    /// Zstandard
    Zstd,
}

impl CompressionCodec {
    /// Value of the `compression.codec` client property.
    #[must_use]
    pub const fn config_value(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Fetch isolation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationPolicy {
    /// Records of open and aborted transactions are visible
    ReadUncommitted,
    /// Only committed transactional records are visible
    ReadCommitted,
}

impl IsolationPolicy {
    /// Value of the `isolation.level` client property.
    #[must_use]
    pub const fn config_value(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "read_uncommitted",
            Self::ReadCommitted => "read_committed",
        }
    }
}

/// Where a consumer starts when it has no usable position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetPolicy {
    /// The committed group position
    Committed,
    /// End of the partition
    Latest,
    /// Start of the partition
    Earliest,
}

impl OffsetPolicy {
    /// Value of the `auto.offset.reset` client property.
    ///
    /// The committed position is always used when one exists, so
    /// `Committed` only decides what happens without one: the consumer
    /// reports an error instead of silently jumping.
    #[must_use]
    pub const fn config_value(self) -> &'static str {
        match self {
            Self::Committed => "error",
            Self::Latest => "latest",
            Self::Earliest => "earliest",
        }
    }
}

/// `0` → none, `-1` → all in-sync replicas, anything else → leader.
#[must_use]
pub const fn acks(value: i16) -> AckPolicy {
    match value {
        0 => AckPolicy::None,
        -1 => AckPolicy::AllInSync,
        _ => AckPolicy::Leader,
    }
}

/// Map each name to its codec, keeping order. Unknown names (including
/// `none`) map to [`CompressionCodec::None`].
#[must_use]
pub fn compression<S: AsRef<str>>(names: &[S]) -> Vec<CompressionCodec> {
    names
        .iter()
        .map(|name| match name.as_ref() {
            "gzip" => CompressionCodec::Gzip,
            "snappy" => CompressionCodec::Snappy,
            "lz4" => CompressionCodec::Lz4,
            "zstd" => CompressionCodec::Zstd,
            _ => CompressionCodec::None,
        })
        .collect()
}

/// `1` → read-committed, anything else → read-uncommitted.
#[must_use]
pub const fn isolation_level(value: i8) -> IsolationPolicy {
    match value {
        1 => IsolationPolicy::ReadCommitted,
        _ => IsolationPolicy::ReadUncommitted,
    }
}

/// `committed` and `latest` map to their policy, anything else to the start
/// of the stream.
#[must_use]
pub fn reset_offset(value: &str) -> OffsetPolicy {
    match value {
        "committed" => OffsetPolicy::Committed,
        "latest" => OffsetPolicy::Latest,
        _ => OffsetPolicy::Earliest,
    }
}

/// Autocommit options: optionally disabled, always with its interval.
#[must_use]
pub fn autocommit(disable: bool, interval: Duration) -> Vec<ClientOption> {
    let mut options = Vec::with_capacity(2);
    if disable {
        options.push(ClientOption::DisableAutoCommit);
    }
    options.push(ClientOption::AutoCommitInterval(interval));
    options
}

/// Kind of client an option set is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    /// Writers
    Producer,
    /// Reader managers
    Consumer,
}

/// One client option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOption {
    /// Bootstrap brokers
    SeedBrokers(Vec<String>),
    /// Client id reported to the brokers
    ClientId(String),
    /// Static group membership id
    InstanceId(String),
    /// Let the brokers create unknown topics
    AllowAutoTopicCreation,
    /// Producer acknowledgements
    RequiredAcks(AckPolicy),
    /// Batch compression, in preference order
    BatchCompression(Vec<CompressionCodec>),
    /// Transactional producer id
    TransactionalId(String),
    /// Fetch isolation
    FetchIsolation(IsolationPolicy),
    /// Start position without a usable committed one
    ResetOffset(OffsetPolicy),
    /// Consumer group
    ConsumerGroup(String),
    /// Disable periodic offset commits
    DisableAutoCommit,
    /// Periodic offset commit interval
    AutoCommitInterval(Duration),
}

impl ClientOption {
    /// Whether the option only means something to consumers.
    #[must_use]
    pub const fn is_consumer_only(&self) -> bool {
        matches!(
            self,
            Self::InstanceId(_)
                | Self::FetchIsolation(_)
                | Self::ResetOffset(_)
                | Self::ConsumerGroup(_)
                | Self::DisableAutoCommit
                | Self::AutoCommitInterval(_)
        )
    }

    fn apply(&self, config: &mut ClientConfig) {
        match self {
            Self::SeedBrokers(brokers) => {
                config.set("bootstrap.servers", brokers.join(","));
            },
            Self::ClientId(id) => {
                config.set("client.id", id);
            },
            Self::InstanceId(id) => {
                config.set("group.instance.id", id);
            },
            Self::AllowAutoTopicCreation => {
                config.set("allow.auto.create.topics", "true");
            },
            Self::RequiredAcks(policy) => {
                config.set("acks", policy.config_value());
            },
            Self::BatchCompression(codecs) => {
                // the client takes a single codec; the first preference wins
                if let Some(codec) = codecs.first() {
                    config.set("compression.codec", codec.config_value());
                }
            },
            Self::TransactionalId(id) => {
                config.set("transactional.id", id);
            },
            Self::FetchIsolation(policy) => {
                config.set("isolation.level", policy.config_value());
            },
            Self::ResetOffset(policy) => {
                config.set("auto.offset.reset", policy.config_value());
            },
            Self::ConsumerGroup(id) => {
                config.set("group.id", id);
            },
            Self::DisableAutoCommit => {
                config.set("enable.auto.commit", "false");
            },
            Self::AutoCommitInterval(interval) => {
                config.set("auto.commit.interval.ms", interval.as_millis().to_string());
            },
        }
    }
}

/// Ordered, inspectable list of client options.
///
/// Later options override earlier ones of the same kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptionSet {
    options: Vec<ClientOption>,
}

impl ClientOptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one option.
    pub fn push(&mut self, option: ClientOption) {
        self.options.push(option);
    }

    /// Options in order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientOption> {
        self.options.iter()
    }

    /// Number of options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Effective fetch isolation.
    #[must_use]
    pub fn isolation_level(&self) -> Option<IsolationPolicy> {
        self.options.iter().rev().find_map(|option| match option {
            ClientOption::FetchIsolation(policy) => Some(*policy),
            _ => None,
        })
    }

    /// Effective client id.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.options.iter().rev().find_map(|option| match option {
            ClientOption::ClientId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Effective static membership id.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.options.iter().rev().find_map(|option| match option {
            ClientOption::InstanceId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Effective transactional id.
    #[must_use]
    pub fn transactional_id(&self) -> Option<&str> {
        self.options.iter().rev().find_map(|option| match option {
            ClientOption::TransactionalId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Effective consumer group.
    #[must_use]
    pub fn consumer_group(&self) -> Option<&str> {
        self.options.iter().rev().find_map(|option| match option {
            ClientOption::ConsumerGroup(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Build the client configuration for `role`.
    ///
    /// Consumer-only options are skipped for producers.
    #[must_use]
    pub fn to_client_config(&self, role: ClientRole) -> ClientConfig {
        let mut config = ClientConfig::new();
        for option in &self.options {
            if role == ClientRole::Producer && option.is_consumer_only() {
                continue;
            }
            option.apply(&mut config);
        }
        config
    }
}

impl Extend<ClientOption> for ClientOptionSet {
    fn extend<T: IntoIterator<Item = ClientOption>>(&mut self, iter: T) {
        self.options.extend(iter);
    }
}

impl FromIterator<ClientOption> for ClientOptionSet {
    fn from_iter<T: IntoIterator<Item = ClientOption>>(iter: T) -> Self {
        Self {
            options: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ClientOptionSet {
    type Item = &'a ClientOption;
    type IntoIter = std::slice::Iter<'a, ClientOption>;

    fn into_iter(self) -> Self::IntoIter {
        self.options.iter()
    }
}

impl fmt::Display for ClientOptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} options", self.options.len())
    }
}
