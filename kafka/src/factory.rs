//! Construction of the four messaging clients.
//!
//! Option builders are pure and return inspectable [`ClientOptionSet`]s;
//! constructors turn them into clients. Unset identity fields default from
//! the [`AppIdentity`]:
//!
//! - client id ← application name
//! - instance id and transactional id ← instance name
//! - consumer group ← application name

use crate::config::{
    KafkaConfig, ReaderManagerConfig, TxWriterClientConfig, WriterClientConfig, WriterConfig,
};
use crate::options::{self, ClientOption, ClientOptionSet, ClientRole};
use crate::source::KafkaSource;
use crate::writer::{SyncWriter, TransactionalWriter};
use crate::KafkaClientError;
use enclave_core::AppIdentity;
use enclave_core::BoxError;
use enclave_core::lifecycle::{Hook, Lifecycle};
use enclave_core::stream::{ErrorCallback, ReaderManager, StreamError, Writer};
use rdkafka::consumer::StreamConsumer;
use rdkafka::producer::FutureProducer;
use std::sync::Arc;

/// Options every client carries: brokers, identity, topic creation.
#[must_use]
pub fn base_options(config: &KafkaConfig, identity: &AppIdentity) -> ClientOptionSet {
    let mut set = ClientOptionSet::new();
    set.push(ClientOption::SeedBrokers(config.brokers.clone()));
    set.push(ClientOption::ClientId(
        config.client_id.clone().unwrap_or_else(|| identity.name().to_string()),
    ));
    set.push(ClientOption::InstanceId(
        config.instance_id.clone().unwrap_or_else(|| identity.instance_name()),
    ));
    if config.allow_auto_topic_creation {
        set.push(ClientOption::AllowAutoTopicCreation);
    }
    set
}

fn producer_options(set: &mut ClientOptionSet, config: &WriterConfig) {
    set.push(ClientOption::RequiredAcks(options::acks(config.required_acks)));
    if !config.batch_compressions.is_empty() {
        set.push(ClientOption::BatchCompression(options::compression(&config.batch_compressions)));
    }
}

/// Options of the plain writer.
#[must_use]
pub fn writer_options(config: &WriterClientConfig, identity: &AppIdentity) -> ClientOptionSet {
    let mut set = base_options(&config.kafka, identity);
    producer_options(&mut set, &config.writer);
    set
}

/// Options of the transactional writer.
#[must_use]
pub fn tx_writer_options(config: &TxWriterClientConfig, identity: &AppIdentity) -> ClientOptionSet {
    let mut set = base_options(&config.kafka, identity);
    producer_options(&mut set, &config.writer);
    set.push(ClientOption::TransactionalId(
        config
            .transactional_id
            .clone()
            .unwrap_or_else(|| identity.instance_name()),
    ));
    set
}

/// Options of a reader manager's consumer.
///
/// A transactional reader always reads committed records, whatever the
/// configured isolation.
#[must_use]
pub fn reader_options(
    config: &ReaderManagerConfig,
    identity: &AppIdentity,
    transactional: bool,
) -> ClientOptionSet {
    let isolation = if transactional {
        options::IsolationPolicy::ReadCommitted
    } else {
        options::isolation_level(config.consumer.fetch_isolation_level)
    };

    let mut set = base_options(&config.kafka, identity);
    set.push(ClientOption::FetchIsolation(isolation));
    set.push(ClientOption::ResetOffset(options::reset_offset(&config.consumer.reset_offset)));
    set.push(ClientOption::ConsumerGroup(
        config
            .group
            .group_id
            .clone()
            .unwrap_or_else(|| identity.name().to_string()),
    ));
    set.extend(options::autocommit(
        config.group.disable_autocommit,
        config.group.autocommit_interval,
    ));
    set
}

fn create_producer(
    set: &ClientOptionSet,
    client: &'static str,
) -> Result<FutureProducer, KafkaClientError> {
    set.to_client_config(ClientRole::Producer)
        .create()
        .map_err(|source| KafkaClientError::Create { client, source })
}

fn register_close(lifecycle: &mut Lifecycle, name: &str, writer: impl Writer + 'static) {
    lifecycle.append(Hook::new(name).on_stop(move |_ctx| async move {
        writer.close().await.map_err(BoxError::from)
    }));
}

/// Create the plain writer and register its stop hook.
///
/// # Errors
///
/// Returns [`KafkaClientError::Create`] if the client rejects its options.
pub fn new_writer(
    config: &WriterClientConfig,
    identity: &AppIdentity,
    lifecycle: &mut Lifecycle,
) -> Result<SyncWriter, KafkaClientError> {
    let set = writer_options(config, identity);
    let producer = create_producer(&set, "kafka writer")?;
    let writer = SyncWriter::new(producer, config.writer.write_timeout);
    register_close(lifecycle, "kafka-writer", writer.clone());

    tracing::info!(
        brokers = ?config.kafka.brokers,
        client_id = set.client_id(),
        acks = config.writer.required_acks,
        "Kafka writer created"
    );
    Ok(writer)
}

/// Create the transactional writer and register its stop hook.
///
/// # Errors
///
/// Returns [`KafkaClientError::Create`] if the client rejects its options.
pub fn new_tx_writer(
    config: &TxWriterClientConfig,
    identity: &AppIdentity,
    lifecycle: &mut Lifecycle,
) -> Result<TransactionalWriter, KafkaClientError> {
    let set = tx_writer_options(config, identity);
    let writer = TransactionalWriter::new(
        create_producer(&set, "kafka transactional writer")?,
        config.writer.write_timeout,
    );
    register_close(lifecycle, "kafka-tx-writer", writer.clone());

    tracing::info!(
        brokers = ?config.kafka.brokers,
        client_id = set.client_id(),
        transactional_id = set.transactional_id(),
        "Kafka transactional writer created"
    );
    Ok(writer)
}

/// Error callback logging every consumption error.
#[must_use]
pub fn log_errors() -> ErrorCallback {
    Arc::new(|error: &StreamError| {
        tracing::error!(error = %error, "Got error from reader manager");
    })
}

fn build_reader_manager(
    config: &ReaderManagerConfig,
    identity: &AppIdentity,
    transactional: bool,
    on_error: ErrorCallback,
) -> Result<ReaderManager, KafkaClientError> {
    let set = reader_options(config, identity, transactional);
    let consumer: StreamConsumer = set
        .to_client_config(ClientRole::Consumer)
        .create()
        .map_err(|source| KafkaClientError::Create {
            client: "kafka reader manager",
            source,
        })?;

    tracing::info!(
        brokers = ?config.kafka.brokers,
        group = set.consumer_group(),
        isolation = ?set.isolation_level(),
        transactional,
        pool_size = config.pool_size,
        "Kafka reader manager created"
    );
    Ok(ReaderManager::new(
        Arc::new(KafkaSource::new(consumer)),
        config.settings(),
        on_error,
    ))
}

/// Create a reader manager whose errors are logged.
///
/// The manager is not started; hand it to
/// [`supervise`](enclave_core::stream::supervise) after registering readers.
///
/// # Errors
///
/// Returns [`KafkaClientError::Create`] if the client rejects its options.
pub fn new_reader_manager(
    config: &ReaderManagerConfig,
    identity: &AppIdentity,
) -> Result<ReaderManager, KafkaClientError> {
    build_reader_manager(config, identity, false, log_errors())
}

/// Like [`new_reader_manager`], reading committed records only.
///
/// # Errors
///
/// Returns [`KafkaClientError::Create`] if the client rejects its options.
pub fn new_tx_reader_manager(
    config: &ReaderManagerConfig,
    identity: &AppIdentity,
) -> Result<ReaderManager, KafkaClientError> {
    build_reader_manager(config, identity, true, log_errors())
}

/// Like [`new_reader_manager`] with a custom error callback.
///
/// # Errors
///
/// Returns [`KafkaClientError::Create`] if the client rejects its options.
pub fn new_reader_manager_with(
    config: &ReaderManagerConfig,
    identity: &AppIdentity,
    transactional: bool,
    on_error: ErrorCallback,
) -> Result<ReaderManager, KafkaClientError> {
    build_reader_manager(config, identity, transactional, on_error)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::options::{AckPolicy, CompressionCodec, IsolationPolicy, OffsetPolicy};
    use enclave_core::FromEnv;
    use enclave_testing::fixtures::{env, identity};
    use std::time::Duration;

    const BROKERS: (&str, &str) = ("KAFKA_BROKERS", "localhost:9092");

    fn reader_config(pairs: &[(&str, &str)]) -> ReaderManagerConfig {
        let mut all = vec![BROKERS];
        all.extend_from_slice(pairs);
        ReaderManagerConfig::from_source(&env(&all)).unwrap()
    }

    #[test]
    fn identity_defaults_from_application() {
        let app = identity("orders-svc");
        let config = TxWriterClientConfig::from_source(&env(&[BROKERS])).unwrap();
        let set = tx_writer_options(&config, &app);

        assert_eq!(set.client_id(), Some("orders-svc"));
        assert_eq!(set.instance_id(), Some("orders-svc-0"));
        assert_eq!(set.transactional_id(), Some(app.instance_name().as_str()));
    }

    #[test]
    fn explicit_identity_wins() {
        let config = TxWriterClientConfig::from_source(&env(&[
            BROKERS,
            ("KAFKA_CLIENT_ID", "orders-client"),
            ("KAFKA_INSTANCE_ID", "orders-a"),
            ("KAFKA_TRANSACTIONAL_ID", "orders-tx"),
        ]))
        .unwrap();
        let set = tx_writer_options(&config, &identity("orders-svc"));

        assert_eq!(set.client_id(), Some("orders-client"));
        assert_eq!(set.instance_id(), Some("orders-a"));
        assert_eq!(set.transactional_id(), Some("orders-tx"));
    }

    #[test]
    fn writer_options_translate_producer_settings() {
        let config = WriterClientConfig::from_source(&env(&[
            BROKERS,
            ("KAFKA_REQUIRED_ACKS", "0"),
            ("KAFKA_BATCH_COMPRESSIONS", "lz4,gzip"),
            ("KAFKA_ALLOW_AUTO_TOPIC_CREATION", "true"),
        ]))
        .unwrap();
        let set = writer_options(&config, &identity("orders-svc"));
        let options: Vec<_> = set.iter().cloned().collect();

        assert!(options.contains(&ClientOption::RequiredAcks(AckPolicy::None)));
        assert!(options.contains(&ClientOption::BatchCompression(vec![
            CompressionCodec::Lz4,
            CompressionCodec::Gzip
        ])));
        assert!(options.contains(&ClientOption::AllowAutoTopicCreation));
        assert_eq!(set.transactional_id(), None);

        let client = set.to_client_config(ClientRole::Producer);
        assert_eq!(client.get("acks"), Some("0"));
        assert_eq!(client.get("compression.codec"), Some("lz4"));
        assert_eq!(client.get("allow.auto.create.topics"), Some("true"));
    }

    #[test]
    fn compression_is_omitted_when_unset() {
        let config = WriterClientConfig::from_source(&env(&[BROKERS])).unwrap();
        let set = writer_options(&config, &identity("orders-svc"));
        assert!(!set.iter().any(|option| matches!(option, ClientOption::BatchCompression(_))));
        let acks = ClientOption::RequiredAcks(AckPolicy::AllInSync);
        assert!(set.iter().any(|option| *option == acks));
    }

    #[test]
    fn transactional_reader_forces_read_committed() {
        let config = reader_config(&[("KAFKA_FETCH_ISOLATION_LEVEL", "0")]);
        let app = identity("orders-svc");

        assert_eq!(
            reader_options(&config, &app, false).isolation_level(),
            Some(IsolationPolicy::ReadUncommitted)
        );
        let set = reader_options(&config, &app, true);
        assert_eq!(set.isolation_level(), Some(IsolationPolicy::ReadCommitted));
        assert_eq!(
            set.to_client_config(ClientRole::Consumer).get("isolation.level"),
            Some("read_committed")
        );
    }

    #[test]
    fn reader_group_defaults_to_application_name() {
        let app = identity("orders-svc");
        let set = reader_options(&reader_config(&[]), &app, false);
        assert_eq!(set.consumer_group(), Some("orders-svc"));
        let reset = ClientOption::ResetOffset(OffsetPolicy::Committed);
        assert!(set.iter().any(|option| *option == reset));
        assert!(set.iter().any(|option| *option == ClientOption::DisableAutoCommit));
        assert!(
            set.iter()
                .any(|option| *option == ClientOption::AutoCommitInterval(Duration::from_secs(5)))
        );

        let config = reader_config(&[("KAFKA_CONSUMER_GROUP_ID", "orders-readers")]);
        let set = reader_options(&config, &app, false);
        assert_eq!(set.consumer_group(), Some("orders-readers"));
    }

    #[test]
    fn autocommit_enabled_keeps_only_the_interval() {
        let set = reader_options(
            &reader_config(&[
                ("KAFKA_DISABLE_AUTOCOMMIT", "false"),
                ("KAFKA_AUTOCOMMIT_INTERVAL", "1s"),
            ]),
            &identity("orders-svc"),
            false,
        );
        let client = set.to_client_config(ClientRole::Consumer);
        assert_eq!(client.get("enable.auto.commit"), None);
        assert_eq!(client.get("auto.commit.interval.ms"), Some("1000"));
    }
}
