//! Kafka messaging clients for Enclave applications.
//!
//! This crate derives the four messaging clients from `KAFKA_*`
//! configuration and the application identity:
//!
//! | Variant | Constructor | Client |
//! |---|---|---|
//! | writer | [`new_writer`] | [`SyncWriter`] |
//! | transactional writer | [`new_tx_writer`] | [`TransactionalWriter`] |
//! | reader manager | [`new_reader_manager`] | reader manager over [`KafkaSource`] |
//! | transactional reader manager | [`new_tx_reader_manager`] | same, read-committed |
//!
//! Configuration values pass through the translators of [`options`] before
//! reaching the client, so the effective option set can be inspected with
//! [`writer_options`], [`tx_writer_options`] and [`reader_options`].
//!
//! # Delivery
//!
//! - **At-least-once**: positions are committed after the handler ran
//! - **Ordering within partition**: one lane per topic partition
//! - **Consumer groups**: instances of an application share the partitions
//!
//! # Example
//!
//! ```no_run
//! use enclave_core::{AppIdentity, FromEnv, Lifecycle};
//! use enclave_core::stream::{Message, Writer};
//! use enclave_kafka::{WriterClientConfig, new_writer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut lifecycle = Lifecycle::new();
//! let identity = AppIdentity::new("orders-svc", "0");
//! let writer = new_writer(&WriterClientConfig::from_env()?, &identity, &mut lifecycle)?;
//! writer.write(&[Message::new("orders.placed", b"{}".to_vec())]).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod factory;
pub mod options;
pub mod source;
pub mod writer;

pub use config::{
    ConsumerConfig, ConsumerGroupConfig, KafkaConfig, ReaderManagerConfig, TxWriterClientConfig,
    WriterClientConfig, WriterConfig,
};
pub use factory::{
    base_options, log_errors, new_reader_manager, new_reader_manager_with, new_tx_reader_manager,
    new_tx_writer, new_writer, reader_options, tx_writer_options, writer_options,
};
pub use options::{ClientOption, ClientOptionSet, ClientRole};
pub use source::KafkaSource;
pub use writer::{SyncWriter, TransactionalWriter};

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors raised while constructing clients.
#[derive(Error, Debug)]
pub enum KafkaClientError {
    /// The client library rejected the options.
    #[error("failed to create {client}: {source}")]
    Create {
        /// Variant being created
        client: &'static str,
        /// Client library error
        #[source]
        source: KafkaError,
    },
}
