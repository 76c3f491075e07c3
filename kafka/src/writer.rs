//! `rdkafka`-backed writers.

use async_trait::async_trait;
use enclave_core::stream::{Message, StreamError, Writer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

async fn send(
    producer: &FutureProducer,
    message: &Message,
    timeout: Duration,
) -> Result<(i32, i64), StreamError> {
    let headers = message.headers.iter().fold(OwnedHeaders::new(), |headers, (name, value)| {
        headers.insert(Header {
            key: name.as_str(),
            value: Some(value.as_slice()),
        })
    });

    let mut record = FutureRecord::<[u8], [u8]>::to(&message.topic)
        .payload(message.payload.as_slice())
        .headers(headers);
    if let Some(key) = &message.key {
        record = record.key(key.as_slice());
    }

    producer
        .send(record, Timeout::After(timeout))
        .await
        .map_err(|(e, _)| StreamError::Publish(format!("{}: {e}", message.topic)))
}

/// Run a blocking producer call off the async workers.
async fn blocking<F>(producer: &FutureProducer, call: F) -> Result<(), KafkaError>
where
    F: FnOnce(&FutureProducer) -> Result<(), KafkaError> + Send + 'static,
{
    let producer = producer.clone();
    match tokio::task::spawn_blocking(move || call(&producer)).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Producer call did not complete");
            Err(KafkaError::Canceled)
        },
    }
}

#[derive(Debug, Default)]
struct CloseState {
    closed: AtomicBool,
}

impl CloseState {
    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StreamError::Publish("writer closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Mark closed; `false` if it already was.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Writer acknowledging each message before the next is sent.
///
/// Clones share the producer; the client is flushed and released once, by
/// [`Writer::close`].
#[derive(Clone)]
pub struct SyncWriter {
    producer: FutureProducer,
    timeout: Duration,
    state: Arc<CloseState>,
}

impl SyncWriter {
    /// Wrap a producer; `timeout` bounds each acknowledgement.
    #[must_use]
    pub fn new(producer: FutureProducer, timeout: Duration) -> Self {
        Self {
            producer,
            timeout,
            state: Arc::default(),
        }
    }
}

impl std::fmt::Debug for SyncWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWriter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Writer for SyncWriter {
    async fn write(&self, messages: &[Message]) -> Result<(), StreamError> {
        self.state.ensure_open()?;
        for message in messages {
            let (partition, offset) = send(&self.producer, message, self.timeout).await?;
            tracing::debug!(topic = %message.topic, partition, offset, "Message written");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        if !self.state.close() {
            return Ok(());
        }
        let timeout = self.timeout;
        blocking(&self.producer, move |producer| producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| StreamError::Close(format!("flush failed: {e}")))?;
        tracing::info!("Kafka writer closed");
        Ok(())
    }
}

/// Writer publishing each batch atomically inside a broker transaction.
///
/// Transactions are initialised on the first write, so construction does not
/// contact the brokers. Concurrent writes are serialised: a producer has at
/// most one open transaction.
#[derive(Clone)]
pub struct TransactionalWriter {
    producer: FutureProducer,
    timeout: Duration,
    initialised: Arc<OnceCell<()>>,
    in_flight: Arc<Mutex<()>>,
    state: Arc<CloseState>,
}

impl TransactionalWriter {
    /// Wrap a producer configured with a transactional id.
    #[must_use]
    pub fn new(producer: FutureProducer, timeout: Duration) -> Self {
        Self {
            producer,
            timeout,
            initialised: Arc::default(),
            in_flight: Arc::default(),
            state: Arc::default(),
        }
    }

    async fn init(&self) -> Result<(), StreamError> {
        let timeout = self.timeout;
        self.initialised
            .get_or_try_init(|| async {
                blocking(&self.producer, move |producer| {
                    producer.init_transactions(Timeout::After(timeout))
                })
                .await
                .map_err(|e| {
                    StreamError::Publish(format!("failed to initialise transactions: {e}"))
                })
            })
            .await
            .map(|_| ())
    }

    async fn write_batch(&self, messages: &[Message]) -> Result<(), StreamError> {
        for message in messages {
            send(&self.producer, message, self.timeout).await?;
        }
        let timeout = self.timeout;
        blocking(&self.producer, move |producer| {
            producer.commit_transaction(Timeout::After(timeout))
        })
        .await
            .map_err(|e| StreamError::Publish(format!("commit failed: {e}")))
    }
}

impl std::fmt::Debug for TransactionalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalWriter")
            .field("timeout", &self.timeout)
            .field("initialised", &self.initialised.initialized())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Writer for TransactionalWriter {
    async fn write(&self, messages: &[Message]) -> Result<(), StreamError> {
        self.state.ensure_open()?;
        self.init().await?;
        let _guard = self.in_flight.lock().await;

        self.producer
            .begin_transaction()
            .map_err(|e| StreamError::Publish(format!("failed to begin transaction: {e}")))?;

        match self.write_batch(messages).await {
            Ok(()) => {
                tracing::debug!(messages = messages.len(), "Transaction committed");
                Ok(())
            },
            Err(e) => {
                let timeout = self.timeout;
                let abort = blocking(&self.producer, move |producer| {
                    producer.abort_transaction(Timeout::After(timeout))
                });
                if let Err(abort) = abort.await {
                    tracing::warn!(error = %abort, "Failed to abort transaction");
                }
                Err(e)
            },
        }
    }

    async fn close(&self) -> Result<(), StreamError> {
        if !self.state.close() {
            return Ok(());
        }
        // wait for a running transaction to finish
        let _guard = self.in_flight.lock().await;
        let timeout = self.timeout;
        blocking(&self.producer, move |producer| producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| StreamError::Close(format!("flush failed: {e}")))?;
        tracing::info!("Kafka transactional writer closed");
        Ok(())
    }
}
