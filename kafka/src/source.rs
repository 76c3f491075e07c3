//! `rdkafka`-backed message source for the reader manager.

use async_trait::async_trait;
use chrono::DateTime;
use enclave_core::stream::{MessageSource, Record, StreamError};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Consumer-group member feeding a [`ReaderManager`](enclave_core::stream::ReaderManager).
///
/// Positions are committed per record, asynchronously, as the manager
/// finishes them.
pub struct KafkaSource {
    consumer: StreamConsumer,
    closed: AtomicBool,
}

impl KafkaSource {
    /// Wrap a consumer.
    #[must_use]
    pub fn new(consumer: StreamConsumer) -> Self {
        Self {
            consumer,
            closed: AtomicBool::new(false),
        }
    }
}

impl std::fmt::Debug for KafkaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSource")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let mut record = Record::new(
        message.topic(),
        message.partition(),
        message.offset(),
        message.payload().unwrap_or_default(),
    );
    record.key = message.key().map(<[u8]>::to_vec);
    if let Some(headers) = message.headers() {
        record.headers = headers
            .iter()
            .map(|header| (header.key.to_string(), header.value.unwrap_or_default().to_vec()))
            .collect();
    }
    record.timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis);
    record
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn subscribe(&self, topics: &[String]) -> Result<(), StreamError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| StreamError::Poll(format!("failed to subscribe to {topics:?}: {e}")))?;
        tracing::info!(topics = ?topics, "Subscribed to topics");
        Ok(())
    }

    async fn poll(&self, max: usize, wait: Duration) -> Result<Vec<Record>, StreamError> {
        let first = self
            .consumer
            .recv()
            .await
            .map_err(|e| StreamError::Poll(e.to_string()))?;
        let mut batch = Vec::with_capacity(max.min(64));
        batch.push(to_record(&first));
        drop(first);

        let deadline = Instant::now() + wait;
        while batch.len() < max {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.push(to_record(&message)),
                Ok(Err(e)) => {
                    // records already received are handed out; the error resurfaces next poll
                    tracing::warn!(error = %e, records = batch.len(), "Poll interrupted");
                    break;
                },
                Err(_) => break,
            }
        }

        tracing::trace!(records = batch.len(), "Polled batch");
        Ok(batch)
    }

    async fn commit(&self, record: &Record) -> Result<(), StreamError> {
        let mut positions = TopicPartitionList::new();
        positions
            .add_partition_offset(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset + 1),
            )
            .map_err(|e| StreamError::Commit(e.to_string()))?;
        self.consumer
            .commit(&positions, CommitMode::Async)
            .map_err(|e| {
                StreamError::Commit(format!(
                    "{}[{}]@{}: {e}",
                    record.topic, record.partition, record.offset
                ))
            })
    }

    async fn close(&self) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.consumer.unsubscribe();
        tracing::info!("Kafka consumer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KafkaSource>();
    }
}
