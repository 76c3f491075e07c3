//! Message streaming abstractions.
//!
//! Driver crates implement [`Writer`] for publishing and [`MessageSource`]
//! for consumption. On top of a source, [`ReaderManager`] runs the
//! background consumption loop: it polls batches, dispatches records to the
//! [`Handler`] registered for their topic on a bounded worker pool, and
//! commits positions.
//!
//! - [`Controller`] groups the subscriptions of one feature and registers
//!   them with a manager before it starts
//! - [`supervise`] ties a manager to the process [`Lifecycle`](crate::lifecycle::Lifecycle)
//!
//! # Example
//!
//! ```ignore
//! let manager = Arc::new(ReaderManager::new(source, ReaderSettings::default(), log_errors));
//! manager.register("orders.placed", handler_fn(|record| async move {
//!     tracing::info!(offset = record.offset, "order placed");
//!     Ok(())
//! }))?;
//! supervise(&mut lifecycle, Arc::clone(&manager));
//! ```

use crate::BoxError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod controller;
pub mod reader;
pub mod supervisor;

pub use controller::{Controller, register_controllers};
pub use reader::{ErrorCallback, ManagerState, ReaderManager, ReaderSettings};
pub use supervisor::supervise;

/// Errors raised by stream clients and the reader manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The manager was closed. This is how a consumption loop ends after a
    /// graceful stop; it is never reported as an operational error.
    #[error("reader manager closed")]
    ManagerClosed,

    /// Registration was attempted after the manager started.
    #[error("reader manager already started")]
    AlreadyStarted,

    /// A topic already has a handler.
    #[error("duplicate subscription for topic {0}")]
    DuplicateSubscription(String),

    /// A handler exceeded its timeout and was abandoned.
    #[error("handler for {topic}[{partition}]@{offset} timed out after {timeout:?}")]
    HandlerTimeout {
        /// Record topic
        topic: String,
        /// Record partition
        partition: i32,
        /// Record offset
        offset: i64,
        /// Configured handler timeout
        timeout: Duration,
    },

    /// A handler returned an error.
    #[error("handler for {topic}[{partition}]@{offset} failed: {reason}")]
    Handler {
        /// Record topic
        topic: String,
        /// Record partition
        partition: i32,
        /// Record offset
        offset: i64,
        /// Handler error
        reason: String,
    },

    /// Polling the broker failed.
    #[error("poll failed: {0}")]
    Poll(String),

    /// Committing a position failed.
    #[error("commit failed: {0}")]
    Commit(String),

    /// Publishing failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Releasing the client failed.
    #[error("close failed: {0}")]
    Close(String),
}

/// Message header.
pub type Header = (String, Vec<u8>);

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: Option<Vec<u8>>,
    /// Payload
    pub payload: Vec<u8>,
    /// Headers
    pub headers: Vec<Header>,
}

impl Message {
    /// Create a message without key or headers.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: Vec::new(),
        }
    }

    /// Set the partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// An inbound record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Partitioning key
    pub key: Option<Vec<u8>>,
    /// Payload
    pub payload: Vec<u8>,
    /// Headers
    pub headers: Vec<Header>,
    /// Broker or producer timestamp
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    /// Create a record without key, headers or timestamp.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: payload.into(),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    /// First header with the given name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_slice())
    }
}

/// Publishes messages.
#[async_trait]
pub trait Writer: Send + Sync {
    /// Publish `messages` in order.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Publish`] if any message is not acknowledged.
    async fn write(&self, messages: &[Message]) -> Result<(), StreamError>;

    /// Flush pending messages and release the client.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Close`] if pending messages could not be flushed.
    async fn close(&self) -> Result<(), StreamError>;
}

/// Handles the records of one topic.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one record.
    ///
    /// # Errors
    ///
    /// Any error is reported through the manager's error callback.
    async fn handle(&self, record: &Record) -> Result<(), BoxError>;
}

/// A source of records for a [`ReaderManager`].
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Subscribe to `topics`. Called once, when the manager starts.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Poll`] if the subscription is rejected.
    async fn subscribe(&self, topics: &[String]) -> Result<(), StreamError>;

    /// Wait for at least one record, then collect up to `max` records
    /// arriving within `wait`.
    ///
    /// Must be cancel-safe: the manager drops a pending poll on stop.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Poll`] if the broker cannot be polled.
    async fn poll(&self, max: usize, wait: Duration) -> Result<Vec<Record>, StreamError>;

    /// Mark `record` as processed.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Commit`] if the position cannot be stored.
    async fn commit(&self, record: &Record) -> Result<(), StreamError>;

    /// Commit outstanding positions and release the client.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Close`] if the client cannot be released cleanly.
    async fn close(&self) -> Result<(), StreamError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, record: &Record) -> Result<(), BoxError> {
        (self.0)(record.clone()).await
    }
}

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_header_lookup() {
        let mut record = Record::new("orders", 0, 3, b"{}".to_vec());
        record.headers.push(("trace-id".to_string(), b"abc".to_vec()));
        assert_eq!(record.header("trace-id"), Some(&b"abc"[..]));
        assert_eq!(record.header("missing"), None);
    }

    #[test]
    fn handler_errors_name_the_record() {
        let err = StreamError::Handler {
            topic: "orders".to_string(),
            partition: 2,
            offset: 41,
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "handler for orders[2]@41 failed: boom");
    }
}
