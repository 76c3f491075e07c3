//! In-memory stream doubles.
//!
//! - [`InMemorySource`]: a [`MessageSource`] fed by the test
//! - [`RecordingHandler`]: a [`Handler`] that records when it ran
//! - [`InMemoryWriter`]: a [`Writer`] that keeps what it was given

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use enclave_core::BoxError;
use enclave_core::stream::{Handler, Message, MessageSource, Record, StreamError, Writer};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct SourceState {
    queue: VecDeque<Record>,
    poll_errors: VecDeque<StreamError>,
    subscribed: Vec<String>,
    subscribe_error: Option<StreamError>,
    committed: Vec<(String, i32, i64)>,
    close_error: Option<StreamError>,
    closes: usize,
}

/// A message source fed by the test.
///
/// `poll` returns whatever is queued (up to `max`) as soon as anything is
/// queued; the fill window is ignored.
#[derive(Debug, Default)]
pub struct InMemorySource {
    state: Mutex<SourceState>,
    notify: Notify,
}

impl InMemorySource {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a record.
    pub fn push(&self, record: Record) {
        self.state.lock().unwrap().queue.push_back(record);
        self.notify.notify_one();
    }

    /// Make the next poll fail with `error`.
    pub fn push_poll_error(&self, error: StreamError) {
        self.state.lock().unwrap().poll_errors.push_back(error);
        self.notify.notify_one();
    }

    /// Make the next `subscribe` fail with `error`.
    pub fn fail_subscribe(&self, error: StreamError) {
        self.state.lock().unwrap().subscribe_error = Some(error);
    }

    /// Make `close` fail with `error`.
    pub fn fail_close(&self, error: StreamError) {
        self.state.lock().unwrap().close_error = Some(error);
    }

    /// Topics passed to `subscribe`.
    #[must_use]
    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribed.clone()
    }

    /// Committed `(topic, partition, offset)` triples, in commit order.
    #[must_use]
    pub fn committed(&self) -> Vec<(String, i32, i64)> {
        self.state.lock().unwrap().committed.clone()
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn subscribe(&self, topics: &[String]) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.subscribe_error.take() {
            return Err(error);
        }
        state.subscribed = topics.to_vec();
        Ok(())
    }

    async fn poll(&self, max: usize, _wait: Duration) -> Result<Vec<Record>, StreamError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(error) = state.poll_errors.pop_front() {
                    return Err(error);
                }
                if !state.queue.is_empty() {
                    let take = max.min(state.queue.len());
                    return Ok(state.queue.drain(..take).collect());
                }
            }
            self.notify.notified().await;
        }
    }

    async fn commit(&self, record: &Record) -> Result<(), StreamError> {
        self.state
            .lock()
            .unwrap()
            .committed
            .push((record.topic.clone(), record.partition, record.offset));
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        match state.close_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// What a [`RecordingHandler`] saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerEvent {
    /// Invocation began
    Started {
        /// Record offset
        offset: i64,
        /// When
        at: Instant,
    },
    /// Invocation returned (not recorded for abandoned invocations)
    Finished {
        /// Record offset
        offset: i64,
        /// When
        at: Instant,
    },
}

/// A handler that records its invocations.
///
/// Each invocation sleeps for the delay configured for its offset (zero by
/// default) and then succeeds, unless configured to fail.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<HandlerEvent>>,
    delays: HashMap<i64, Duration>,
    failing: bool,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingHandler {
    /// A handler that succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` when handling the record at `offset`.
    #[must_use]
    pub fn with_delay(mut self, offset: i64, delay: Duration) -> Self {
        self.delays.insert(offset, delay);
        self
    }

    /// Fail every invocation.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// All events in order.
    #[must_use]
    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Offsets of started invocations, in start order.
    #[must_use]
    pub fn started(&self) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HandlerEvent::Started { offset, .. } => Some(offset),
                HandlerEvent::Finished { .. } => None,
            })
            .collect()
    }

    /// Offsets of finished invocations, in finish order.
    #[must_use]
    pub fn finished(&self) -> Vec<i64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HandlerEvent::Finished { offset, .. } => Some(offset),
                HandlerEvent::Started { .. } => None,
            })
            .collect()
    }

    /// Start instant of the invocation for `offset`.
    #[must_use]
    pub fn started_at(&self, offset: i64) -> Option<Instant> {
        self.events().into_iter().find_map(|event| match event {
            HandlerEvent::Started { offset: o, at } if o == offset => Some(at),
            _ => None,
        })
    }

    /// Highest number of concurrent invocations observed.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, record: &Record) -> Result<(), BoxError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        self.events.lock().unwrap().push(HandlerEvent::Started {
            offset: record.offset,
            at: Instant::now(),
        });

        if let Some(delay) = self.delays.get(&record.offset) {
            tokio::time::sleep(*delay).await;
        }

        self.events.lock().unwrap().push(HandlerEvent::Finished {
            offset: record.offset,
            at: Instant::now(),
        });

        if self.failing {
            Err(format!("handler rejected offset {}", record.offset).into())
        } else {
            Ok(())
        }
    }
}

/// A writer that keeps every message.
#[derive(Debug, Default)]
pub struct InMemoryWriter {
    messages: Mutex<Vec<Message>>,
    closes: AtomicUsize,
}

impl InMemoryWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messages written so far.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Writer for InMemoryWriter {
    async fn write(&self, messages: &[Message]) -> Result<(), StreamError> {
        self.messages.lock().unwrap().extend_from_slice(messages);
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_respects_batch_size() {
        let source = InMemorySource::new();
        for offset in 0..3 {
            source.push(Record::new("orders", 0, offset, b"x".to_vec()));
        }

        let first = source.poll(2, Duration::ZERO).await.unwrap();
        let second = source.poll(2, Duration::ZERO).await.unwrap();
        assert_eq!(first.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(second.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn recording_handler_tracks_invocations() {
        let handler = RecordingHandler::new().failing();
        let record = Record::new("orders", 0, 7, b"x".to_vec());

        assert!(handler.handle(&record).await.is_err());
        assert_eq!(handler.started(), vec![7]);
        assert_eq!(handler.finished(), vec![7]);
        assert_eq!(handler.max_concurrency(), 1);
    }
}
