//! Background consumption loop.
//!
//! A [`ReaderManager`] owns a [`MessageSource`] and the handlers registered
//! for its topics. Once started it:
//!
//! 1. polls a batch of at most `poll_batch_size` records
//! 2. dispatches each record to its topic's handler on a worker pool of
//!    `pool_size` permits (dispatch waits for a free worker, so no new batch
//!    is polled while the pool is saturated)
//! 3. commits each record once its handler returned or timed out
//!
//! Commits are at-most-once for failures: a record whose handler returns an
//! error or times out is reported to the [`ErrorCallback`] and then committed
//! like any other, so it is skipped and never redelivered. Handlers that need
//! retries or a dead-letter topic must do so before returning.
//!
//! Records of one topic partition form a lane: a record starts only after the
//! previous record of its lane finished, so per-partition order is kept while
//! different partitions are handled concurrently.
//!
//! ## States
//!
//! `Created → Starting → Running → Stopping → Stopped`. Handlers can only be
//! registered while `Created`. [`ReaderManager::close`] moves to `Stopping`,
//! waits for in-flight handlers until the deadline, aborts what is left and
//! releases the source. The loop then ends with [`StreamError::ManagerClosed`].

use super::{Handler, MessageSource, Record, StreamError};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Callback invoked for every consumption error except [`StreamError::ManagerClosed`].
pub type ErrorCallback = Arc<dyn Fn(&StreamError) + Send + Sync>;

/// Tuning of the consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSettings {
    /// Maximum records per poll (at least 1)
    pub poll_batch_size: usize,
    /// How long a poll keeps filling its batch after the first record
    pub poll_interval: Duration,
    /// Maximum concurrent handler invocations (at least 1)
    pub pool_size: usize,
    /// Per-handler timeout; zero disables it
    pub handler_timeout: Duration,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            poll_batch_size: 100,
            poll_interval: Duration::from_millis(500),
            pool_size: 50,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle state of a [`ReaderManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    /// Accepting registrations
    Created = 0,
    /// Subscribing
    Starting = 1,
    /// Consuming
    Running = 2,
    /// Draining in-flight handlers
    Stopping = 3,
    /// Terminal
    Stopped = 4,
}

impl ManagerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

type LaneKey = (String, i32);

/// Runs handlers for the records of a [`MessageSource`].
pub struct ReaderManager {
    source: Arc<dyn MessageSource>,
    settings: ReaderSettings,
    on_error: ErrorCallback,
    handlers: Mutex<BTreeMap<String, Arc<dyn Handler>>>,
    state: AtomicU8,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    permits: Arc<Semaphore>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    close_lock: tokio::sync::Mutex<()>,
}

impl ReaderManager {
    /// Create a manager in the `Created` state.
    ///
    /// `poll_batch_size` and `pool_size` below 1 are raised to 1.
    pub fn new(
        source: Arc<dyn MessageSource>,
        settings: ReaderSettings,
        on_error: ErrorCallback,
    ) -> Self {
        let settings = ReaderSettings {
            poll_batch_size: settings.poll_batch_size.max(1),
            pool_size: settings.pool_size.max(1),
            ..settings
        };
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        Self {
            source,
            permits: Arc::new(Semaphore::new(settings.pool_size)),
            settings,
            on_error,
            handlers: Mutex::new(BTreeMap::new()),
            state: AtomicU8::new(ManagerState::Created as u8),
            stop_tx,
            done_tx,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            close_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Loop settings.
    #[must_use]
    pub const fn settings(&self) -> ReaderSettings {
        self.settings
    }

    /// Subscribed topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Register the handler for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AlreadyStarted`] once the manager left
    /// `Created`, and [`StreamError::DuplicateSubscription`] if `topic`
    /// already has a handler.
    pub fn register(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), StreamError> {
        let topic = topic.into();
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the lock so a concurrent start sees either all or none.
        if self.state() != ManagerState::Created {
            return Err(StreamError::AlreadyStarted);
        }
        if handlers.contains_key(&topic) {
            return Err(StreamError::DuplicateSubscription(topic));
        }
        tracing::debug!(topic = %topic, "Registered stream handler");
        handlers.insert(topic, handler);
        Ok(())
    }

    fn transition(&self, from: ManagerState, to: ManagerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn report(&self, error: &StreamError) {
        report(&self.on_error, error);
    }

    /// Run the consumption loop until [`ReaderManager::close`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ManagerClosed`] when the loop ends after a
    /// close (including a close before start), [`StreamError::AlreadyStarted`]
    /// on a second call, or the subscription error if subscribing fails.
    pub async fn start(&self) -> Result<(), StreamError> {
        let handlers = {
            let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.transition(ManagerState::Created, ManagerState::Starting) {
                return match self.state() {
                    ManagerState::Stopping | ManagerState::Stopped => {
                        Err(StreamError::ManagerClosed)
                    },
                    _ => Err(StreamError::AlreadyStarted),
                };
            }
            handlers.clone()
        };

        let result = self.run(handlers).await;
        self.done_tx.send_replace(true);
        result
    }

    async fn run(&self, handlers: BTreeMap<String, Arc<dyn Handler>>) -> Result<(), StreamError> {
        let topics: Vec<String> = handlers.keys().cloned().collect();
        if topics.is_empty() {
            tracing::warn!("Reader manager started without subscriptions");
        } else {
            self.source.subscribe(&topics).await?;
        }
        let handlers: Arc<HashMap<String, Arc<dyn Handler>>> =
            Arc::new(handlers.into_iter().collect());

        self.transition(ManagerState::Starting, ManagerState::Running);
        tracing::info!(
            topics = ?topics,
            pool_size = self.settings.pool_size,
            poll_batch_size = self.settings.poll_batch_size,
            "Reader manager running"
        );

        let mut stop_rx = self.stop_tx.subscribe();
        let mut lanes: HashMap<LaneKey, oneshot::Receiver<()>> = HashMap::new();

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            let poll = self
                .source
                .poll(self.settings.poll_batch_size, self.settings.poll_interval);
            let polled = tokio::select! {
                biased;
                () = raised(&mut stop_rx) => break,
                polled = poll => polled,
            };

            match polled {
                Ok(records) => {
                    if !self.dispatch(records, &handlers, &mut lanes, &mut stop_rx).await {
                        break;
                    }
                },
                Err(e) => {
                    self.report(&e);
                    let backoff = self.settings.poll_interval.max(Duration::from_millis(100));
                    tokio::select! {
                        biased;
                        () = raised(&mut stop_rx) => break,
                        () = tokio::time::sleep(backoff) => {},
                    }
                },
            }
        }

        tracing::info!("Reader manager loop exited");
        Err(StreamError::ManagerClosed)
    }

    /// Dispatch a batch; returns `false` if a stop was requested meanwhile.
    async fn dispatch(
        &self,
        records: Vec<Record>,
        handlers: &Arc<HashMap<String, Arc<dyn Handler>>>,
        lanes: &mut HashMap<LaneKey, oneshot::Receiver<()>>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        for record in records {
            let permit = tokio::select! {
                biased;
                () = raised(stop_rx) => return false,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return false,
                },
            };

            let (done_tx, done_rx) = oneshot::channel();
            let previous = lanes.insert((record.topic.clone(), record.partition), done_rx);
            let job = Job {
                record,
                handlers: Arc::clone(handlers),
                source: Arc::clone(&self.source),
                on_error: Arc::clone(&self.on_error),
                timeout: self.settings.handler_timeout,
            };

            let mut tasks = self.tasks.lock().await;
            tasks.spawn(job.run(previous, done_tx, permit));
            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    tracing::error!(error = %e, "Stream handler task panicked");
                }
            }
        }
        true
    }

    /// Stop consuming and release the source.
    ///
    /// Waits for the loop to exit and for in-flight handlers to finish, both
    /// bounded by `deadline`; handlers still running at the deadline are
    /// abandoned. Closing a manager that never started only releases the
    /// source. Further calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the source's error if it cannot be released cleanly.
    pub async fn close(&self, deadline: Instant) -> Result<(), StreamError> {
        let _closing = self.close_lock.lock().await;

        if self.state() == ManagerState::Stopped {
            return Ok(());
        }
        self.stop_tx.send_replace(true);

        if self.transition(ManagerState::Created, ManagerState::Stopped) {
            tracing::info!("Closing reader manager that never started");
            return self.source.close().await;
        }
        self.state.store(ManagerState::Stopping as u8, Ordering::Release);
        tracing::info!("Stopping reader manager");

        let mut done_rx = self.done_tx.subscribe();
        if tokio::time::timeout_at(deadline, raised(&mut done_rx)).await.is_err() {
            tracing::warn!("Reader manager loop did not exit before the deadline");
        }

        {
            let mut tasks = self.tasks.lock().await;
            let drained = tokio::time::timeout_at(deadline, async {
                while let Some(finished) = tasks.join_next().await {
                    if let Err(e) = finished {
                        tracing::error!(error = %e, "Stream handler task panicked");
                    }
                }
            })
            .await;
            if drained.is_err() {
                tracing::warn!(
                    abandoned = tasks.len(),
                    "Abandoning in-flight handlers at the deadline"
                );
                tasks.abort_all();
            }
        }

        self.state.store(ManagerState::Stopped as u8, Ordering::Release);
        let result = self.source.close().await;
        match &result {
            Ok(()) => tracing::info!("Reader manager stopped"),
            Err(e) => tracing::error!(error = %e, "Reader manager failed to release its source"),
        }
        result
    }
}

impl fmt::Debug for ReaderManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderManager")
            .field("state", &self.state())
            .field("settings", &self.settings)
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}

/// Resolves once the flag is set (or its sender is gone).
async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

fn report(on_error: &ErrorCallback, error: &StreamError) {
    if !matches!(error, StreamError::ManagerClosed) {
        on_error(error);
    }
}

/// One record on its way through a lane.
struct Job {
    record: Record,
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
    source: Arc<dyn MessageSource>,
    on_error: ErrorCallback,
    timeout: Duration,
}

impl Job {
    async fn run(
        self,
        previous: Option<oneshot::Receiver<()>>,
        done: oneshot::Sender<()>,
        permit: OwnedSemaphorePermit,
    ) {
        if let Some(previous) = previous {
            // Err only means the previous task was aborted; the lane is free either way.
            let _ = previous.await;
        }

        let record = &self.record;
        match self.handlers.get(&record.topic) {
            Some(handler) => {
                let outcome = if self.timeout.is_zero() {
                    Ok(handler.handle(record).await)
                } else {
                    tokio::time::timeout(self.timeout, handler.handle(record)).await
                };
                let topic = record.topic.clone();
                match outcome {
                    Ok(Ok(())) => {
                        metrics::counter!("stream.reader.handled", "topic" => topic).increment(1);
                    },
                    Ok(Err(e)) => {
                        metrics::counter!("stream.reader.failed", "topic" => topic).increment(1);
                        report(
                            &self.on_error,
                            &StreamError::Handler {
                                topic: record.topic.clone(),
                                partition: record.partition,
                                offset: record.offset,
                                reason: e.to_string(),
                            },
                        );
                    },
                    Err(_) => {
                        metrics::counter!("stream.reader.failed", "topic" => topic).increment(1);
                        report(
                            &self.on_error,
                            &StreamError::HandlerTimeout {
                                topic: record.topic.clone(),
                                partition: record.partition,
                                offset: record.offset,
                                timeout: self.timeout,
                            },
                        );
                    },
                }
            },
            None => {
                tracing::warn!(
                    topic = %record.topic,
                    offset = record.offset,
                    "No handler for record topic"
                );
            },
        }

        if let Err(e) = self.source.commit(record).await {
            report(&self.on_error, &e);
        }

        drop(permit);
        let _ = done.send(());
    }
}
