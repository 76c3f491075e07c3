//! Controllers and lifecycle supervision of a reader manager.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use enclave_core::BoxError;
use enclave_core::lifecycle::{Hook, Lifecycle, LifecycleError};
use enclave_core::stream::{
    Controller, ManagerState, ReaderManager, ReaderSettings, Record, StreamError, handler_fn,
    register_controllers, supervise,
};
use enclave_testing::{InMemorySource, LogCapture, RecordingHandler};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::Level;

struct TopicController {
    topics: Vec<&'static str>,
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl Controller for TopicController {
    fn register_readers(&self, manager: &ReaderManager) -> Result<(), StreamError> {
        for topic in &self.topics {
            self.order.lock().unwrap().push(*topic);
            manager.register(*topic, Arc::new(RecordingHandler::new()))?;
        }
        Ok(())
    }
}

fn manager(source: &Arc<InMemorySource>) -> Arc<ReaderManager> {
    Arc::new(ReaderManager::new(
        source.clone(),
        ReaderSettings::default(),
        Arc::new(|error: &StreamError| tracing::error!(error = %error, "stream error")),
    ))
}

#[tokio::test]
async fn controllers_register_in_insertion_order() {
    let source = InMemorySource::new();
    let manager = manager(&source);
    let order = Arc::new(Mutex::new(Vec::new()));
    let controllers: Vec<Arc<dyn Controller>> = vec![
        Arc::new(TopicController {
            topics: vec!["payments.settled"],
            order: Arc::clone(&order),
        }),
        Arc::new(TopicController {
            topics: vec!["orders.placed", "orders.cancelled"],
            order: Arc::clone(&order),
        }),
    ];

    register_controllers(&controllers, &manager).unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec!["payments.settled", "orders.placed", "orders.cancelled"]
    );
    assert_eq!(manager.topics().len(), 3);
}

#[tokio::test]
async fn controller_conflicts_are_reported() {
    let source = InMemorySource::new();
    let manager = manager(&source);
    let order = Arc::new(Mutex::new(Vec::new()));
    let controllers: Vec<Arc<dyn Controller>> = vec![
        Arc::new(TopicController {
            topics: vec!["orders.placed"],
            order: Arc::clone(&order),
        }),
        Arc::new(TopicController {
            topics: vec!["orders.placed"],
            order: Arc::clone(&order),
        }),
    ];

    assert_eq!(
        register_controllers(&controllers, &manager),
        Err(StreamError::DuplicateSubscription("orders.placed".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn supervised_manager_runs_between_start_and_stop() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let source = InMemorySource::new();
    let manager = manager(&source);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager
        .register(
            "orders.placed",
            handler_fn(move |record: Record| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(record.offset);
                    Ok::<(), BoxError>(())
                }
            }),
        )
        .unwrap();

    let mut lifecycle = Lifecycle::new();
    supervise(&mut lifecycle, Arc::clone(&manager));

    // Start returns immediately even though consumption never ends by itself.
    lifecycle.start(Duration::from_secs(1)).await.unwrap();
    source.push(Record::new("orders.placed", 0, 0, b"{}".to_vec()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(manager.state(), ManagerState::Running);
    assert_eq!(*seen.lock().unwrap(), vec![0]);

    lifecycle.stop(Duration::from_secs(5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(source.closes(), 1);
    assert!(
        logs.events().iter().all(|event| event.level != Level::ERROR),
        "graceful stop must not be logged as an error"
    );
}

#[tokio::test(start_paused = true)]
async fn close_failure_fails_the_stop() {
    let source = InMemorySource::new();
    source.fail_close(StreamError::Close("broker unreachable".to_string()));
    let manager = manager(&source);
    manager.register("orders.placed", Arc::new(RecordingHandler::new())).unwrap();

    let mut lifecycle = Lifecycle::new();
    supervise(&mut lifecycle, Arc::clone(&manager));
    lifecycle.start(Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = lifecycle.stop(Duration::from_secs(5)).await.unwrap_err();
    let LifecycleError::StopFailed(failures) = err else {
        panic!("expected StopFailed");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].hook, "stream-reader-manager");
    assert!(failures[0].reason.contains("broker unreachable"));
}

#[tokio::test(start_paused = true)]
async fn subscribe_failure_is_logged_and_leaves_the_lifecycle_running() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let source = InMemorySource::new();
    source.fail_subscribe(StreamError::Poll("unknown topic orders.placed".to_string()));
    let manager = manager(&source);
    manager.register("orders.placed", Arc::new(RecordingHandler::new())).unwrap();

    let journal = Arc::new(Mutex::new(Vec::new()));
    let stops = Arc::clone(&journal);
    let mut lifecycle = Lifecycle::new();
    supervise(&mut lifecycle, Arc::clone(&manager));
    lifecycle.append(Hook::new("http").on_stop(move |_ctx| async move {
        stops.lock().unwrap().push("stop http");
        Ok(())
    }));

    lifecycle.start(Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let failures = logs.with_message("Reader manager stopped unexpectedly");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].level, Level::ERROR);
    assert!(failures[0].field("error").unwrap().contains("unknown topic"));
    assert!(journal.lock().unwrap().is_empty(), "other hooks keep running");
    assert!(source.subscribed().is_empty());

    lifecycle.stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(*journal.lock().unwrap(), vec!["stop http"]);
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(source.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn poll_failure_is_reported_and_consumption_resumes() {
    let logs = LogCapture::new();
    let _guard = logs.install();

    let source = InMemorySource::new();
    let manager = manager(&source);
    let handler = Arc::new(RecordingHandler::new());
    manager.register("orders.placed", handler.clone()).unwrap();

    let mut lifecycle = Lifecycle::new();
    supervise(&mut lifecycle, Arc::clone(&manager));
    lifecycle.start(Duration::from_secs(1)).await.unwrap();

    source.push_poll_error(StreamError::Poll("broker transport failure".to_string()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    source.push(Record::new("orders.placed", 0, 4, b"{}".to_vec()));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let reported = logs.with_message("stream error");
    assert_eq!(reported.len(), 1);
    assert!(reported[0].field("error").unwrap().contains("broker transport failure"));
    assert_eq!(manager.state(), ManagerState::Running);
    assert_eq!(handler.finished(), vec![4]);

    lifecycle.stop(Duration::from_secs(5)).await.unwrap();
    assert!(logs.with_message("Reader manager stopped unexpectedly").is_empty());
}
