//! Reader manager scenarios: ordering, bounded concurrency, shutdown and error reporting.
//!
//! All tests run on a paused clock, so timeouts elapse instantly and
//! deterministically.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use enclave_core::stream::{
    ErrorCallback, ManagerState, ReaderManager, ReaderSettings, Record, StreamError,
};
use enclave_testing::{InMemorySource, RecordingHandler};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn settings(pool_size: usize, handler_timeout: Duration) -> ReaderSettings {
    ReaderSettings {
        poll_batch_size: 10,
        poll_interval: Duration::from_millis(500),
        pool_size,
        handler_timeout,
    }
}

fn collecting_callback() -> (ErrorCallback, Arc<Mutex<Vec<StreamError>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let callback: ErrorCallback = Arc::new(move |error: &StreamError| {
        sink.lock().unwrap().push(error.clone());
    });
    (callback, errors)
}

fn record(partition: i32, offset: i64) -> Record {
    Record::new("orders", partition, offset, format!("order-{offset}").into_bytes())
}

fn spawn_start(manager: &Arc<ReaderManager>) -> tokio::task::JoinHandle<Result<(), StreamError>> {
    let manager = Arc::clone(manager);
    tokio::spawn(async move { manager.start().await })
}

#[tokio::test(start_paused = true)]
async fn second_record_waits_for_abandoned_first() {
    let source = InMemorySource::new();
    let handler = Arc::new(RecordingHandler::new().with_delay(0, Duration::from_secs(10)));
    let (callback, errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(
        source.clone(),
        settings(1, Duration::from_secs(5)),
        callback,
    ));
    manager.register("orders", handler.clone()).unwrap();

    source.push(record(0, 0));
    source.push(record(0, 1));
    let run = spawn_start(&manager);

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(handler.started(), vec![0, 1]);
    assert_eq!(handler.finished(), vec![1]);
    let first = handler.started_at(0).unwrap();
    let second = handler.started_at(1).unwrap();
    assert!(second - first >= Duration::from_secs(5), "second started after {:?}", second - first);
    assert_eq!(handler.max_concurrency(), 1);

    assert_eq!(
        *errors.lock().unwrap(),
        vec![StreamError::HandlerTimeout {
            topic: "orders".to_string(),
            partition: 0,
            offset: 0,
            timeout: Duration::from_secs(5),
        }]
    );
    assert_eq!(
        source.committed(),
        vec![("orders".to_string(), 0, 0), ("orders".to_string(), 0, 1)]
    );

    manager.close(Instant::now() + Duration::from_secs(5)).await.unwrap();
    assert_eq!(run.await.unwrap(), Err(StreamError::ManagerClosed));
}

#[tokio::test(start_paused = true)]
async fn second_record_starts_when_first_completes() {
    let source = InMemorySource::new();
    let handler = Arc::new(RecordingHandler::new().with_delay(0, Duration::from_secs(2)));
    let (callback, errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(
        source.clone(),
        settings(1, Duration::from_secs(5)),
        callback,
    ));
    manager.register("orders", handler.clone()).unwrap();

    source.push(record(0, 0));
    source.push(record(0, 1));
    let _run = spawn_start(&manager);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(handler.finished(), vec![0, 1]);
    let gap = handler.started_at(1).unwrap() - handler.started_at(0).unwrap();
    assert!(gap >= Duration::from_secs(2) && gap < Duration::from_secs(5), "gap {gap:?}");
    assert!(errors.lock().unwrap().is_empty());

    manager.close(Instant::now() + Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn partitions_are_handled_concurrently() {
    let source = InMemorySource::new();
    let handler = Arc::new(
        RecordingHandler::new()
            .with_delay(0, Duration::from_secs(1))
            .with_delay(1, Duration::from_secs(1)),
    );
    let (callback, _errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(
        source.clone(),
        settings(4, Duration::from_secs(5)),
        callback,
    ));
    manager.register("orders", handler.clone()).unwrap();

    source.push(record(0, 0));
    source.push(record(1, 1));
    let _run = spawn_start(&manager);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(handler.max_concurrency(), 2);
    assert_eq!(handler.finished().len(), 2);

    manager.close(Instant::now() + Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_waits_for_in_flight_handler_until_its_timeout() {
    let source = InMemorySource::new();
    let handler = Arc::new(RecordingHandler::new().with_delay(0, Duration::from_secs(60)));
    let (callback, _errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(
        source.clone(),
        settings(1, Duration::from_secs(5)),
        callback,
    ));
    manager.register("orders", handler.clone()).unwrap();
    source.push(record(0, 0));
    let run = spawn_start(&manager);

    // Three seconds in, the handler has two seconds left before its timeout.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(manager.state(), ManagerState::Running);
    assert_eq!(source.closes(), 0);

    let stop_requested = Instant::now();
    manager.close(stop_requested + Duration::from_secs(30)).await.unwrap();
    let waited = stop_requested.elapsed();

    assert!(waited >= Duration::from_secs(2), "close returned after {waited:?}");
    assert!(waited < Duration::from_secs(3), "close returned after {waited:?}");
    assert!(handler.finished().is_empty());
    assert_eq!(source.closes(), 1);
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(run.await.unwrap(), Err(StreamError::ManagerClosed));
}

#[tokio::test(start_paused = true)]
async fn close_waits_for_in_flight_handler_to_complete() {
    let source = InMemorySource::new();
    let handler = Arc::new(RecordingHandler::new().with_delay(0, Duration::from_secs(4)));
    let (callback, errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(
        source.clone(),
        settings(1, Duration::from_secs(5)),
        callback,
    ));
    manager.register("orders", handler.clone()).unwrap();
    source.push(record(0, 0));
    let _run = spawn_start(&manager);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let stop_requested = Instant::now();
    manager.close(stop_requested + Duration::from_secs(30)).await.unwrap();

    let waited = stop_requested.elapsed();
    assert!(
        waited >= Duration::from_secs(1) && waited < Duration::from_secs(2),
        "waited {waited:?}"
    );
    assert_eq!(handler.finished(), vec![0]);
    assert_eq!(source.committed(), vec![("orders".to_string(), 0, 0)]);
    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_abandons_handlers_at_the_deadline() {
    let source = InMemorySource::new();
    let handler = Arc::new(RecordingHandler::new().with_delay(0, Duration::from_secs(3600)));
    let (callback, _errors) = collecting_callback();
    // A zero timeout leaves handlers unbounded; only the deadline ends them.
    let manager = Arc::new(ReaderManager::new(
        source.clone(),
        settings(1, Duration::ZERO),
        callback,
    ));
    manager.register("orders", handler.clone()).unwrap();
    source.push(record(0, 0));
    let _run = spawn_start(&manager);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stop_requested = Instant::now();
    manager.close(stop_requested + Duration::from_secs(2)).await.unwrap();

    let waited = stop_requested.elapsed();
    assert!(
        waited >= Duration::from_secs(2) && waited < Duration::from_secs(3),
        "waited {waited:?}"
    );
    assert!(handler.finished().is_empty());
    assert!(source.committed().is_empty());
    assert_eq!(source.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_records_are_committed_and_not_redelivered() {
    let source = InMemorySource::new();
    let handler = Arc::new(RecordingHandler::new().failing());
    let (callback, errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(
        source.clone(),
        settings(1, Duration::from_secs(5)),
        callback,
    ));
    manager.register("orders", handler.clone()).unwrap();

    source.push(record(0, 0));
    source.push(record(0, 1));
    let run = spawn_start(&manager);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(handler.started(), vec![0, 1]);
    assert_eq!(errors.lock().unwrap().len(), 2);
    assert_eq!(
        source.committed(),
        vec![("orders".to_string(), 0, 0), ("orders".to_string(), 0, 1)]
    );

    manager.close(Instant::now() + Duration::from_secs(1)).await.unwrap();
    assert_eq!(run.await.unwrap(), Err(StreamError::ManagerClosed));
}

#[tokio::test(start_paused = true)]
async fn errors_reach_callback_except_manager_closed() {
    let source = InMemorySource::new();
    let handler = Arc::new(RecordingHandler::new().failing());
    let (callback, errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(
        source.clone(),
        settings(2, Duration::from_secs(5)),
        callback,
    ));
    manager.register("orders", handler).unwrap();

    source.push_poll_error(StreamError::Poll("broker unavailable".to_string()));
    source.push(record(0, 0));
    let run = spawn_start(&manager);

    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.close(Instant::now() + Duration::from_secs(1)).await.unwrap();
    assert_eq!(run.await.unwrap(), Err(StreamError::ManagerClosed));

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 2, "{errors:?}");
    assert_eq!(errors[0], StreamError::Poll("broker unavailable".to_string()));
    assert!(matches!(&errors[1], StreamError::Handler { offset: 0, .. }));
    assert!(!errors.contains(&StreamError::ManagerClosed));
}

#[tokio::test(start_paused = true)]
async fn registration_is_closed_once_started() {
    let source = InMemorySource::new();
    let (callback, _errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(source.clone(), ReaderSettings::default(), callback));

    manager.register("orders", Arc::new(RecordingHandler::new())).unwrap();
    assert_eq!(
        manager.register("orders", Arc::new(RecordingHandler::new())),
        Err(StreamError::DuplicateSubscription("orders".to_string()))
    );

    let _run = spawn_start(&manager);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.subscribed(), vec!["orders".to_string()]);

    assert_eq!(
        manager.register("payments", Arc::new(RecordingHandler::new())),
        Err(StreamError::AlreadyStarted)
    );
    assert_eq!(manager.start().await, Err(StreamError::AlreadyStarted));

    manager.close(Instant::now() + Duration::from_secs(1)).await.unwrap();
    assert_eq!(manager.topics(), vec!["orders".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn close_before_start_releases_source_once() {
    let source = InMemorySource::new();
    let (callback, errors) = collecting_callback();
    let manager = ReaderManager::new(source.clone(), ReaderSettings::default(), callback);

    manager.close(Instant::now() + Duration::from_secs(1)).await.unwrap();
    manager.close(Instant::now() + Duration::from_secs(1)).await.unwrap();

    assert_eq!(source.closes(), 1);
    assert_eq!(manager.start().await, Err(StreamError::ManagerClosed));
    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_failure_is_returned() {
    let source = InMemorySource::new();
    source.fail_close(StreamError::Close("final commit failed".to_string()));
    let (callback, _errors) = collecting_callback();
    let manager = Arc::new(ReaderManager::new(source.clone(), ReaderSettings::default(), callback));
    manager.register("orders", Arc::new(RecordingHandler::new())).unwrap();
    let _run = spawn_start(&manager);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        manager.close(Instant::now() + Duration::from_secs(1)).await,
        Err(StreamError::Close("final commit failed".to_string()))
    );
    assert_eq!(manager.state(), ManagerState::Stopped);
}
