//! Ties a [`ReaderManager`] to the process lifecycle.

use super::{ReaderManager, StreamError};
use crate::BoxError;
use crate::lifecycle::{Hook, Lifecycle};
use std::sync::Arc;

/// Append the hook that runs `manager` for the lifetime of the process.
///
/// - On start, the consumption loop is spawned on its own task and the hook
///   returns immediately. A loop error other than
///   [`StreamError::ManagerClosed`] is logged and does not stop the process.
/// - On stop, the manager is closed with the lifecycle's stop deadline. A
///   failure to close is returned to the lifecycle.
pub fn supervise(lifecycle: &mut Lifecycle, manager: Arc<ReaderManager>) {
    let starter = Arc::clone(&manager);
    lifecycle.append(
        Hook::new("stream-reader-manager")
            .on_start(move || async move {
                tokio::spawn(async move {
                    match starter.start().await {
                        Ok(()) | Err(StreamError::ManagerClosed) => {
                            tracing::debug!("Reader manager finished");
                        },
                        Err(e) => {
                            tracing::error!(error = %e, "Reader manager stopped unexpectedly");
                        },
                    }
                });
                Ok(())
            })
            .on_stop(move |ctx| async move {
                manager
                    .close(ctx.deadline())
                    .await
                    .map_err(BoxError::from)
            }),
    );
}
