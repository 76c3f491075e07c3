//! Process lifecycle: ordered start and stop hooks.
//!
//! Resources append a [`Hook`] when they are constructed. On start, hooks run
//! in append order; on stop, in reverse, so a resource is always stopped
//! before the resources it was built from.
//!
//! ```ignore
//! let mut lifecycle = Lifecycle::new();
//! lifecycle.append(
//!     Hook::new("postgres-pool").on_stop(move |_ctx| async move {
//!         pool.close().await;
//!         Ok(())
//!     }),
//! );
//!
//! lifecycle.start(Duration::from_secs(15)).await?;
//! // ... serve ...
//! lifecycle.stop(Duration::from_secs(15)).await?;
//! ```

use crate::BoxError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Future returned by hook closures.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

type StartFn = Box<dyn FnOnce() -> HookFuture + Send>;
type StopFn = Box<dyn FnOnce(StopContext) -> HookFuture + Send>;

/// Context handed to stop hooks.
#[derive(Debug, Clone, Copy)]
pub struct StopContext {
    deadline: Instant,
}

impl StopContext {
    /// Create a context with the given deadline.
    #[must_use]
    pub const fn new(deadline: Instant) -> Self {
        Self { deadline }
    }

    /// Instant by which every stop hook must have returned.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline (zero once passed).
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A named pair of one-shot start/stop callbacks.
pub struct Hook {
    name: String,
    on_start: Option<StartFn>,
    on_stop: Option<StopFn>,
}

impl Hook {
    /// Create a hook with no callbacks.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_start: None,
            on_stop: None,
        }
    }

    /// Set the start callback.
    #[must_use]
    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move || Box::pin(f())));
        self
    }

    /// Set the stop callback.
    #[must_use]
    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(StopContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_stop = Some(Box::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Hook name used in logs and errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

/// A single hook failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    /// Hook name
    pub hook: String,
    /// Failure description
    pub reason: String,
}

impl fmt::Display for HookFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.hook, self.reason)
    }
}

/// Lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// A start hook failed; hooks started before it were stopped again.
    #[error("start hook {hook} failed: {reason}")]
    StartFailed {
        /// Hook name
        hook: String,
        /// Failure description
        reason: String,
    },

    /// One or more stop hooks failed or missed the deadline.
    #[error("stop failed: {}", join_failures(.0))]
    StopFailed(Vec<HookFailure>),

    /// `start` was called twice.
    #[error("lifecycle already started")]
    AlreadyStarted,
}

fn join_failures(failures: &[HookFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ordered collection of hooks.
#[derive(Debug, Default)]
pub struct Lifecycle {
    hooks: Vec<Hook>,
    started: usize,
    has_started: bool,
}

impl Lifecycle {
    /// Create an empty lifecycle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook.
    pub fn append(&mut self, hook: Hook) {
        tracing::debug!(hook = %hook.name, "Registered lifecycle hook");
        self.hooks.push(hook);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run start hooks in append order.
    ///
    /// All hooks share one deadline of `timeout` from now. On the first
    /// failure the hooks already started are stopped in reverse order.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StartFailed`] naming the failing hook, or
    /// [`LifecycleError::AlreadyStarted`] on a second call.
    pub async fn start(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        if self.has_started {
            return Err(LifecycleError::AlreadyStarted);
        }
        self.has_started = true;

        let deadline = Instant::now() + timeout;
        for index in 0..self.hooks.len() {
            let hook = &mut self.hooks[index];
            let Some(on_start) = hook.on_start.take() else {
                self.started = index + 1;
                continue;
            };

            let name = hook.name.clone();
            let outcome = match tokio::time::timeout_at(deadline, on_start()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {timeout:?}")),
            };

            match outcome {
                Ok(()) => {
                    tracing::debug!(hook = %name, "Lifecycle hook started");
                    self.started = index + 1;
                },
                Err(reason) => {
                    tracing::error!(
                        hook = %name,
                        error = %reason,
                        "Lifecycle hook failed to start, rolling back"
                    );
                    if let Err(rollback) = self.run_stop_hooks(timeout).await {
                        tracing::error!(
                            error = %rollback,
                            "Rollback after failed start was incomplete"
                        );
                    }
                    return Err(LifecycleError::StartFailed { hook: name, reason });
                },
            }
        }

        tracing::info!(hooks = self.hooks.len(), "Lifecycle started");
        Ok(())
    }

    /// Run stop hooks of started hooks in reverse append order.
    ///
    /// Every hook receives a [`StopContext`] with the shared deadline. A hook
    /// still running at the deadline is abandoned and reported as failed;
    /// the remaining hooks still run.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StopFailed`] listing every failed hook.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        let result = self.run_stop_hooks(timeout).await;
        match &result {
            Ok(()) => tracing::info!("Lifecycle stopped"),
            Err(e) => tracing::error!(error = %e, "Lifecycle stopped with errors"),
        }
        result
    }

    async fn run_stop_hooks(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        let ctx = StopContext::new(Instant::now() + timeout);
        let mut failures = Vec::new();

        for hook in self.hooks[..self.started].iter_mut().rev() {
            let Some(on_stop) = hook.on_stop.take() else {
                continue;
            };
            match tokio::time::timeout_at(ctx.deadline(), on_stop(ctx)).await {
                Ok(Ok(())) => tracing::debug!(hook = %hook.name, "Lifecycle hook stopped"),
                Ok(Err(e)) => {
                    tracing::warn!(hook = %hook.name, error = %e, "Lifecycle hook failed to stop");
                    failures.push(HookFailure {
                        hook: hook.name.clone(),
                        reason: e.to_string(),
                    });
                },
                Err(_) => {
                    tracing::warn!(hook = %hook.name, "Lifecycle hook missed the stop deadline");
                    failures.push(HookFailure {
                        hook: hook.name.clone(),
                        reason: format!("timed out after {timeout:?}"),
                    });
                },
            }
        }
        self.started = 0;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::StopFailed(failures))
        }
    }
}
