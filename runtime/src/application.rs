//! Application lifecycle and graceful shutdown.
//!
//! An [`Application`] owns the resources assembled by the
//! [`ApplicationBuilder`](crate::ApplicationBuilder) and the [`Lifecycle`]
//! holding their hooks:
//!
//! 1. **Startup**: start hooks run in registration order (SQL pool, writers,
//!    reader manager, application hooks)
//! 2. **Runtime**: the reader manager consumes in the background until a
//!    shutdown signal arrives
//! 3. **Shutdown**: stop hooks run in reverse order under one deadline
//!
//! # Example
//!
//! ```rust,ignore
//! let app = ApplicationBuilder::new()
//!     .with_postgres()
//!     .with_kafka_tx_events()
//!     .build()
//!     .await?;
//!
//! app.run().await?;
//! ```

use crate::builder::{ApplicationBuilder, BootstrapError};
use crate::logging;
use enclave_core::stream::{ReaderManager, Writer};
use enclave_core::{AppIdentity, Lifecycle};
use enclave_postgres::SqlModule;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Resources built for an application.
///
/// A field is `None` when the corresponding resource was not enabled on the
/// builder.
pub struct Resources {
    /// Identity every client derives its defaults from
    pub identity: AppIdentity,
    /// SQL pool, composed handle and transaction manager
    pub sql: Option<SqlModule>,
    /// Event writer, transactional in Tx events mode
    pub writer: Option<Arc<dyn Writer>>,
    /// Reader manager with every controller registered
    pub reader_manager: Option<Arc<ReaderManager>>,
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("identity", &self.identity)
            .field("sql", &self.sql)
            .field("writer", &self.writer.is_some())
            .field("reader_manager", &self.reader_manager.as_ref().map(|m| m.topics()))
            .finish()
    }
}

/// Assembled application, ready to start.
#[derive(Debug)]
pub struct Application {
    resources: Resources,
    lifecycle: Lifecycle,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl Application {
    pub(crate) const fn new(
        resources: Resources,
        lifecycle: Lifecycle,
        start_timeout: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            resources,
            lifecycle,
            start_timeout,
            stop_timeout,
        }
    }

    /// Resources built for this application.
    #[must_use]
    pub const fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Identity of this instance.
    #[must_use]
    pub const fn identity(&self) -> &AppIdentity {
        &self.resources.identity
    }

    /// Number of registered lifecycle hooks.
    #[must_use]
    pub fn hook_count(&self) -> usize {
        self.lifecycle.len()
    }

    /// Run every start hook.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Lifecycle`] if a hook fails; the hooks already
    /// started have been stopped again.
    pub async fn start(&mut self) -> Result<(), BootstrapError> {
        self.lifecycle.start(self.start_timeout).await?;
        info!(app = %self.resources.identity.instance_name(), "Application started");
        Ok(())
    }

    /// Run every stop hook.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Lifecycle`] listing every hook that failed to
    /// stop.
    pub async fn stop(&mut self) -> Result<(), BootstrapError> {
        self.lifecycle.stop(self.stop_timeout).await?;
        info!(app = %self.resources.identity.instance_name(), "Application stopped");
        Ok(())
    }

    /// Start, wait for Ctrl+C or SIGTERM, then stop.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Lifecycle`] if starting or stopping fails.
    pub async fn run(self) -> Result<(), BootstrapError> {
        self.run_until(shutdown_signal()).await
    }

    /// Start, wait for `signal`, then stop.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Lifecycle`] if starting or stopping fails.
    pub async fn run_until<F>(mut self, signal: F) -> Result<(), BootstrapError>
    where
        F: Future<Output = ()> + Send,
    {
        self.start().await?;
        signal.await;
        info!("Shutdown signal received, stopping application");
        self.stop().await
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
///
/// A signal handler that cannot be installed is logged and never completes,
/// leaving the other one in charge.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

/// Process entry point: load `.env`, initialise logging, build and run.
///
/// Logging settings come from the builder's environment source, like every
/// other configuration group.
///
/// # Errors
///
/// Returns [`BootstrapError::Config`] if the logging configuration is invalid,
/// or any error of [`ApplicationBuilder::build`] and [`Application::run`].
pub async fn run_application(builder: ApplicationBuilder) -> Result<(), BootstrapError> {
    let dotenv = logging::load_dotenv();
    let config = builder.logging_config()?;
    logging::init(&config);
    logging::log_dotenv(&dotenv);

    let app = builder.build().await.inspect_err(|e| {
        error!(error = %e, "Failed to build application");
    })?;
    app.run().await
}
