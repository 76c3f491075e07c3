//! Declarative application builder.
//!
//! The builder follows a fixed, two-phase order:
//!
//! 1. **Configure**: read every enabled configuration group. Nothing is
//!    constructed if any group is missing or invalid.
//! 2. **Construct**: identity, SQL module, messaging clients, controllers and
//!    lifecycle hooks, always in the same static order. Controller factories
//!    run once the SQL module and messaging clients exist, so a controller can
//!    hold the composed database handle, the transaction manager or the writer.
//!
//! # Example
//!
//! ```rust,ignore
//! ApplicationBuilder::new()
//!     .with_postgres()
//!     .with_kafka_events()
//!     .with_controller_factory(|resources| {
//!         let sql = resources.sql.as_ref().expect("postgres enabled");
//!         Arc::new(OrderController::new(sql.tx.clone(), resources.writer.clone()))
//!     })
//!     .build()
//!     .await?
//!     .run()
//!     .await?;
//! ```

use crate::application::{Application, Resources};
use crate::logging::LoggingConfig;
use enclave_core::config::{ConfigError, EnvReader, EnvSource, FromEnv, ProcessEnv};
use enclave_core::lifecycle::{Hook, Lifecycle, LifecycleError};
use enclave_core::sql::SqlError;
use enclave_core::stream::{
    Controller, ReaderManager, StreamError, Writer, register_controllers, supervise,
};
use enclave_core::{AppConfig, AppIdentity};
use enclave_kafka::{
    KafkaClientError, ReaderManagerConfig, TxWriterClientConfig, WriterClientConfig,
};
use enclave_postgres::{SqlConfig, SqlModule};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while assembling or running an application.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// A configuration group is missing or invalid.
    #[error("invalid {resource} configuration: {source}")]
    Config {
        /// Configuration group
        resource: &'static str,
        /// Underlying error
        #[source]
        source: ConfigError,
    },

    /// The SQL module could not be set up.
    #[error("failed to set up sql: {0}")]
    Sql(#[source] SqlError),

    /// A messaging client could not be created.
    #[error("failed to set up kafka: {0}")]
    Kafka(#[source] KafkaClientError),

    /// A controller failed to register its subscriptions.
    #[error("failed to register controllers: {0}")]
    Controllers(#[source] StreamError),

    /// Starting or stopping the lifecycle failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

fn config<T: FromEnv>(env: &EnvReader<'_>, resource: &'static str) -> Result<T, BootstrapError> {
    T::from_reader(env).map_err(|source| BootstrapError::Config { resource, source })
}

/// Lifecycle deadlines.
///
/// | Key | Default |
/// |---|---|
/// | `ENCLAVE_START_TIMEOUT` | `15s` |
/// | `ENCLAVE_STOP_TIMEOUT` | `15s` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Deadline shared by all start hooks
    pub start_timeout: Duration,
    /// Deadline shared by all stop hooks
    pub stop_timeout: Duration,
}

impl FromEnv for RuntimeConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            start_timeout: env.duration_or("ENCLAVE_START_TIMEOUT", Duration::from_secs(15))?,
            stop_timeout: env.duration_or("ENCLAVE_STOP_TIMEOUT", Duration::from_secs(15))?,
        })
    }
}

/// Messaging variant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventsMode {
    /// Sync writer and reader manager
    Plain,
    /// Transactional writer and read-committed reader manager
    Transactional,
}

enum EventsConfig {
    Plain(WriterClientConfig, ReaderManagerConfig),
    Transactional(TxWriterClientConfig, ReaderManagerConfig),
}

type ControllerFactory = Box<dyn FnOnce(&Resources) -> Arc<dyn Controller> + Send>;

/// A controller, or how to build one from the assembled resources.
enum ControllerEntry {
    Ready(Arc<dyn Controller>),
    Factory(ControllerFactory),
}

/// Builder for an [`Application`].
pub struct ApplicationBuilder {
    env: Box<dyn EnvSource>,
    postgres: bool,
    events: Option<EventsMode>,
    controllers: Vec<ControllerEntry>,
    hooks: Vec<Hook>,
    start_timeout: Option<Duration>,
    stop_timeout: Option<Duration>,
}

impl ApplicationBuilder {
    /// A builder reading the process environment, with no resources enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            env: Box::new(ProcessEnv),
            postgres: false,
            events: None,
            controllers: Vec::new(),
            hooks: Vec::new(),
            start_timeout: None,
            stop_timeout: None,
        }
    }

    /// Read configuration from `source` instead of the process environment.
    #[must_use]
    pub fn with_env_source(mut self, source: impl EnvSource + 'static) -> Self {
        self.env = Box::new(source);
        self
    }

    /// Enable the Postgres SQL module (`SQL_*`).
    #[must_use]
    pub const fn with_postgres(mut self) -> Self {
        self.postgres = true;
        self
    }

    /// Enable Kafka events: a sync writer and a reader manager.
    #[must_use]
    pub const fn with_kafka_events(mut self) -> Self {
        self.events = Some(EventsMode::Plain);
        self
    }

    /// Enable transactional Kafka events: a transactional writer and a
    /// read-committed reader manager.
    #[must_use]
    pub const fn with_kafka_tx_events(mut self) -> Self {
        self.events = Some(EventsMode::Transactional);
        self
    }

    /// Add controllers; they register with the reader manager in order.
    #[must_use]
    pub fn with_controllers(
        mut self,
        controllers: impl IntoIterator<Item = Arc<dyn Controller>>,
    ) -> Self {
        self.controllers.extend(controllers.into_iter().map(ControllerEntry::Ready));
        self
    }

    /// Add a single controller.
    #[must_use]
    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controllers.push(ControllerEntry::Ready(controller));
        self
    }

    /// Add a controller built from the assembled [`Resources`].
    ///
    /// The factory runs during [`build`](Self::build), after the SQL module
    /// and messaging clients exist and before any subscription is registered.
    /// It keeps its place in registration order among the other controllers,
    /// and is not called when Kafka events are disabled.
    #[must_use]
    pub fn with_controller_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&Resources) -> Arc<dyn Controller> + Send + 'static,
    {
        self.controllers.push(ControllerEntry::Factory(Box::new(factory)));
        self
    }

    /// Add an application hook, started after the built-in resources and
    /// stopped before them.
    #[must_use]
    pub fn with_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Logging settings read from this builder's environment source.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] for resource `"logging"` if
    /// `RUST_LOG` or `LOG_FORMAT` is invalid.
    pub fn logging_config(&self) -> Result<LoggingConfig, BootstrapError> {
        config(&EnvReader::new(self.env.as_ref()), "logging")
    }

    /// Override `ENCLAVE_START_TIMEOUT`.
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    /// Override `ENCLAVE_STOP_TIMEOUT`.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Assemble the application.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::Config`] if an enabled configuration group is
    ///   invalid; nothing has been constructed in that case
    /// - [`BootstrapError::Sql`] if the database is unreachable
    /// - [`BootstrapError::Kafka`] if a messaging client cannot be created
    /// - [`BootstrapError::Controllers`] if a controller fails to register
    pub async fn build(self) -> Result<Application, BootstrapError> {
        let env = EnvReader::new(self.env.as_ref());

        let app_config: AppConfig = config(&env, "application")?;
        let runtime: RuntimeConfig = config(&env, "runtime")?;
        let sql_config: Option<SqlConfig> = if self.postgres {
            Some(config(&env, "sql")?)
        } else {
            None
        };
        let events_config = match self.events {
            None => None,
            Some(EventsMode::Plain) => Some(EventsConfig::Plain(
                config(&env, "kafka")?,
                config(&env, "kafka")?,
            )),
            Some(EventsMode::Transactional) => Some(EventsConfig::Transactional(
                config(&env, "kafka")?,
                config(&env, "kafka")?,
            )),
        };

        let identity = AppIdentity::from_config(&app_config);
        identity.log_startup();
        let mut lifecycle = Lifecycle::new();

        let sql = match &sql_config {
            Some(sql_config) => Some(
                SqlModule::connect(sql_config, &mut lifecycle)
                    .await
                    .map_err(BootstrapError::Sql)?,
            ),
            None => None,
        };

        let (writer, reader_manager) = match &events_config {
            Some(events) => {
                let (writer, manager) = build_events(events, &identity, &mut lifecycle)?;
                (Some(writer), Some(manager))
            },
            None => (None, None),
        };

        let resources = Resources {
            identity,
            sql,
            writer,
            reader_manager,
        };

        match &resources.reader_manager {
            Some(manager) => {
                let controllers: Vec<Arc<dyn Controller>> = self
                    .controllers
                    .into_iter()
                    .map(|entry| match entry {
                        ControllerEntry::Ready(controller) => controller,
                        ControllerEntry::Factory(factory) => factory(&resources),
                    })
                    .collect();
                register_controllers(&controllers, manager).map_err(BootstrapError::Controllers)?;
                supervise(&mut lifecycle, Arc::clone(manager));
            },
            None if !self.controllers.is_empty() => {
                tracing::warn!(
                    controllers = self.controllers.len(),
                    "Controllers ignored: Kafka events are not enabled"
                );
            },
            None => {},
        }

        for hook in self.hooks {
            lifecycle.append(hook);
        }

        Ok(Application::new(
            resources,
            lifecycle,
            self.start_timeout.unwrap_or(runtime.start_timeout),
            self.stop_timeout.unwrap_or(runtime.stop_timeout),
        ))
    }
}

fn build_events(
    events: &EventsConfig,
    identity: &AppIdentity,
    lifecycle: &mut Lifecycle,
) -> Result<(Arc<dyn Writer>, Arc<ReaderManager>), BootstrapError> {
    let (writer, manager): (Arc<dyn Writer>, ReaderManager) = match events {
        EventsConfig::Plain(writer, reader) => (
            Arc::new(
                enclave_kafka::new_writer(writer, identity, lifecycle)
                    .map_err(BootstrapError::Kafka)?,
            ),
            enclave_kafka::new_reader_manager(reader, identity).map_err(BootstrapError::Kafka)?,
        ),
        EventsConfig::Transactional(writer, reader) => (
            Arc::new(
                enclave_kafka::new_tx_writer(writer, identity, lifecycle)
                    .map_err(BootstrapError::Kafka)?,
            ),
            enclave_kafka::new_tx_reader_manager(reader, identity)
                .map_err(BootstrapError::Kafka)?,
        ),
    };
    Ok((writer, Arc::new(manager)))
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ApplicationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationBuilder")
            .field("postgres", &self.postgres)
            .field("events", &self.events)
            .field("controllers", &self.controllers.len())
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use enclave_testing::fixtures::env;

    #[test]
    fn runtime_timeouts_default_to_fifteen_seconds() {
        let config = RuntimeConfig::from_source(&env(&[])).unwrap();
        assert_eq!(config.start_timeout, Duration::from_secs(15));
        assert_eq!(config.stop_timeout, Duration::from_secs(15));

        let source = env(&[("ENCLAVE_STOP_TIMEOUT", "1m30s")]);
        let config = RuntimeConfig::from_source(&source).unwrap();
        assert_eq!(config.stop_timeout, Duration::from_secs(90));
    }

    #[test]
    fn config_errors_name_the_resource() {
        let err = BootstrapError::Config {
            resource: "kafka",
            source: ConfigError::Missing {
                key: "KAFKA_BROKERS".to_string(),
            },
        };
        assert!(err.to_string().starts_with("invalid kafka configuration: "));
        assert!(err.to_string().contains("KAFKA_BROKERS"));
    }
}
