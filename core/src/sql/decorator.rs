//! Data-access handle decorators and their composition.
//!
//! Two behaviors can wrap a raw handle:
//!
//! - [`TxPropagator`] routes operations through the ambient transaction
//! - [`QueryLogger`] records one event per operation
//!
//! The propagator always sits nearer the raw handle and the logger always
//! sits outermost, so every operation is logged exactly once and its timing
//! includes any transaction opened on its behalf. [`ComposedDatabase`] can
//! only express those orders; [`compose`] is the single place that builds it.

use super::{Context, Database, ExecResult, Query, Row, SqlError, Transaction, TxOptions};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;

/// Options selecting the decorators applied by [`compose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComposeOptions {
    /// Wrap with [`QueryLogger`]
    pub enable_logging: bool,
    /// Wrap with [`TxPropagator`]
    pub enable_tx_propagation: bool,
    /// Let the propagator open a transaction when none is ambient
    pub enable_tx_auto_create: bool,
    /// Level of the logger's events
    pub log_level: Level,
    /// Options for auto-created transactions
    pub tx_options: TxOptions,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            enable_logging: false,
            enable_tx_propagation: false,
            enable_tx_auto_create: false,
            log_level: Level::DEBUG,
            tx_options: TxOptions::default(),
        }
    }
}

impl ComposeOptions {
    /// Enable logging at `level`.
    #[must_use]
    pub const fn with_logging(mut self, level: Level) -> Self {
        self.enable_logging = true;
        self.log_level = level;
        self
    }

    /// Enable transaction propagation.
    #[must_use]
    pub const fn with_tx_propagation(mut self, auto_create: bool) -> Self {
        self.enable_tx_propagation = true;
        self.enable_tx_auto_create = auto_create;
        self
    }

    /// Options for auto-created transactions.
    #[must_use]
    pub const fn with_tx_options(mut self, tx_options: TxOptions) -> Self {
        self.tx_options = tx_options;
        self
    }
}

/// One layer of a composed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Query logging at the given level
    Logging {
        /// Event level
        level: Level,
    },
    /// Ambient transaction propagation
    TxPropagation {
        /// Whether a transaction is opened when none is ambient
        auto_create: bool,
    },
    /// The raw driver handle
    Raw,
}

/// Routes operations through the transaction carried by the [`Context`].
///
/// Without an ambient transaction, an operation either runs directly against
/// the inner handle or, with auto-create, inside a transaction opened, used
/// and completed for that single operation.
pub struct TxPropagator<D> {
    inner: D,
    auto_create: bool,
    tx_options: TxOptions,
}

impl<D: Database> TxPropagator<D> {
    /// Wrap `inner`.
    #[must_use]
    pub const fn new(inner: D, auto_create: bool, tx_options: TxOptions) -> Self {
        Self {
            inner,
            auto_create,
            tx_options,
        }
    }

    /// Whether transactions are opened when none is ambient.
    #[must_use]
    pub const fn auto_create(&self) -> bool {
        self.auto_create
    }
}

async fn complete<T>(tx: &dyn Transaction, result: Result<T, SqlError>) -> Result<T, SqlError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        },
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "Rollback of auto-created transaction failed");
            }
            Err(e)
        },
    }
}

#[async_trait]
impl<D: Database> Database for TxPropagator<D> {
    async fn execute(&self, ctx: &Context, query: &Query) -> Result<ExecResult, SqlError> {
        if let Some(tx) = ctx.transaction() {
            return tx.execute(query).await;
        }
        if !self.auto_create {
            return self.inner.execute(ctx, query).await;
        }
        let tx = self.inner.begin(&self.tx_options).await?;
        let result = tx.execute(query).await;
        complete(tx.as_ref(), result).await
    }

    async fn fetch_all(&self, ctx: &Context, query: &Query) -> Result<Vec<Row>, SqlError> {
        if let Some(tx) = ctx.transaction() {
            return tx.fetch_all(query).await;
        }
        if !self.auto_create {
            return self.inner.fetch_all(ctx, query).await;
        }
        let tx = self.inner.begin(&self.tx_options).await?;
        let result = tx.fetch_all(query).await;
        complete(tx.as_ref(), result).await
    }

    async fn begin(&self, options: &TxOptions) -> Result<Arc<dyn Transaction>, SqlError> {
        self.inner.begin(options).await
    }
}

/// Records each operation with its statement, duration and outcome.
///
/// Successful operations are logged at the configured level, failures at
/// `ERROR`. Transactions returned by `begin` are not wrapped, so statements
/// run through a transaction are observed by the propagator's caller, not
/// twice.
pub struct QueryLogger<D> {
    inner: D,
    level: Level,
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        if $level == Level::ERROR {
            tracing::error!($($arg)+);
        } else if $level == Level::WARN {
            tracing::warn!($($arg)+);
        } else if $level == Level::INFO {
            tracing::info!($($arg)+);
        } else if $level == Level::DEBUG {
            tracing::debug!($($arg)+);
        } else {
            tracing::trace!($($arg)+);
        }
    };
}

impl<D: Database> QueryLogger<D> {
    /// Wrap `inner`, logging at `level`.
    #[must_use]
    pub const fn new(inner: D, level: Level) -> Self {
        Self { inner, level }
    }

    /// Configured level.
    #[must_use]
    pub const fn level(&self) -> Level {
        self.level
    }

    fn record<T>(
        &self,
        operation: &'static str,
        sql: &str,
        started: Instant,
        result: &Result<T, SqlError>,
    ) {
        let elapsed = started.elapsed();
        #[allow(clippy::cast_possible_truncation)] // durations in ms fit in u64
        let duration_ms = elapsed.as_millis() as u64;

        match result {
            Ok(_) => {
                log_at!(self.level, operation, sql, duration_ms, outcome = "ok", "SQL operation");
            },
            Err(e) => {
                tracing::error!(
                    operation,
                    sql,
                    duration_ms,
                    outcome = "error",
                    error = %e,
                    "SQL operation"
                );
            },
        }

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::histogram!(
            "sql.operation.duration",
            "operation" => operation,
            "outcome" => outcome
        )
        .record(elapsed.as_secs_f64());
    }
}

#[async_trait]
impl<D: Database> Database for QueryLogger<D> {
    async fn execute(&self, ctx: &Context, query: &Query) -> Result<ExecResult, SqlError> {
        let started = Instant::now();
        let result = self.inner.execute(ctx, query).await;
        self.record("execute", query.sql(), started, &result);
        result
    }

    async fn fetch_all(&self, ctx: &Context, query: &Query) -> Result<Vec<Row>, SqlError> {
        let started = Instant::now();
        let result = self.inner.fetch_all(ctx, query).await;
        self.record("fetch_all", query.sql(), started, &result);
        result
    }

    async fn begin(&self, options: &TxOptions) -> Result<Arc<dyn Transaction>, SqlError> {
        let started = Instant::now();
        let result = self.inner.begin(options).await;
        self.record("begin", "BEGIN", started, &result);
        result
    }
}

/// A raw handle with its decorators, in the only legal orders.
pub enum ComposedDatabase {
    /// No decorators
    Raw(Arc<dyn Database>),
    /// Propagation only
    Propagated(TxPropagator<Arc<dyn Database>>),
    /// Logging only
    Logged(QueryLogger<Arc<dyn Database>>),
    /// Logging outside propagation
    LoggedPropagated(QueryLogger<TxPropagator<Arc<dyn Database>>>),
}

impl ComposedDatabase {
    /// Layers from outermost to the raw handle.
    #[must_use]
    pub fn layers(&self) -> Vec<Layer> {
        match self {
            Self::Raw(_) => vec![Layer::Raw],
            Self::Propagated(p) => vec![
                Layer::TxPropagation {
                    auto_create: p.auto_create(),
                },
                Layer::Raw,
            ],
            Self::Logged(l) => vec![Layer::Logging { level: l.level() }, Layer::Raw],
            Self::LoggedPropagated(l) => vec![
                Layer::Logging { level: l.level() },
                Layer::TxPropagation {
                    auto_create: l.inner.auto_create(),
                },
                Layer::Raw,
            ],
        }
    }

    /// Share the composed handle.
    #[must_use]
    pub fn into_shared(self) -> Arc<dyn Database> {
        match self {
            Self::Raw(raw) => raw,
            other => Arc::new(other),
        }
    }
}

impl std::fmt::Debug for ComposedDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ComposedDatabase").field(&self.layers()).finish()
    }
}

#[async_trait]
impl Database for ComposedDatabase {
    async fn execute(&self, ctx: &Context, query: &Query) -> Result<ExecResult, SqlError> {
        match self {
            Self::Raw(db) => db.execute(ctx, query).await,
            Self::Propagated(db) => db.execute(ctx, query).await,
            Self::Logged(db) => db.execute(ctx, query).await,
            Self::LoggedPropagated(db) => db.execute(ctx, query).await,
        }
    }

    async fn fetch_all(&self, ctx: &Context, query: &Query) -> Result<Vec<Row>, SqlError> {
        match self {
            Self::Raw(db) => db.fetch_all(ctx, query).await,
            Self::Propagated(db) => db.fetch_all(ctx, query).await,
            Self::Logged(db) => db.fetch_all(ctx, query).await,
            Self::LoggedPropagated(db) => db.fetch_all(ctx, query).await,
        }
    }

    async fn begin(&self, options: &TxOptions) -> Result<Arc<dyn Transaction>, SqlError> {
        match self {
            Self::Raw(db) => db.begin(options).await,
            Self::Propagated(db) => db.begin(options).await,
            Self::Logged(db) => db.begin(options).await,
            Self::LoggedPropagated(db) => db.begin(options).await,
        }
    }
}

/// Wrap `raw` with the decorators selected by `options`.
///
/// With neither logging nor propagation enabled the raw handle is returned
/// unchanged. Composition itself never fails.
#[must_use]
pub fn compose(raw: Arc<dyn Database>, options: ComposeOptions) -> ComposedDatabase {
    let propagate = |raw| TxPropagator::new(raw, options.enable_tx_auto_create, options.tx_options);

    match (options.enable_logging, options.enable_tx_propagation) {
        (false, false) => ComposedDatabase::Raw(raw),
        (false, true) => ComposedDatabase::Propagated(propagate(raw)),
        (true, false) => ComposedDatabase::Logged(QueryLogger::new(raw, options.log_level)),
        (true, true) => {
            ComposedDatabase::LoggedPropagated(QueryLogger::new(propagate(raw), options.log_level))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    #[async_trait]
    impl Database for Unreachable {
        async fn execute(&self, _: &Context, _: &Query) -> Result<ExecResult, SqlError> {
            Err(SqlError::Connection("unreachable".into()))
        }

        async fn fetch_all(&self, _: &Context, _: &Query) -> Result<Vec<Row>, SqlError> {
            Err(SqlError::Connection("unreachable".into()))
        }

        async fn begin(&self, _: &TxOptions) -> Result<Arc<dyn Transaction>, SqlError> {
            Err(SqlError::Connection("unreachable".into()))
        }
    }

    #[test]
    fn layers_follow_flags() {
        let raw: Arc<dyn Database> = Arc::new(Unreachable);

        assert_eq!(compose(Arc::clone(&raw), ComposeOptions::default()).layers(), vec![Layer::Raw]);
        assert_eq!(
            compose(
                Arc::clone(&raw),
                ComposeOptions::default()
                    .with_logging(Level::INFO)
                    .with_tx_propagation(true)
            )
            .layers(),
            vec![
                Layer::Logging { level: Level::INFO },
                Layer::TxPropagation { auto_create: true },
                Layer::Raw
            ]
        );
    }

    #[test]
    fn raw_composition_is_the_same_handle() {
        let raw: Arc<dyn Database> = Arc::new(Unreachable);
        let shared = compose(Arc::clone(&raw), ComposeOptions::default()).into_shared();
        assert!(Arc::ptr_eq(&raw, &shared));
    }
}
