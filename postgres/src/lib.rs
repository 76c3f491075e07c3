//! `PostgreSQL` data-access handle for Enclave applications.
//!
//! This crate provides the raw [`Database`] handle over a `sqlx` pool and the
//! SQL module assembly used by the composition root:
//!
//! - [`SqlConfig`]: `SQL_*` settings
//! - [`connect`]: opens the pool and registers its stop hook
//! - [`PgDatabase`]: the raw handle
//! - [`SqlModule`]: pool, composed handle and transaction manager together
//!
//! # Example
//!
//! ```ignore
//! use enclave_postgres::{SqlConfig, SqlModule};
//! use enclave_core::{FromEnv, Lifecycle};
//!
//! async fn example(lifecycle: &mut Lifecycle) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SqlConfig::from_env()?;
//!     let sql = SqlModule::connect(&config, lifecycle).await?;
//!     sql.tx.run(&Context::new(), |ctx| async move { /* ... */ Ok::<_, SqlError>(()) }).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod database;

pub use config::SqlConfig;
pub use database::{PgDatabase, PgTransaction, set_transaction_statement};

use enclave_core::lifecycle::{Hook, Lifecycle};
use enclave_core::sql::{Database, Layer, SqlError, TxManager, compose};
use sqlx::PgPool;
use std::sync::Arc;

/// Open the connection pool and register its stop hook.
///
/// The pool is closed once, when the lifecycle stops.
///
/// # Errors
///
/// Returns [`SqlError::Connection`] if the database cannot be reached.
pub async fn connect(config: &SqlConfig, lifecycle: &mut Lifecycle) -> Result<PgPool, SqlError> {
    let pool = config
        .pool_options()
        .connect(&config.connection_string)
        .await
        .map_err(|e| SqlError::Connection(format!("failed to connect: {e}")))?;

    log_pool_info(&pool);

    let closing = pool.clone();
    lifecycle.append(Hook::new("postgres-pool").on_stop(move |_ctx| async move {
        closing.close().await;
        tracing::info!("Postgres pool closed");
        Ok(())
    }));

    Ok(pool)
}

/// Log where the pool points and how it is sized.
pub fn log_pool_info(pool: &PgPool) {
    let connect = pool.connect_options();
    let options = pool.options();
    tracing::info!(
        host = connect.get_host(),
        port = connect.get_port(),
        database = connect.get_database().unwrap_or_default(),
        user = connect.get_username(),
        max_connections = options.get_max_connections(),
        min_connections = options.get_min_connections(),
        "Postgres pool ready"
    );
    metrics::gauge!("sql.pool.max_connections").set(f64::from(options.get_max_connections()));
}

/// The assembled SQL resources.
pub struct SqlModule {
    /// The pool (owned by the lifecycle's stop hook)
    pub pool: PgPool,
    /// The composed handle every caller uses
    pub db: Arc<dyn Database>,
    /// Decorators applied to `db`, outermost first
    pub layers: Vec<Layer>,
    /// Transaction manager over `db`
    pub tx: TxManager,
}

impl SqlModule {
    /// Connect and assemble.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError::Connection`] if the database cannot be reached.
    pub async fn connect(config: &SqlConfig, lifecycle: &mut Lifecycle) -> Result<Self, SqlError> {
        let pool = connect(config, lifecycle).await?;
        Ok(Self::from_pool(pool, config))
    }

    /// Assemble around an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool, config: &SqlConfig) -> Self {
        let composed = compose(Arc::new(PgDatabase::new(pool.clone())), config.compose_options());
        let layers = composed.layers();
        tracing::debug!(layers = ?layers, "SQL handle composed");

        let db = composed.into_shared();
        Self {
            pool,
            tx: TxManager::new(Arc::clone(&db), config.tx_options),
            db,
            layers,
        }
    }
}

impl std::fmt::Debug for SqlModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlModule").field("layers", &self.layers).finish_non_exhaustive()
    }
}
