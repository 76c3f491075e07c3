//! Transaction manager binding transactions to a [`Context`].

use super::{Context, Database, SqlError, TxOptions};
use std::future::Future;
use std::sync::Arc;

/// Runs units of work inside a transaction.
///
/// The closure receives a [`Context`] carrying the transaction; handles
/// composed with transaction propagation route every operation made with
/// that context through it.
#[derive(Clone)]
pub struct TxManager {
    db: Arc<dyn Database>,
    options: TxOptions,
}

impl TxManager {
    /// Create a manager opening transactions on `db` with `options`.
    #[must_use]
    pub fn new(db: Arc<dyn Database>, options: TxOptions) -> Self {
        Self { db, options }
    }

    /// Default options for transactions opened by [`TxManager::run`].
    #[must_use]
    pub const fn options(&self) -> TxOptions {
        self.options
    }

    /// Run `work` inside a transaction.
    ///
    /// If `ctx` already carries a transaction, `work` joins it and the outer
    /// owner decides the outcome. Otherwise a transaction is opened, committed
    /// when `work` returns `Ok` and rolled back when it returns `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, or a [`SqlError`] (converted into `E`)
    /// when the transaction cannot be opened or committed.
    pub async fn run<T, E, F, Fut>(&self, ctx: &Context, work: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SqlError>,
    {
        self.run_with(ctx, self.options, work).await
    }

    /// Like [`TxManager::run`] with explicit options.
    ///
    /// # Errors
    ///
    /// See [`TxManager::run`].
    pub async fn run_with<T, E, F, Fut>(
        &self,
        ctx: &Context,
        options: TxOptions,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SqlError>,
    {
        if ctx.transaction().is_some() {
            return work(ctx.clone()).await;
        }

        let tx = self.db.begin(&options).await?;
        tracing::trace!(
            isolation = %options.isolation,
            read_only = options.read_only,
            "Transaction opened"
        );

        match work(ctx.with_transaction(Arc::clone(&tx))).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            },
        }
    }
}

impl std::fmt::Debug for TxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxManager").field("options", &self.options).finish()
    }
}
