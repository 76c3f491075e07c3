//! In-memory SQL handle.
//!
//! [`InMemoryDatabase`] executes nothing. It records every operation, tracks
//! transactions and can be told to fail, which is all the decorator and
//! transaction-manager tests need.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use enclave_core::sql::{
    Context, Database, ExecResult, Query, Row, SqlError, Transaction, TxOptions,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// An operation seen by [`InMemoryDatabase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOp {
    /// `"execute"` or `"fetch_all"`
    pub kind: &'static str,
    /// Statement text
    pub sql: String,
    /// Id of the transaction it ran in, if any
    pub tx: Option<u64>,
}

#[derive(Debug, Default)]
struct DbState {
    ops: Vec<RecordedOp>,
    begun: Vec<TxOptions>,
    commits: usize,
    rollbacks: usize,
    failing: Vec<String>,
    fail_begin: bool,
    fail_commit: bool,
    rows: HashMap<String, Vec<Row>>,
}

impl DbState {
    fn run(&mut self, kind: &'static str, query: &Query, tx: Option<u64>) -> Result<(), SqlError> {
        self.ops.push(RecordedOp {
            kind,
            sql: query.sql().to_string(),
            tx,
        });
        if self.failing.iter().any(|pattern| query.sql().contains(pattern.as_str())) {
            return Err(SqlError::Query(format!("forced failure: {}", query.sql())));
        }
        Ok(())
    }

    fn rows_for(&self, query: &Query) -> Vec<Row> {
        self.rows.get(query.sql()).cloned().unwrap_or_default()
    }
}

/// Recording SQL handle.
///
/// # Example
///
/// ```
/// use enclave_testing::InMemoryDatabase;
/// use enclave_core::sql::{Context, Database, Query};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let db = InMemoryDatabase::new();
/// db.execute(&Context::new(), &Query::new("DELETE FROM carts")).await?;
/// assert_eq!(db.ops().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<DbState>>,
}

impl InMemoryDatabase {
    /// Create an empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement containing `pattern`.
    #[must_use]
    pub fn failing_on(self, pattern: impl Into<String>) -> Self {
        self.state.lock().unwrap().failing.push(pattern.into());
        self
    }

    /// Fail every `begin`.
    #[must_use]
    pub fn failing_begin(self) -> Self {
        self.state.lock().unwrap().fail_begin = true;
        self
    }

    /// Fail every `commit`.
    #[must_use]
    pub fn failing_commit(self) -> Self {
        self.state.lock().unwrap().fail_commit = true;
        self
    }

    /// Rows returned for the exact statement `sql`.
    #[must_use]
    pub fn with_rows(self, sql: impl Into<String>, rows: Vec<Row>) -> Self {
        self.state.lock().unwrap().rows.insert(sql.into(), rows);
        self
    }

    /// Operations seen so far.
    #[must_use]
    pub fn ops(&self) -> Vec<RecordedOp> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Number of transactions opened.
    #[must_use]
    pub fn begins(&self) -> usize {
        self.state.lock().unwrap().begun.len()
    }

    /// Options of every transaction opened, in order.
    #[must_use]
    pub fn begun_with(&self) -> Vec<TxOptions> {
        self.state.lock().unwrap().begun.clone()
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    /// Number of rollbacks.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn execute(&self, _ctx: &Context, query: &Query) -> Result<ExecResult, SqlError> {
        self.state.lock().unwrap().run("execute", query, None)?;
        Ok(ExecResult { rows_affected: 1 })
    }

    async fn fetch_all(&self, _ctx: &Context, query: &Query) -> Result<Vec<Row>, SqlError> {
        let mut state = self.state.lock().unwrap();
        state.run("fetch_all", query, None)?;
        Ok(state.rows_for(query))
    }

    async fn begin(&self, options: &TxOptions) -> Result<Arc<dyn Transaction>, SqlError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_begin {
            return Err(SqlError::Connection("forced begin failure".to_string()));
        }
        state.begun.push(*options);
        let id = state.begun.len() as u64;
        Ok(Arc::new(InMemoryTransaction {
            id,
            state: Arc::clone(&self.state),
            completed: AtomicBool::new(false),
        }))
    }
}

/// Transaction of an [`InMemoryDatabase`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: u64,
    state: Arc<Mutex<DbState>>,
    completed: AtomicBool,
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> Result<(), SqlError> {
        if self.completed.load(Ordering::Acquire) {
            Err(SqlError::TransactionCompleted)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn execute(&self, query: &Query) -> Result<ExecResult, SqlError> {
        self.ensure_open()?;
        self.state.lock().unwrap().run("execute", query, Some(self.id))?;
        Ok(ExecResult { rows_affected: 1 })
    }

    async fn fetch_all(&self, query: &Query) -> Result<Vec<Row>, SqlError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.run("fetch_all", query, Some(self.id))?;
        Ok(state.rows_for(query))
    }

    async fn commit(&self) -> Result<(), SqlError> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Err(SqlError::TransactionCompleted);
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_commit {
            state.rollbacks += 1;
            return Err(SqlError::Transaction("forced commit failure".to_string()));
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), SqlError> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Err(SqlError::TransactionCompleted);
        }
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_transactions_reject_further_use() {
        let db = InMemoryDatabase::new();
        let tx = db.begin(&TxOptions::default()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(tx.rollback().await, Err(SqlError::TransactionCompleted));
        assert_eq!(
            tx.execute(&Query::new("SELECT 1")).await,
            Err(SqlError::TransactionCompleted)
        );
        assert_eq!(db.commits(), 1);
        assert_eq!(db.rollbacks(), 0);
    }

    #[tokio::test]
    async fn forced_failures_are_recorded() {
        let db = InMemoryDatabase::new().failing_on("orders");
        let err = db
            .execute(&Context::new(), &Query::new("UPDATE orders SET paid = true"))
            .await
            .unwrap_err();
        assert!(matches!(err, SqlError::Query(_)));
        assert_eq!(db.ops().len(), 1);
    }
}
