//! SQL data-access handle abstraction.
//!
//! The [`Database`] trait is the narrow interface between application code
//! and a concrete SQL driver. A driver crate (for example `enclave-postgres`)
//! provides the raw handle; [`compose`] wraps it with the cross-cutting
//! behaviors selected by configuration:
//!
//! - [`TxPropagator`]: routes each operation through the ambient transaction
//!   carried by the [`Context`], optionally opening one per operation
//! - [`QueryLogger`]: records every operation once, outermost
//!
//! [`TxManager`] opens transactions and binds them to a [`Context`] so that
//! every operation performed with that context joins the transaction.
//!
//! # Example
//!
//! ```ignore
//! let tx = TxManager::new(db.clone(), TxOptions::default());
//! tx.run(&Context::new(), |ctx| {
//!     let db = db.clone();
//!     async move {
//!         let order = Query::new("INSERT INTO orders (id) VALUES ($1)").bind(42_i64);
//!         db.execute(&ctx, &order).await?;
//!         let outbox = Query::new("INSERT INTO outbox (order_id) VALUES ($1)").bind(42_i64);
//!         db.execute(&ctx, &outbox).await?;
//!         Ok::<_, SqlError>(())
//!     }
//! })
//! .await?;
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod decorator;
pub mod tx;

pub use decorator::{ComposeOptions, ComposedDatabase, Layer, QueryLogger, TxPropagator, compose};
pub use tx::TxManager;

/// Errors raised by SQL handles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    /// Could not obtain a connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// The statement failed.
    #[error("query error: {0}")]
    Query(String),

    /// Begin, commit or rollback failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already completed")]
    TransactionCompleted,

    /// A column value could not be converted.
    #[error("decode error: {0}")]
    Decode(String),

    /// The driver does not support the requested feature.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// A driver-neutral SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer type
    Int(i64),
    /// Any floating point type
    Float(f64),
    /// Text, including UUIDs and timestamps rendered as strings
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// JSON document
    Json(serde_json::Value),
}

impl SqlValue {
    /// Whether the value is `NULL`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer value, if this is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean value, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value, if this is a float.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if this is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Byte value, if this is binary data.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A statement with positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    sql: String,
    params: Vec<SqlValue>,
}

impl Query {
    /// Create a statement without parameters.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Statement text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bound parameters in order.
    #[must_use]
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }
}

/// A result row with named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    /// Create an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(name, value);
        self
    }

    /// Append a column in place.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<SqlValue>) {
        self.columns.push((name.into(), value.into()));
    }

    /// Look up a column by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Column names in order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Result of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Rows inserted, updated or deleted
    pub rows_affected: u64,
}

/// Transaction isolation level.
///
/// The numeric values match `SQL_TX_CONTEXT_ISOLATION_LEVEL`. Drivers reject
/// levels they cannot honor with [`SqlError::Unsupported`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Driver default
    #[default]
    Default,
    /// Read uncommitted
    ReadUncommitted,
    /// Read committed
    ReadCommitted,
    /// Write committed
    WriteCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Snapshot
    Snapshot,
    /// Serializable
    Serializable,
    /// Linearizable
    Linearizable,
}

impl IsolationLevel {
    /// Level for a numeric configuration value (0 to 7).
    #[must_use]
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Default),
            1 => Some(Self::ReadUncommitted),
            2 => Some(Self::ReadCommitted),
            3 => Some(Self::WriteCommitted),
            4 => Some(Self::RepeatableRead),
            5 => Some(Self::Snapshot),
            6 => Some(Self::Serializable),
            7 => Some(Self::Linearizable),
            _ => None,
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::ReadUncommitted => "Read Uncommitted",
            Self::ReadCommitted => "Read Committed",
            Self::WriteCommitted => "Write Committed",
            Self::RepeatableRead => "Repeatable Read",
            Self::Snapshot => "Snapshot",
            Self::Serializable => "Serializable",
            Self::Linearizable => "Linearizable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for opening a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Isolation level
    pub isolation: IsolationLevel,
    /// Open the transaction read-only
    pub read_only: bool,
}

/// An open transaction.
///
/// `commit` and `rollback` take `&self` so a transaction can be shared through
/// a [`Context`]; once either completes, every further call fails with
/// [`SqlError::TransactionCompleted`].
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a statement inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] if the statement fails or the transaction completed.
    async fn execute(&self, query: &Query) -> Result<ExecResult, SqlError>;

    /// Run a query inside the transaction and collect all rows.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] if the query fails or the transaction completed.
    async fn fetch_all(&self, query: &Query) -> Result<Vec<Row>, SqlError>;

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] if the commit fails or the transaction completed.
    async fn commit(&self) -> Result<(), SqlError>;

    /// Roll the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] if the rollback fails or the transaction completed.
    async fn rollback(&self) -> Result<(), SqlError>;
}

/// A data-access handle.
///
/// Implemented by raw driver handles and by the decorators in this module,
/// so a composed handle is interchangeable with the raw one.
#[async_trait]
pub trait Database: Send + Sync {
    /// Execute a statement.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] if the statement fails.
    async fn execute(&self, ctx: &Context, query: &Query) -> Result<ExecResult, SqlError>;

    /// Run a query and collect all rows.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] if the query fails.
    async fn fetch_all(&self, ctx: &Context, query: &Query) -> Result<Vec<Row>, SqlError>;

    /// Run a query and return the first row, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] if the query fails.
    async fn fetch_optional(&self, ctx: &Context, query: &Query) -> Result<Option<Row>, SqlError> {
        Ok(self.fetch_all(ctx, query).await?.into_iter().next())
    }

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] if the transaction cannot be opened.
    async fn begin(&self, options: &TxOptions) -> Result<Arc<dyn Transaction>, SqlError>;
}

#[async_trait]
impl<T: Database + ?Sized> Database for Arc<T> {
    async fn execute(&self, ctx: &Context, query: &Query) -> Result<ExecResult, SqlError> {
        (**self).execute(ctx, query).await
    }

    async fn fetch_all(&self, ctx: &Context, query: &Query) -> Result<Vec<Row>, SqlError> {
        (**self).fetch_all(ctx, query).await
    }

    async fn begin(&self, options: &TxOptions) -> Result<Arc<dyn Transaction>, SqlError> {
        (**self).begin(options).await
    }
}

/// Operation context.
///
/// Carries the ambient transaction, if one was opened for this unit of work.
/// Cloning is cheap; clones share the same transaction.
#[derive(Clone, Default)]
pub struct Context {
    transaction: Option<Arc<dyn Transaction>>,
}

impl Context {
    /// A context without a transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context bound to `transaction`.
    #[must_use]
    pub fn with_transaction(&self, transaction: Arc<dyn Transaction>) -> Self {
        Self {
            transaction: Some(transaction),
        }
    }

    /// The ambient transaction, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("in_transaction", &self.transaction.is_some())
            .finish()
    }
}
