//! # Enclave Testing
//!
//! Testing utilities for Enclave applications.
//!
//! This crate provides:
//! - [`InMemoryDatabase`]: a recording SQL handle with injectable failures
//! - [`InMemorySource`], [`RecordingHandler`], [`InMemoryWriter`]: stream doubles
//! - [`LogCapture`]: a `tracing` layer for asserting on emitted events
//! - [`fixtures`]: environment maps and identities
//!
//! ## Example
//!
//! ```ignore
//! use enclave_testing::{InMemoryDatabase, LogCapture};
//! use enclave_core::sql::{compose, ComposeOptions, Context, Database, Query};
//!
//! #[tokio::test]
//! async fn logs_each_statement_once() {
//!     let logs = LogCapture::new();
//!     let _guard = logs.install();
//!
//!     let raw = InMemoryDatabase::new();
//!     let db = compose(Arc::new(raw), ComposeOptions::default().with_logging(Level::INFO));
//!     db.execute(&Context::new(), &Query::new("DELETE FROM carts")).await.unwrap();
//!
//!     assert_eq!(logs.with_message("SQL operation").len(), 1);
//! }
//! ```

pub mod logs;
pub mod sql;
pub mod stream;

/// Environment and identity fixtures.
pub mod fixtures {
    use enclave_core::AppIdentity;
    use std::collections::HashMap;

    /// Build an environment map from key/value pairs.
    ///
    /// # Example
    ///
    /// ```
    /// use enclave_testing::fixtures::env;
    /// use enclave_core::config::EnvSource;
    ///
    /// let source = env(&[("ENCLAVE_APP_NAME", "orders-svc")]);
    /// assert_eq!(source.var("ENCLAVE_APP_NAME").as_deref(), Some("orders-svc"));
    /// ```
    #[must_use]
    pub fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect()
    }

    /// Identity of instance `0` of application `name`.
    #[must_use]
    pub fn identity(name: &str) -> AppIdentity {
        AppIdentity::new(name, "0")
    }
}

// Re-export commonly used items
pub use logs::{CapturedEvent, LogCapture};
pub use sql::{InMemoryDatabase, InMemoryTransaction, RecordedOp};
pub use stream::{HandlerEvent, InMemorySource, InMemoryWriter, RecordingHandler};
