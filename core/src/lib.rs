//! # Enclave Core
//!
//! Core traits and types for assembling Enclave applications from
//! environment configuration.
//!
//! This crate holds everything that does not depend on a concrete driver:
//!
//! - [`config`]: environment-backed configuration reading
//! - [`application`]: application identity and the derived instance name
//! - [`lifecycle`]: ordered start/stop hooks for long-lived resources
//! - [`sql`]: the data-access handle abstraction, its decorators and the
//!   transaction manager
//! - [`stream`]: message records, the reader manager, controllers and the
//!   lifecycle supervisor for background consumption
//!
//! Driver crates (`enclave-postgres`, `enclave-kafka`) implement the traits
//! defined here; `enclave-runtime` wires everything together.
//!
//! ## Example
//!
//! ```ignore
//! use enclave_core::sql::{compose, ComposeOptions, Context, Query};
//!
//! let db = compose(raw, ComposeOptions::default().with_logging(tracing::Level::DEBUG));
//! let open = Query::new("SELECT id FROM orders WHERE status = $1").bind("open");
//! let rows = db.fetch_all(&Context::new(), &open).await?;
//! ```

pub mod application;
pub mod config;
pub mod lifecycle;
pub mod sql;
pub mod stream;

/// Boxed error used at trait boundaries where callers supply their own errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// Re-export commonly used types
pub use application::{AppConfig, AppIdentity};
pub use config::{ConfigError, EnvReader, EnvSource, FromEnv, ProcessEnv};
pub use lifecycle::{Hook, Lifecycle, LifecycleError, StopContext};
