//! # Enclave Runtime
//!
//! Composition root for Enclave applications.
//!
//! This crate turns environment configuration into a running process:
//!
//! - [`logging`]: `.env` loading and the global tracing subscriber
//! - [`builder`]: the [`ApplicationBuilder`] declaring which resources an
//!   application needs
//! - [`application`]: the assembled [`Application`], its start/stop sequence
//!   and shutdown signal handling
//!
//! ## Example
//!
//! ```ignore
//! use enclave_runtime::{ApplicationBuilder, run_application};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), enclave_runtime::BootstrapError> {
//!     run_application(
//!         ApplicationBuilder::new()
//!             .with_postgres()
//!             .with_kafka_events()
//!             .with_controller(Arc::new(OrderController::new())),
//!     )
//!     .await
//! }
//! ```

pub mod application;
pub mod builder;
pub mod logging;

pub use application::{Application, Resources, run_application, shutdown_signal};
pub use builder::{ApplicationBuilder, BootstrapError, EventsMode, RuntimeConfig};
pub use logging::{LogFormat, LoggingConfig};
