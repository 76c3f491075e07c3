//! Controllers: feature-level groups of subscriptions.

use super::{ReaderManager, StreamError};
use std::sync::Arc;

/// A unit of message-handling logic.
///
/// A controller registers the handlers it owns with a reader manager. The
/// manager only keeps the handlers; the controller itself stays with its
/// owner.
///
/// # Example
///
/// ```ignore
/// struct OrderController {
///     orders: Arc<OrderService>,
/// }
///
/// impl Controller for OrderController {
///     fn register_readers(&self, manager: &ReaderManager) -> Result<(), StreamError> {
///         let orders = Arc::clone(&self.orders);
///         manager.register("payments.settled", handler_fn(move |record| {
///             let orders = Arc::clone(&orders);
///             async move { orders.mark_paid(&record.payload).await }
///         }))
///     }
/// }
/// ```
pub trait Controller: Send + Sync {
    /// Register this controller's subscriptions.
    ///
    /// # Errors
    ///
    /// Returns the manager's registration error, for example when the
    /// manager already started or a topic is registered twice.
    fn register_readers(&self, manager: &ReaderManager) -> Result<(), StreamError>;
}

/// Let each controller register its subscriptions, in order.
///
/// Must run before the manager starts; registration stops at the first
/// failure.
///
/// # Errors
///
/// Returns the first registration error.
pub fn register_controllers(
    controllers: &[Arc<dyn Controller>],
    manager: &ReaderManager,
) -> Result<(), StreamError> {
    for controller in controllers {
        controller.register_readers(manager)?;
    }
    tracing::info!(
        controllers = controllers.len(),
        topics = ?manager.topics(),
        "Registered stream controllers"
    );
    Ok(())
}
