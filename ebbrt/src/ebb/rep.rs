//! The representative trait implemented by every Ebb.

use crate::error::{EbbError, Result};
use crate::messaging::NetworkId;
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;

/// Upcast helper so `Arc<dyn EbbRep>` can be downcast to its concrete type.
///
/// Implemented for every `'static + Send + Sync` type; never implement it by hand.
pub trait AsAnyArc {
    /// Convert into an `Arc<dyn Any>` for downcasting.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A local representative of an Ebb.
///
/// Representatives are what an [`EbbId`](crate::ebb::EbbId) resolves to
/// inside one execution context. Inbound messages addressed to the id are
/// handed to [`handle_message`](EbbRep::handle_message) on the receiving
/// context's representative.
///
/// # Example
///
/// ```rust,ignore
/// struct Echo { messenger: Arc<dyn Messenger>, id: EbbId }
///
/// impl EbbRep for Echo {
///     fn handle_message(&self, from: NetworkId, body: Bytes) -> Result<()> {
///         self.messenger.send(from, self.id, vec![body], None)
///     }
/// }
/// ```
pub trait EbbRep: AsAnyArc + Send + Sync + 'static {
    /// Handle a message delivered by a messenger.
    ///
    /// `body` is the application payload with every transport header
    /// stripped. The default rejects the message.
    fn handle_message(&self, from: NetworkId, body: Bytes) -> Result<()> {
        let _ = body;
        Err(EbbError::MessageNotHandled { from })
    }
}
