//! Single-resolution continuations for asynchronous operations.
//!
//! Every pending operation in the runtime (a send waiting for its buffers to
//! be released, a hash-table request waiting for its response, a parked
//! synchronized reader) owns exactly one [`Completion`]. Resolving consumes
//! it, so a continuation can neither fire twice nor be forgotten without the
//! compiler noticing a move.
//!
//! # Example
//!
//! ```rust,ignore
//! // Callback style
//! dht.get(b"foo", Completion::callback(|value| {
//!     tracing::info!("got {:?}", value);
//! }), None)?;
//!
//! // Channel style
//! let (done, rx) = Completion::channel();
//! dht.get(b"foo", done, None)?;
//! events.pump_once()?;
//! let value = rx.try_recv()?;
//! ```

use std::fmt;
use tokio::sync::oneshot;

/// The continuation of one pending operation.
pub enum Completion<T> {
    /// Invoke a closure with the result.
    Callback(Box<dyn FnOnce(T) + Send>),
    /// Deliver the result over a oneshot channel.
    Channel(oneshot::Sender<T>),
}

impl<T: Send + 'static> Completion<T> {
    /// Wrap a closure.
    pub fn callback(f: impl FnOnce(T) + Send + 'static) -> Self {
        Completion::Callback(Box::new(f))
    }

    /// Create a channel-backed completion and its receiving end.
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Completion::Channel(tx), rx)
    }

    /// Deliver `value`, consuming the completion.
    ///
    /// A dropped receiver is not an error: the caller lost interest.
    pub fn resolve(self, value: T) {
        match self {
            Completion::Callback(f) => f(value),
            Completion::Channel(tx) => {
                if tx.send(value).is_err() {
                    tracing::debug!("Completion receiver dropped before resolution");
                }
            }
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Callback(_) => f.write_str("Completion::Callback"),
            Completion::Channel(_) => f.write_str("Completion::Channel"),
        }
    }
}

/// Resolve an optional completion with `()`.
pub(crate) fn notify(done: Option<Completion<()>>) {
    if let Some(done) = done {
        done.resolve(());
    }
}
