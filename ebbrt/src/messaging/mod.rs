//! Message passing between representatives.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  send(to, ebb, parts, done)   ┌──────────────────┐
//! │ Representative │ ────────────────────────────▶ │ dyn Messenger    │
//! └────────────────┘                               │  FrameMessenger  │──▶ VirtualNic rings
//!         ▲                                        │  GroupMessenger  │──▶ ProcessGroup
//!         │ handle_message(from, body)             └──────────────────┘
//!         │                                                 │
//!    Resolver::resolve(ebb) ◀──── inbound, via EventManager ┘
//! ```
//!
//! Both transports frame a message as `[transport header][EbbId][payload]`,
//! preserve message boundaries, and order messages only per
//! sender→destination pair. A send's completion fires exactly once, after
//! the transport has released every payload buffer.

pub mod completion;
pub mod frame;
pub mod group;
pub mod network_id;

pub use completion::Completion;
pub use frame::{FrameMessenger, ETHERTYPE_EBB};
pub use group::{GroupMessenger, GROUP_TAG_BASE};
pub use network_id::{MacAddress, NetworkId};

use crate::ebb::{EbbId, Resolver};
use crate::error::Result;
use crate::event::EventManager;
use bytes::Bytes;
use std::sync::Arc;

/// A transport that carries messages addressed to an [`EbbId`].
pub trait Messenger: Send + Sync {
    /// This process's address on the transport.
    fn local_address(&self) -> NetworkId;

    /// Frame `payload` for `ebb` on `to` and queue it.
    ///
    /// `on_complete` fires exactly once, after the transport has released
    /// the payload buffers.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if `to` is not addressable by this transport,
    /// the message does not fit, or the transport is out of queue space.
    fn send(
        &self,
        to: NetworkId,
        ebb: EbbId,
        payload: Vec<Bytes>,
        on_complete: Option<Completion<()>>,
    ) -> Result<()>;

    /// Begin inbound delivery through `events`, resolving targets with `resolver`.
    fn start_listening(&self, events: &Arc<EventManager>, resolver: Resolver) -> Result<()>;
}

/// Hand an inbound message to the local representative of `ebb`.
pub(crate) fn deliver(resolver: &Resolver, from: NetworkId, ebb: EbbId, body: Bytes) -> Result<()> {
    tracing::debug!("Delivering {} bytes from {} to {}", body.len(), from, ebb);
    resolver.resolve(ebb)?.handle_message(from, body)
}

/// Total length of a multi-part payload.
pub(crate) fn payload_len(parts: &[Bytes]) -> usize {
    parts.iter().map(Bytes::len).sum()
}
