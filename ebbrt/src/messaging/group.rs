//! Point-to-point messaging over a [`ProcessGroup`].
//!
//! # Wire Format
//!
//! ```text
//! ┌───────────────────┬────────────────┬──────────────┬─────────────┐
//! │ sender ctx (2 LE) │ reserved (2)   │ EbbId (4 LE) │ payload ... │
//! └───────────────────┴────────────────┴──────────────┴─────────────┘
//!
//! group tag = 0x8812_0000 | destination context
//! ```
//!
//! # Polling
//!
//! The group layer cannot raise interrupts, so the messenger registers an
//! [`EventSource`](crate::event::EventSource) that the event manager polls
//! before blocking:
//!
//! ```text
//! poll():
//!   1. test every in-flight send; move finished ones to the ready list
//!   2. probe for a message carrying this context's tag
//!   3. either found something → return the dispatch slot
//!
//! dispatch slot handler:
//!   1. resolve every ready send completion (buffers already released)
//!   2. receive one probed message, strip the header, deliver it
//! ```

use crate::ebb::{EbbId, Resolver};
use crate::error::{Result, TransportError, WireError};
use crate::event::{EventManager, SlotId};
use crate::group::{ProcessGroup, RequestId};
use crate::messaging::{deliver, payload_len, Completion, Messenger, NetworkId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Base of every group tag; the low 16 bits carry the destination context.
pub const GROUP_TAG_BASE: u32 = 0x8812_0000;

const HEADER_LEN: usize = 8;

struct InFlight {
    request: RequestId,
    // Caller's buffers, held until the group layer reports the send complete.
    _payload: Vec<Bytes>,
    done: Option<Completion<()>>,
}

struct State {
    in_flight: Vec<InFlight>,
    ready: Vec<Completion<()>>,
}

/// Messenger over a rank-addressed process group.
///
/// Sends complete, and inbound messages are delivered, only once
/// [`start_listening`](Messenger::start_listening) has registered the
/// messenger with an event manager.
pub struct GroupMessenger {
    me: Weak<GroupMessenger>,
    group: Arc<dyn ProcessGroup>,
    context: u16,
    state: Mutex<State>,
}

impl GroupMessenger {
    /// Messenger for execution context `context` of this process.
    pub fn new(group: Arc<dyn ProcessGroup>, context: u16) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            group,
            context,
            state: Mutex::new(State {
                in_flight: Vec::new(),
                ready: Vec::new(),
            }),
        })
    }

    /// Tag of messages addressed to `context`.
    pub fn tag(context: u16) -> u32 {
        GROUP_TAG_BASE | u32::from(context)
    }

    /// Sends not yet confirmed by the group layer.
    pub fn in_flight(&self) -> usize {
        self.lock_state().in_flight.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Test in-flight sends and report whether anything is ready to dispatch.
    fn poll(&self) -> Result<bool> {
        let mut state = self.lock_state();
        let mut i = 0;
        while i < state.in_flight.len() {
            if self.group.test(state.in_flight[i].request)? {
                let finished = state.in_flight.swap_remove(i);
                if let Some(done) = finished.done {
                    state.ready.push(done);
                }
            } else {
                i += 1;
            }
        }
        let completions = !state.ready.is_empty();
        drop(state);

        Ok(completions || self.group.iprobe(Self::tag(self.context))?.is_some())
    }

    fn dispatch(&self, resolver: &Resolver) -> Result<()> {
        let ready = std::mem::take(&mut self.lock_state().ready);
        for done in ready {
            done.resolve(());
        }

        let tag = Self::tag(self.context);
        let Some(status) = self.group.iprobe(tag)? else {
            return Ok(());
        };
        let mut message = self.group.recv(status.source, tag)?;
        if message.len() < HEADER_LEN {
            tracing::error!("Short group message from rank {}", status.source);
            return Err(WireError::Truncated {
                needed: HEADER_LEN,
                have: message.len(),
            }
            .into());
        }
        let context = message.get_u16_le();
        message.advance(2);
        let ebb = EbbId::new(message.get_u32_le());
        deliver(
            resolver,
            NetworkId::rank(status.source, context),
            ebb,
            message,
        )
    }
}

impl Messenger for GroupMessenger {
    fn local_address(&self) -> NetworkId {
        NetworkId::rank(self.group.rank(), self.context)
    }

    fn send(
        &self,
        to: NetworkId,
        ebb: EbbId,
        payload: Vec<Bytes>,
        on_complete: Option<Completion<()>>,
    ) -> Result<()> {
        let NetworkId::Rank { rank, context } = to else {
            return Err(TransportError::WrongAddressKind {
                to,
                transport: "process-group",
            }
            .into());
        };

        let mut buffer = BytesMut::with_capacity(HEADER_LEN + payload_len(&payload));
        buffer.put_u16_le(self.context);
        buffer.put_u16_le(0);
        buffer.put_u32_le(ebb.as_u32());
        for part in &payload {
            buffer.put_slice(part);
        }
        let buffer = buffer.freeze();

        tracing::debug!("Group send to {} for {} ({} bytes)", to, ebb, payload_len(&payload));
        let request = self
            .group
            .isend(rank, Self::tag(context), buffer)
            .inspect_err(|e| tracing::error!("Group send to {} failed: {}", to, e))?;
        self.lock_state().in_flight.push(InFlight {
            request,
            _payload: payload,
            done: on_complete,
        });
        Ok(())
    }

    fn start_listening(&self, events: &Arc<EventManager>, resolver: Resolver) -> Result<()> {
        let this = self.me.clone();
        let dispatch = self.me.clone();
        let slot: SlotId = events.allocate_interrupt(move || match dispatch.upgrade() {
            Some(messenger) => messenger.dispatch(&resolver),
            None => Ok(()),
        })?;
        events.register_source(Arc::new(move || -> Result<Option<SlotId>> {
            match this.upgrade() {
                Some(messenger) => Ok(messenger.poll()?.then_some(slot)),
                None => Ok(None),
            }
        }));
        tracing::info!(
            "Listening on rank {} context {} (tag {:#x})",
            self.group.rank(),
            self.context,
            Self::tag(self.context)
        );
        Ok(())
    }
}

impl fmt::Debug for GroupMessenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupMessenger")
            .field("rank", &self.group.rank())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
