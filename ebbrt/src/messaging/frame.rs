//! Link-layer framing over a [`VirtualNic`].
//!
//! # Wire Format
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┬────────────┬─────────────┐
//! │ dst (6)  │ src (6)  │ 0x8812 (2 BE)│ EbbId (4 LE)│ payload ... │
//! └──────────┴──────────┴──────────────┴────────────┴─────────────┘
//! ```
//!
//! The link header and the EbbId are built into one buffer that becomes the
//! first payload descriptor; the caller's parts follow unchanged.

use crate::ebb::{EbbId, Resolver};
use crate::error::{Result, TransportError, WireError};
use crate::event::EventManager;
use crate::messaging::{deliver, Completion, MacAddress, Messenger, NetworkId};
use crate::net::{VirtualNic, LINK_HEADER_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Ethertype reserved for runtime messages.
pub const ETHERTYPE_EBB: u16 = 0x8812;

const HEADER_LEN: usize = LINK_HEADER_LEN + 4;

/// Messenger over a virtual NIC.
#[derive(Debug, Clone)]
pub struct FrameMessenger {
    nic: Arc<VirtualNic>,
}

impl FrameMessenger {
    /// Send through `nic`.
    pub fn new(nic: Arc<VirtualNic>) -> Self {
        Self { nic }
    }

    /// The underlying device.
    pub fn nic(&self) -> &Arc<VirtualNic> {
        &self.nic
    }

    fn header(&self, dst: MacAddress, ebb: EbbId) -> Bytes {
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_slice(&dst.octets());
        header.put_slice(&self.nic.mac().octets());
        header.put_u16(ETHERTYPE_EBB);
        header.put_u32_le(ebb.as_u32());
        header.freeze()
    }
}

/// Split an inbound frame into sender, target and body.
fn parse(frame: &Bytes) -> std::result::Result<(MacAddress, EbbId, Bytes), WireError> {
    if frame.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN,
            have: frame.len(),
        });
    }
    let mut src = [0u8; 6];
    src.copy_from_slice(&frame[6..12]);
    let mut id = [0u8; 4];
    id.copy_from_slice(&frame[LINK_HEADER_LEN..HEADER_LEN]);
    Ok((MacAddress(src), EbbId::from_le_bytes(id), frame.slice(HEADER_LEN..)))
}

impl Messenger for FrameMessenger {
    fn local_address(&self) -> NetworkId {
        NetworkId::Mac(self.nic.mac())
    }

    fn send(
        &self,
        to: NetworkId,
        ebb: EbbId,
        payload: Vec<Bytes>,
        on_complete: Option<Completion<()>>,
    ) -> Result<()> {
        let NetworkId::Mac(dst) = to else {
            return Err(TransportError::WrongAddressKind {
                to,
                transport: "frame",
            }
            .into());
        };

        let mut parts = Vec::with_capacity(payload.len() + 1);
        parts.push(self.header(dst, ebb));
        parts.extend(payload);
        tracing::debug!(
            "Frame to {} for {} ({} bytes)",
            dst,
            ebb,
            super::payload_len(&parts) - HEADER_LEN
        );
        self.nic.send(parts, on_complete)
    }

    fn start_listening(&self, events: &Arc<EventManager>, resolver: Resolver) -> Result<()> {
        self.nic.attach(events)?;
        self.nic.register(ETHERTYPE_EBB, move |frame: Bytes| {
            let (src, ebb, body) = parse(&frame).inspect_err(|e| {
                tracing::error!("Malformed frame: {}", e);
            })?;
            deliver(&resolver, NetworkId::Mac(src), ebb, body)
        });
        tracing::info!("Listening for frames on {}", self.nic.mac());
        Ok(())
    }
}
