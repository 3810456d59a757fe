//! Virtual NIC driver.
//!
//! # Transmit
//!
//! ```text
//! send(parts, done):
//!   1. lock tx ring, add chain [device header | parts...]
//!   2. park `done` in the completion map under the chain head, unlock
//!   3. notify the backend
//!
//! send-complete interrupt:
//!   1. lock tx ring, pop used head, reclaim chain, unlock
//!   2. take the completion for that head, resolve it (no locks held)
//! ```
//!
//! # Receive
//!
//! ```text
//! receive interrupt:
//!   1. lock rx ring, pop used head, reclaim buffer, post a fresh one, unlock
//!   2. strip the device header, read the ethertype
//!   3. call the handler registered for it (no locks held)
//! ```
//!
//! The device side (`device_*` methods) is driven by a [`NicBackend`] such
//! as [`LoopbackSwitch`](super::LoopbackSwitch).

use crate::error::{Result, TransportError};
use crate::event::{EventManager, InterruptLine};
use crate::messaging::{Completion, MacAddress};
use crate::net::ring::{ChainBuf, Ring};
use crate::runtime::NicConfig;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Length of the per-chain device header.
pub const DEVICE_HEADER_LEN: usize = 10;

/// Length of the link-layer header: destination, source, ethertype.
pub const LINK_HEADER_LEN: usize = 14;

/// Offset of the ethertype within a frame.
const ETHERTYPE_OFFSET: usize = 12;

static DEVICE_HEADER: [u8; DEVICE_HEADER_LEN] = [0; DEVICE_HEADER_LEN];

/// The device end of a virtual NIC.
pub trait NicBackend: Send + Sync {
    /// The driver of `nic` has published new transmit chains.
    fn notify_tx(&self, nic: &Arc<VirtualNic>) -> Result<()>;
}

type FrameHandler = Arc<dyn Fn(Bytes) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct Lines {
    rx: InterruptLine,
    tx: InterruptLine,
}

/// Driver for a virtual network device with one transmit and one receive ring.
pub struct VirtualNic {
    mac: MacAddress,
    mtu: usize,
    tx: Mutex<Ring>,
    rx: Mutex<Ring>,
    completions: Mutex<HashMap<u16, Completion<()>>>,
    handlers: Mutex<HashMap<u16, FrameHandler>>,
    lines: Mutex<Option<Lines>>,
    backend: Arc<dyn NicBackend>,
}

impl VirtualNic {
    /// Create a NIC with every receive descriptor pre-posted.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::RingExhausted` for a zero ring size.
    pub fn new(mac: MacAddress, config: NicConfig, backend: Arc<dyn NicBackend>) -> Result<Arc<Self>> {
        let tx = Ring::new(config.ring_size)?;
        let mut rx = Ring::new(config.ring_size)?;
        let capacity = Self::rx_capacity(config.mtu);
        for _ in 0..config.ring_size {
            rx.add_chain(vec![ChainBuf::Writable(capacity)])?;
        }
        tracing::debug!("NIC {} up, {} descriptors per ring", mac, config.ring_size);
        Ok(Arc::new(Self {
            mac,
            mtu: config.mtu,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            completions: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            lines: Mutex::new(None),
            backend,
        }))
    }

    /// Hardware address.
    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// Largest frame the NIC accepts, link header included.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Allocate receive and send-complete interrupts on `events`.
    ///
    /// Attaching an already attached NIC is a no-op.
    pub fn attach(self: &Arc<Self>, events: &Arc<EventManager>) -> Result<()> {
        let mut lines = lock(&self.lines);
        if lines.is_some() {
            tracing::debug!("NIC {} already attached", self.mac);
            return Ok(());
        }

        let nic = Arc::downgrade(self);
        let rx_slot = events.allocate_interrupt(move || match nic.upgrade() {
            Some(nic) => nic.receive(),
            None => Ok(()),
        })?;
        let nic = Arc::downgrade(self);
        let tx_slot = events.allocate_interrupt(move || match nic.upgrade() {
            Some(nic) => nic.send_complete(),
            None => Ok(()),
        })?;

        *lines = Some(Lines {
            rx: events.interrupt_line(rx_slot),
            tx: events.interrupt_line(tx_slot),
        });
        tracing::info!(
            "NIC {} attached at {} (rx {}, tx {})",
            self.mac,
            events.location(),
            rx_slot,
            tx_slot
        );
        Ok(())
    }

    /// Route inbound frames carrying `ethertype` to `handler`.
    ///
    /// The handler receives the whole frame, link header included.
    pub fn register(&self, ethertype: u16, handler: impl Fn(Bytes) -> Result<()> + Send + Sync + 'static) {
        lock(&self.handlers).insert(ethertype, Arc::new(handler));
    }

    /// Queue a frame made of `parts` for transmission.
    ///
    /// `done` fires once the device has consumed the frame and the chain has
    /// been reclaimed.
    ///
    /// # Errors
    ///
    /// - `TransportError::NotAttached` before [`attach`](Self::attach)
    /// - `TransportError::FrameTooLarge` if the frame exceeds the MTU
    /// - `TransportError::RingExhausted` if the transmit ring cannot hold the chain
    pub fn send(self: &Arc<Self>, parts: Vec<Bytes>, done: Option<Completion<()>>) -> Result<()> {
        if lock(&self.lines).is_none() {
            return Err(TransportError::NotAttached.into());
        }
        let size: usize = parts.iter().map(Bytes::len).sum();
        if size > self.mtu {
            tracing::error!("NIC {} refusing {} byte frame", self.mac, size);
            return Err(TransportError::FrameTooLarge { size, mtu: self.mtu }.into());
        }

        let mut chain = Vec::with_capacity(parts.len() + 1);
        chain.push(ChainBuf::Readable(Bytes::from_static(&DEVICE_HEADER)));
        chain.extend(parts.into_iter().map(ChainBuf::Readable));

        {
            let mut tx = lock(&self.tx);
            let head = tx.add_chain(chain).inspect_err(|e| {
                tracing::error!("NIC {} transmit ring: {}", self.mac, e);
            })?;
            // Parked before the tx lock drops so a concurrent drain of the
            // ring cannot complete the chain ahead of its callback.
            if let Some(done) = done {
                lock(&self.completions).insert(head, done);
            }
        }
        self.backend.notify_tx(self)
    }

    /// Reclaim every chain the device has finished and fire its completion.
    pub fn send_complete(&self) -> Result<()> {
        loop {
            let head = {
                let mut tx = lock(&self.tx);
                let Some(used) = tx.pop_used() else {
                    return Ok(());
                };
                tx.reclaim_chain(used.head);
                used.head
            };
            let done = lock(&self.completions).remove(&head);
            if let Some(done) = done {
                done.resolve(());
            }
        }
    }

    /// Dispatch every received frame to its ethertype handler.
    ///
    /// # Errors
    ///
    /// Propagates handler errors. Frames with no registered handler are
    /// dropped with a warning.
    pub fn receive(&self) -> Result<()> {
        let capacity = Self::rx_capacity(self.mtu);
        loop {
            let data = {
                let mut rx = lock(&self.rx);
                let Some(used) = rx.pop_used() else {
                    return Ok(());
                };
                let mut bufs = rx.reclaim_chain(used.head);
                rx.add_chain(vec![ChainBuf::Writable(capacity)])?;
                let mut data = bufs.pop().unwrap_or_default();
                data.truncate(used.len as usize);
                data
            };

            if data.len() < DEVICE_HEADER_LEN + LINK_HEADER_LEN {
                tracing::warn!("NIC {} dropping runt frame ({} bytes)", self.mac, data.len());
                continue;
            }
            let frame = data.slice(DEVICE_HEADER_LEN..);
            let ethertype = u16::from_be_bytes([frame[ETHERTYPE_OFFSET], frame[ETHERTYPE_OFFSET + 1]]);
            let handler = lock(&self.handlers).get(&ethertype).cloned();
            match handler {
                Some(handler) => handler(frame)?,
                None => tracing::warn!("NIC {} no handler for ethertype {:#06x}", self.mac, ethertype),
            }
        }
    }

    /// Number of free transmit descriptors.
    pub fn tx_free(&self) -> u16 {
        lock(&self.tx).num_free()
    }

    // ---- device side ----

    /// Take the next transmit chain as one contiguous frame.
    ///
    /// Returns the chain head and the frame with the device header removed.
    pub fn device_take_tx(&self) -> Option<(u16, Bytes)> {
        let mut tx = lock(&self.tx);
        let head = tx.take_available()?;
        let bufs = tx.chain_buffers(head);
        drop(tx);

        let mut frame = BytesMut::with_capacity(bufs.iter().map(Bytes::len).sum());
        for buf in bufs.iter().skip(1) {
            frame.extend_from_slice(buf);
        }
        Some((head, frame.freeze()))
    }

    /// Mark a transmit chain consumed and raise the send-complete interrupt.
    pub fn device_complete_tx(&self, head: u16) {
        lock(&self.tx).push_used(head, 0);
        if let Some(lines) = lock(&self.lines).clone() {
            lines.tx.raise();
        }
    }

    /// Place `frame` in the next posted receive buffer and raise the receive interrupt.
    ///
    /// Returns `false` if no receive buffer is posted.
    pub fn device_deliver(&self, frame: &[u8]) -> Result<bool> {
        let mut data = BytesMut::with_capacity(DEVICE_HEADER_LEN + frame.len());
        data.extend_from_slice(&DEVICE_HEADER);
        data.extend_from_slice(frame);
        {
            let mut rx = lock(&self.rx);
            let Some(head) = rx.take_available() else {
                return Ok(false);
            };
            let len = rx.write_buffer(head, data.freeze())?;
            rx.push_used(head, len);
        }
        if let Some(lines) = lock(&self.lines).clone() {
            lines.rx.raise();
        }
        Ok(true)
    }

    fn rx_capacity(mtu: usize) -> u32 {
        u32::try_from(DEVICE_HEADER_LEN + mtu).unwrap_or(u32::MAX)
    }
}

impl fmt::Debug for VirtualNic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualNic")
            .field("mac", &self.mac)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebb::Location;
    use crate::error::EbbError;
    use crate::runtime::RuntimeConfig;

    /// Completes every chain immediately without delivering it anywhere.
    struct Sink;

    impl NicBackend for Sink {
        fn notify_tx(&self, nic: &Arc<VirtualNic>) -> Result<()> {
            while let Some((head, _)) = nic.device_take_tx() {
                nic.device_complete_tx(head);
            }
            Ok(())
        }
    }

    /// Never consumes anything.
    struct Stalled;

    impl NicBackend for Stalled {
        fn notify_tx(&self, _nic: &Arc<VirtualNic>) -> Result<()> {
            Ok(())
        }
    }

    fn attached(backend: Arc<dyn NicBackend>, ring_size: u16) -> (Arc<VirtualNic>, Arc<EventManager>) {
        let events = Arc::new(EventManager::new(Location::new(0), &RuntimeConfig::default()));
        let config = NicConfig {
            ring_size,
            ..NicConfig::default()
        };
        let nic = VirtualNic::new(MacAddress([2, 0, 0, 0, 0, 1]), config, backend).unwrap();
        nic.attach(&events).unwrap();
        (nic, events)
    }

    #[test]
    fn test_send_before_attach_fails() {
        let nic = VirtualNic::new(MacAddress([2, 0, 0, 0, 0, 1]), NicConfig::default(), Arc::new(Sink)).unwrap();
        let err = nic.send(vec![Bytes::from_static(b"x")], None).unwrap_err();
        assert!(matches!(err, EbbError::Transport(TransportError::NotAttached)));
    }

    #[test]
    fn test_completion_fires_after_reclaim() {
        let (nic, events) = attached(Arc::new(Sink), 8);
        let (done, mut rx) = Completion::channel();
        nic.send(vec![Bytes::from(vec![0u8; 64])], Some(done)).unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(nic.tx_free(), 6);

        events.pump_once().unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(nic.tx_free(), 8);
    }

    #[test]
    fn test_frame_over_mtu_rejected() {
        let (nic, _events) = attached(Arc::new(Sink), 8);
        let err = nic.send(vec![Bytes::from(vec![0u8; 1515])], None).unwrap_err();
        assert!(matches!(
            err,
            EbbError::Transport(TransportError::FrameTooLarge { size: 1515, mtu: 1514 })
        ));
    }

    #[test]
    fn test_ring_exhaustion_is_error() {
        let (nic, _events) = attached(Arc::new(Stalled), 4);
        nic.send(vec![Bytes::from_static(b"a")], None).unwrap();
        nic.send(vec![Bytes::from_static(b"b")], None).unwrap();
        let err = nic.send(vec![Bytes::from_static(b"c")], None).unwrap_err();
        assert!(matches!(
            err,
            EbbError::Transport(TransportError::RingExhausted { needed: 2, free: 0 })
        ));
    }

    #[test]
    fn test_receive_dispatches_by_ethertype_and_reposts() {
        let (nic, events) = attached(Arc::new(Sink), 2);
        let (seen, mut rx) = Completion::channel();
        let seen = Mutex::new(Some(seen));
        nic.register(0x8812, move |frame: Bytes| {
            if let Some(seen) = seen.lock().unwrap().take() {
                seen.resolve(frame);
            }
            Ok(())
        });

        let mut frame = vec![0u8; LINK_HEADER_LEN + 3];
        frame[12] = 0x88;
        frame[13] = 0x12;
        frame[14..].copy_from_slice(b"abc");
        assert!(nic.device_deliver(&frame).unwrap());

        events.pump_once().unwrap();
        let got = rx.try_recv().unwrap();
        assert_eq!(&got[LINK_HEADER_LEN..], b"abc");

        // Both receive buffers are posted again.
        assert!(nic.device_deliver(&frame).unwrap());
        assert!(nic.device_deliver(&frame).unwrap());
    }
}
