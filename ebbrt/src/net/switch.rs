//! In-process backend connecting virtual NICs.

use crate::error::Result;
use crate::messaging::MacAddress;
use crate::net::nic::{NicBackend, VirtualNic};
use crate::runtime::NicConfig;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// A switch that moves frames between the NICs plugged into it.
///
/// Frames go to the port whose address matches the destination, or to every
/// other port for the broadcast address. A frame for an unknown address, or
/// for a port with no posted receive buffer, is dropped. Delivery happens
/// synchronously inside the sender's `send`, so per-pair ordering follows
/// send order.
///
/// # Example
///
/// ```rust,ignore
/// let switch = LoopbackSwitch::new();
/// let a = switch.connect(MacAddress([2, 0, 0, 0, 0, 1]), NicConfig::default())?;
/// let b = switch.connect(MacAddress([2, 0, 0, 0, 0, 2]), NicConfig::default())?;
/// ```
#[derive(Debug, Default)]
pub struct LoopbackSwitch {
    ports: Mutex<Vec<Weak<VirtualNic>>>,
}

impl LoopbackSwitch {
    /// Create a switch with no ports.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a NIC with address `mac` plugged into this switch.
    pub fn connect(self: &Arc<Self>, mac: MacAddress, config: NicConfig) -> Result<Arc<VirtualNic>> {
        let nic = VirtualNic::new(mac, config, self.clone())?;
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&nic));
        Ok(nic)
    }

    fn live_ports(&self) -> Vec<Arc<VirtualNic>> {
        let mut ports = self.ports.lock().unwrap_or_else(PoisonError::into_inner);
        ports.retain(|port| port.strong_count() > 0);
        ports.iter().filter_map(Weak::upgrade).collect()
    }
}

impl NicBackend for LoopbackSwitch {
    fn notify_tx(&self, nic: &Arc<VirtualNic>) -> Result<()> {
        while let Some((head, frame)) = nic.device_take_tx() {
            if frame.len() >= 6 {
                let mut dst = [0u8; 6];
                dst.copy_from_slice(&frame[..6]);
                let dst = MacAddress(dst);

                let mut delivered = false;
                for port in self.live_ports() {
                    let matches = if dst.is_broadcast() {
                        port.mac() != nic.mac()
                    } else {
                        port.mac() == dst
                    };
                    if !matches {
                        continue;
                    }
                    if port.device_deliver(&frame)? {
                        delivered = true;
                    } else {
                        tracing::warn!("Dropping frame for {}: no receive buffer posted", port.mac());
                    }
                }
                if !delivered {
                    tracing::debug!("Frame from {} to {} reached no port", nic.mac(), dst);
                }
            } else {
                tracing::warn!("Dropping {} byte frame from {}", frame.len(), nic.mac());
            }
            nic.device_complete_tx(head);
        }
        Ok(())
    }
}
