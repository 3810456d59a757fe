//! Virtual network device model.
//!
//! [`Ring`] is the descriptor ring, [`VirtualNic`] the driver on top of a
//! transmit and a receive ring, and [`LoopbackSwitch`] an in-process device
//! backend that connects several NICs.

pub mod nic;
pub mod ring;
pub mod switch;

pub use nic::{NicBackend, VirtualNic, DEVICE_HEADER_LEN, LINK_HEADER_LEN};
pub use ring::{ChainBuf, DescFlags, Ring, UsedElem};
pub use switch::LoopbackSwitch;
