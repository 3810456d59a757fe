//! Endpoint addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 6-byte link-layer hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    /// Address bytes in wire order.
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Destination of a message.
///
/// Which variant is valid depends on the transport: frame transports take
/// [`NetworkId::Mac`], process-group transports take [`NetworkId::Rank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkId {
    /// Link-layer hardware address.
    Mac(MacAddress),
    /// Process rank and execution context within a process group.
    Rank {
        /// Process rank in the group.
        rank: u32,
        /// Context tag on that process.
        context: u16,
    },
}

impl NetworkId {
    /// Convenience constructor for a hardware address.
    pub const fn mac(octets: [u8; 6]) -> Self {
        NetworkId::Mac(MacAddress(octets))
    }

    /// Convenience constructor for a process-group endpoint.
    pub const fn rank(rank: u32, context: u16) -> Self {
        NetworkId::Rank { rank, context }
    }
}

impl From<MacAddress> for NetworkId {
    fn from(mac: MacAddress) -> Self {
        NetworkId::Mac(mac)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkId::Mac(mac) => write!(f, "{mac}"),
            NetworkId::Rank { rank, context } => write!(f, "rank{rank}/ctx{context}"),
        }
    }
}
