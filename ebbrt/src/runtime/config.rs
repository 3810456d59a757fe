//! Runtime, device and hash-table configuration.
//!
//! Everything here is plain data: [`RuntimeConfig`] is consumed by
//! [`Runtime::new`](super::Runtime::new), [`NicConfig`] by
//! [`VirtualNic::new`](crate::net::VirtualNic::new) and [`DhtConfig`] by
//! [`DistributedHashTable::new`](crate::dht::DistributedHashTable::new).
//! All three deserialize from JSON with missing fields taking their
//! defaults.

use crate::ebb::EbbId;
use crate::error::Result;
use crate::messaging::NetworkId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_MAX_CONTEXTS: usize = 64;
const DEFAULT_FIRST_DYNAMIC_ID: u32 = 256;
const DEFAULT_FIRST_INTERRUPT_SLOT: u16 = 32;
const DEFAULT_INTERRUPT_SLOTS: u16 = 256;
const DEFAULT_POLL_INTERVAL_MICROS: u64 = 1_000;

/// Process-wide runtime settings.
///
/// # Example
///
/// ```rust,ignore
/// // Defaults: 64 contexts, dynamic ids from 256, slots 32..256
/// let config = RuntimeConfig::default();
///
/// // Well-known bindings by name
/// let config = RuntimeConfig::builder()
///     .static_ebb("HashTable", EbbId::new(10))
///     .static_ebb("WorkBag", EbbId::new(11))
///     .build();
///
/// // From a JSON document
/// let config = RuntimeConfig::from_json(r#"{"max_contexts": 4}"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    max_contexts: usize,
    first_dynamic_id: u32,
    max_ebb_id: u32,
    first_interrupt_slot: u16,
    interrupt_slots: u16,
    poll_interval_micros: u64,
    static_ebbs: BTreeMap<String, EbbId>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_contexts: DEFAULT_MAX_CONTEXTS,
            first_dynamic_id: DEFAULT_FIRST_DYNAMIC_ID,
            max_ebb_id: u32::MAX,
            first_interrupt_slot: DEFAULT_FIRST_INTERRUPT_SLOT,
            interrupt_slots: DEFAULT_INTERRUPT_SLOTS,
            poll_interval_micros: DEFAULT_POLL_INTERVAL_MICROS,
            static_ebbs: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Start building a runtime configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Parse a configuration from JSON.
    ///
    /// # Errors
    ///
    /// Returns `EbbError::Config` if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Maximum number of execution contexts.
    pub fn max_contexts(&self) -> usize {
        self.max_contexts
    }

    /// First id handed out by dynamic allocation. Lower ids are reserved.
    pub fn first_dynamic_id(&self) -> u32 {
        self.first_dynamic_id
    }

    /// Largest id dynamic allocation may return.
    pub fn max_ebb_id(&self) -> u32 {
        self.max_ebb_id
    }

    /// First interrupt slot handed out; lower slots are reserved.
    pub fn first_interrupt_slot(&self) -> u16 {
        self.first_interrupt_slot
    }

    /// Total number of interrupt slots per context.
    pub fn interrupt_slots(&self) -> u16 {
        self.interrupt_slots
    }

    /// Bound on the blocking wait while event sources are registered.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_micros)
    }

    /// Well-known bindings by name.
    pub fn static_ebbs(&self) -> &BTreeMap<String, EbbId> {
        &self.static_ebbs
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Set the maximum number of execution contexts.
    pub fn max_contexts(mut self, max: usize) -> Self {
        self.config.max_contexts = max;
        self
    }

    /// Set the first dynamically allocated id.
    pub fn first_dynamic_id(mut self, first: u32) -> Self {
        self.config.first_dynamic_id = first;
        self
    }

    /// Set the largest dynamically allocated id.
    pub fn max_ebb_id(mut self, max: u32) -> Self {
        self.config.max_ebb_id = max;
        self
    }

    /// Set the first allocatable interrupt slot.
    pub fn first_interrupt_slot(mut self, first: u16) -> Self {
        self.config.first_interrupt_slot = first;
        self
    }

    /// Set the total number of interrupt slots.
    pub fn interrupt_slots(mut self, slots: u16) -> Self {
        self.config.interrupt_slots = slots;
        self
    }

    /// Set the bounded wait used while event sources are registered.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_micros = u64::try_from(interval.as_micros()).unwrap_or(u64::MAX);
        self
    }

    /// Reserve `id` under `name`.
    pub fn static_ebb(mut self, name: impl Into<String>, id: EbbId) -> Self {
        self.config.static_ebbs.insert(name.into(), id);
        self
    }

    /// Build the configuration (infallible).
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

/// Virtual NIC settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NicConfig {
    /// Descriptors per ring; also the number of pre-posted receive buffers.
    pub ring_size: u16,
    /// Largest frame, link header included.
    pub mtu: usize,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            ring_size: 256,
            mtu: 1514,
        }
    }
}

/// Node table of a distributed hash table.
///
/// Every process must be configured with the same `nodes`, in the same
/// order; `local` is this process's index in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Address of every participating process, indexed by shard.
    pub nodes: Vec<NetworkId>,
    /// Index of this process in `nodes`.
    pub local: usize,
}

impl DhtConfig {
    /// Create a node table.
    pub fn new(nodes: Vec<NetworkId>, local: usize) -> Self {
        Self { nodes, local }
    }

    /// A one-node table: every key is local.
    pub fn single(address: NetworkId) -> Self {
        Self::new(vec![address], 0)
    }

    /// Number of shards.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_contexts(), 64);
        assert_eq!(config.first_dynamic_id(), 256);
        assert_eq!(config.max_ebb_id(), u32::MAX);
        assert_eq!(config.first_interrupt_slot(), 32);
        assert_eq!(config.interrupt_slots(), 256);
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert!(config.static_ebbs().is_empty());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .max_contexts(2)
            .poll_interval(Duration::from_micros(250))
            .static_ebb("WorkBag", EbbId::new(11))
            .build();
        assert_eq!(config.max_contexts(), 2);
        assert_eq!(config.poll_interval(), Duration::from_micros(250));
        assert_eq!(config.static_ebbs().get("WorkBag"), Some(&EbbId::new(11)));
    }

    #[test]
    fn test_from_json_partial() {
        let config = RuntimeConfig::from_json(
            r#"{"max_contexts": 4, "static_ebbs": {"HashTable": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.max_contexts(), 4);
        assert_eq!(config.first_dynamic_id(), 256);
        assert_eq!(config.static_ebbs().get("HashTable"), Some(&EbbId::new(10)));
    }

    #[test]
    fn test_from_json_malformed() {
        assert!(RuntimeConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn test_nic_and_dht_defaults() {
        let nic = NicConfig::default();
        assert_eq!(nic.ring_size, 256);
        assert_eq!(nic.mtu, 1514);

        let dht = DhtConfig::single(NetworkId::rank(0, 0));
        assert_eq!(dht.node_count(), 1);
        assert_eq!(dht.local, 0);
    }
}
