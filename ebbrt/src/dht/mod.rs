//! Distributed hash table.
//!
//! Keys are partitioned over a fixed node table by
//! `crc32c(key) mod node_count`. The owning node serves its keys from a
//! local [`Shard`]; every other node forwards through a
//! [`Messenger`](crate::messaging::Messenger) as one request, answered by at
//! most one response.

pub mod shard;
pub mod table;
pub mod wire;

pub use shard::{Shard, Waiter};
pub use table::{owner_of, DistributedHashTable};
pub use wire::DhtMessage;
