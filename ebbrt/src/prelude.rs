//! Common imports.
//!
//! ```rust,ignore
//! use ebbrt::prelude::*;
//! ```

pub use crate::dht::DistributedHashTable;
pub use crate::ebb::{EbbId, EbbRef, EbbRep, EbbRoot, Location, PerContextRoot, SharedRoot};
pub use crate::error::{EbbError, Result};
pub use crate::messaging::{Completion, Messenger, NetworkId};
pub use crate::runtime::{Context, LoopCount, Runtime, RuntimeConfig};
pub use bytes::Bytes;
pub use std::sync::Arc;
