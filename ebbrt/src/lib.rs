//! # ebbrt
//!
//! An event-driven library runtime built around Elastic Building Blocks
//! (Ebbs): distributed objects addressed by a process-wide [`EbbId`] whose
//! calls are served by a per-location representative.
//!
//! ## Crate Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Application Ebbs                                            │
//! │   • DistributedHashTable (dht)    • WorkBag (workbag)        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  messaging: Messenger trait                                  │
//! │   • FrameMessenger ──▶ net: VirtualNic, Ring, LoopbackSwitch │
//! │   • GroupMessenger ──▶ group: ProcessGroup, LocalGroup       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  runtime: Runtime, Context        event: EventManager        │
//! │  ebb: EbbId, EbbRoot, RootTable, Resolver                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ebbrt::prelude::*;
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let ctx = Context::new(&runtime)?;
//!
//! let id = runtime.allocate_id()?;
//! runtime.bind(id, Arc::new(SharedRoot::new(Arc::new(MyRep::default()))))?;
//! let rep = ctx.resolve_as(EbbRef::<MyRep>::new(id))?;
//!
//! ctx.run_loop(LoopCount::Unbounded)?;
//! ```
//!
//! ## Execution model
//!
//! Every [`Context`] owns one [`EventManager`] and is driven by one thread.
//! Handlers run to completion; a blocking call inside a handler stalls its
//! location. Errors are never swallowed by the loop: they surface from
//! [`Context::run_loop`].

#![deny(missing_docs)]

pub mod dht;
pub mod ebb;
pub mod error;
pub mod event;
pub mod group;
pub mod messaging;
pub mod net;
pub mod prelude;
pub mod runtime;
pub mod workbag;

pub use dht::DistributedHashTable;
pub use ebb::{EbbId, EbbRef, EbbRep, EbbRoot, Location, PerContextRoot, Resolver, SharedRoot};
pub use error::{EbbError, Result};
pub use event::{EventManager, SlotId};
pub use messaging::{Completion, FrameMessenger, GroupMessenger, MacAddress, Messenger, NetworkId};
pub use runtime::{Context, DhtConfig, LoopCount, NicConfig, Runtime, RuntimeConfig};
pub use workbag::WorkBag;
