//! Process runtime: configuration, the runtime instance and per-location
//! contexts.
//!
//! ```text
//! ┌──────────────────────── Runtime (one per process) ───────────────────────┐
//! │  RuntimeConfig   IdAllocator   RootTable   init barrier   start hook     │
//! └──────────────┬───────────────────────┬───────────────────────────────────┘
//!                │                       │
//!       ┌────────▼────────┐     ┌────────▼────────┐
//!       │ Context loc0    │     │ Context loc1    │   ...
//!       │  Resolver cache │     │  Resolver cache │
//!       │  EventManager   │     │  EventManager   │
//!       └─────────────────┘     └─────────────────┘
//! ```

pub mod config;
pub mod context;
#[allow(clippy::module_inception)]
pub mod runtime;

pub use config::{DhtConfig, NicConfig, RuntimeConfig, RuntimeConfigBuilder};
pub use context::{Context, LoopCount};
pub use runtime::{Runtime, RuntimeBuilder};
