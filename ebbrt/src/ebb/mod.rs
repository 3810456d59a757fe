//! Ebb identity and representative resolution.

pub mod id;
pub mod rep;
pub mod root;
pub mod table;

pub use id::{EbbId, EbbRef, IdAllocator};
pub use rep::{AsAnyArc, EbbRep};
pub use root::{EbbRoot, Location, PerContextRoot, SharedRoot, SharingPolicy};
pub use table::{MissHandler, Resolver, RootMissHandler, RootTable};
