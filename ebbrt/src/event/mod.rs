//! Cooperative event dispatch.
//!
//! Each execution context owns one [`EventManager`]. Interrupts are data, not
//! signals: a device or transport marks a slot pending (or an
//! [`EventSource`] reports one when polled), and the context's loop picks it
//! up on its next [`pump_once`](EventManager::pump_once).

pub mod manager;
pub mod source;

pub use manager::{DispatchState, EventManager, InterruptLine, SlotId};
pub use source::EventSource;
