//! Pollable event sources.

use crate::error::Result;
use crate::event::SlotId;

/// Something the event manager polls before it blocks.
///
/// Transports that cannot raise interrupts themselves (a process-group
/// transport that has to be probed, for example) register a source. The
/// manager polls every source on each pump, ahead of deferred work, and
/// fires the slot a source returns.
pub trait EventSource: Send + Sync {
    /// Check for readiness.
    ///
    /// Returns the slot to fire, or `None` if nothing is ready. Errors
    /// propagate out of the pump unchanged.
    fn poll(&self) -> Result<Option<SlotId>>;
}

impl<F> EventSource for F
where
    F: Fn() -> Result<Option<SlotId>> + Send + Sync,
{
    fn poll(&self) -> Result<Option<SlotId>> {
        self()
    }
}
