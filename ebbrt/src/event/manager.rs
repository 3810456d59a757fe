//! The per-context event manager.
//!
//! # Pump Order
//!
//! ```text
//! pump_once():
//!   1. A raised interrupt is pending      → fire its handler
//!   2. An event source reports readiness  → fire the reported slot
//!   3. Deferred work is queued            → run one item
//!   4. Nothing ready                      → block, then retry from 1
//! ```
//!
//! Step 4 is the only place the runtime ever suspends. With no event
//! sources registered it waits until [`raise`](EventManager::raise) or
//! [`defer`](EventManager::defer) is called from another thread; with
//! sources registered the wait is bounded by the poll interval so probing
//! continues.
//!
//! # Example
//!
//! ```rust,ignore
//! let events = Arc::new(EventManager::new(Location::new(0), &RuntimeConfig::default()));
//! let slot = events.allocate_interrupt(|| {
//!     tracing::info!("device ready");
//!     Ok(())
//! })?;
//!
//! // From a device thread:
//! events.raise(slot);
//!
//! // On the context's loop thread:
//! events.pump_once()?;
//! ```

use crate::ebb::Location;
use crate::error::{EventError, Result};
use crate::event::EventSource;
use crate::runtime::RuntimeConfig;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Interrupt slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u16);

impl SlotId {
    /// Wrap a raw slot number.
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// The raw slot number.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irq{}", self.0)
    }
}

/// Whether the manager is between events or running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for, or about to look for, the next event.
    Idle,
    /// Running a handler or deferred item.
    Dispatching,
}

type Handler = Arc<dyn Fn() -> Result<()> + Send + Sync>;
type Deferred = Box<dyn FnOnce() -> Result<()> + Send>;

struct SlotTable {
    next: u32,
    limit: u32,
    handlers: HashMap<SlotId, Handler>,
}

#[derive(Default)]
struct Pending {
    raised: VecDeque<SlotId>,
    deferred: VecDeque<Deferred>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.deferred.is_empty()
    }
}

enum Work {
    Interrupt(SlotId),
    Deferred(Deferred),
}

/// Cooperative single-threaded scheduler for one execution context.
///
/// Handler registration and `raise`/`defer` are thread-safe; `pump_once`
/// must only be called from the owning context's loop and is not
/// re-entrant.
pub struct EventManager {
    location: Location,
    slots: Mutex<SlotTable>,
    pending: Mutex<Pending>,
    wakeup: Condvar,
    sources: Mutex<Vec<Arc<dyn EventSource>>>,
    poll_interval: Duration,
    dispatching: AtomicBool,
}

impl EventManager {
    /// Create a manager for `location` using the slot range and poll interval of `config`.
    pub fn new(location: Location, config: &RuntimeConfig) -> Self {
        Self {
            location,
            slots: Mutex::new(SlotTable {
                next: u32::from(config.first_interrupt_slot()),
                limit: u32::from(config.interrupt_slots()),
                handlers: HashMap::new(),
            }),
            pending: Mutex::new(Pending::default()),
            wakeup: Condvar::new(),
            sources: Mutex::new(Vec::new()),
            poll_interval: config.poll_interval(),
            dispatching: AtomicBool::new(false),
        }
    }

    /// The context this manager belongs to.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Current dispatch state.
    pub fn state(&self) -> DispatchState {
        if self.dispatching.load(Ordering::Acquire) {
            DispatchState::Dispatching
        } else {
            DispatchState::Idle
        }
    }

    /// Reserve the next interrupt slot for `handler`.
    ///
    /// Slots are handed out in increasing order starting above the reserved
    /// low range.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SlotsExhausted` once every slot is taken.
    pub fn allocate_interrupt(
        &self,
        handler: impl Fn() -> Result<()> + Send + Sync + 'static,
    ) -> Result<SlotId> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.next >= slots.limit {
            let max = u16::try_from(slots.limit).unwrap_or(u16::MAX);
            return Err(EventError::SlotsExhausted { max }.into());
        }
        // `limit` fits in a u16, so every slot below it does too.
        let slot = SlotId(slots.next as u16);
        slots.next += 1;
        slots.handlers.insert(slot, Arc::new(handler));
        tracing::debug!("Allocated {} at {}", slot, self.location);
        Ok(slot)
    }

    /// Invoke the handler of `slot` synchronously.
    ///
    /// # Errors
    ///
    /// Returns `EventError::UnregisteredSlot` if nothing is registered on
    /// `slot`, otherwise whatever the handler returns.
    pub fn fire(&self, slot: SlotId) -> Result<()> {
        let handler = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .get(&slot)
            .cloned();
        match handler {
            Some(handler) => handler(),
            None => {
                tracing::error!("{} fired with no handler at {}", slot, self.location);
                Err(EventError::UnregisteredSlot(slot).into())
            }
        }
    }

    /// Mark `slot` pending and wake the loop if it is blocked.
    ///
    /// Safe to call from any thread.
    pub fn raise(&self, slot: SlotId) {
        self.lock_pending().raised.push_back(slot);
        self.wakeup.notify_all();
    }

    /// Queue work to run once no interrupt is immediately pending.
    pub fn defer(&self, work: impl FnOnce() -> Result<()> + Send + 'static) {
        self.lock_pending().deferred.push_back(Box::new(work));
        self.wakeup.notify_all();
    }

    /// Register a source to poll before deferred work and before blocking.
    pub fn register_source(&self, source: Arc<dyn EventSource>) {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source);
    }

    /// A handle devices use to raise `slot` on this manager.
    pub fn interrupt_line(self: &Arc<Self>, slot: SlotId) -> InterruptLine {
        InterruptLine {
            events: Arc::downgrade(self),
            slot,
        }
    }

    /// Whether a raised interrupt or deferred item is queued.
    ///
    /// Event sources are not polled.
    pub fn has_pending(&self) -> bool {
        !self.lock_pending().is_empty()
    }

    /// Dispatch exactly one unit of work, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns `EventError::Reentrant` if called from inside a handler, and
    /// propagates handler, deferred-work and event-source errors unchanged.
    pub fn pump_once(&self) -> Result<()> {
        self.check_not_dispatching()?;
        let work = loop {
            if let Some(work) = self.next_ready()? {
                break work;
            }
            self.wait();
        };
        self.dispatch(work)
    }

    /// Dispatch one unit of work if one is ready, without blocking.
    ///
    /// Returns whether anything was dispatched.
    pub fn try_pump(&self) -> Result<bool> {
        self.check_not_dispatching()?;
        match self.next_ready()? {
            Some(work) => self.dispatch(work).map(|()| true),
            None => Ok(false),
        }
    }

    // Checked before anything is dequeued so a rejected pump leaves the
    // queues untouched.
    fn check_not_dispatching(&self) -> Result<()> {
        if self.dispatching.load(Ordering::Acquire) {
            tracing::warn!("Re-entrant pump rejected at {}", self.location);
            return Err(EventError::Reentrant.into());
        }
        Ok(())
    }

    fn next_ready(&self) -> Result<Option<Work>> {
        if let Some(slot) = self.lock_pending().raised.pop_front() {
            return Ok(Some(Work::Interrupt(slot)));
        }

        let sources = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for source in sources {
            if let Some(slot) = source.poll()? {
                return Ok(Some(Work::Interrupt(slot)));
            }
        }

        Ok(self.lock_pending().deferred.pop_front().map(Work::Deferred))
    }

    fn dispatch(&self, work: Work) -> Result<()> {
        if self.dispatching.swap(true, Ordering::AcqRel) {
            return Err(EventError::Reentrant.into());
        }
        let result = match work {
            Work::Interrupt(slot) => self.fire(slot),
            Work::Deferred(work) => work(),
        };
        self.dispatching.store(false, Ordering::Release);
        result
    }

    fn wait(&self) {
        let polling = !self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty();
        let pending = self.lock_pending();
        if !pending.is_empty() {
            return;
        }
        if polling {
            let (_pending, _) = self
                .wakeup
                .wait_timeout(pending, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner);
        } else {
            let _pending = self
                .wakeup
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("location", &self.location)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A device's handle for raising one interrupt slot.
///
/// Holds the manager weakly so a device outliving its context does not keep
/// the context alive; raising after the context is gone is a no-op.
#[derive(Debug, Clone)]
pub struct InterruptLine {
    events: Weak<EventManager>,
    slot: SlotId,
}

impl InterruptLine {
    /// The slot this line raises.
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Raise the slot on its manager.
    pub fn raise(&self) {
        if let Some(events) = self.events.upgrade() {
            events.raise(self.slot);
        }
    }
}
