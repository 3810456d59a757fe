//! Per-location execution context.

use crate::ebb::{EbbRef, EbbRep, Location, Resolver};
use crate::error::Result;
use crate::event::EventManager;
use crate::runtime::Runtime;
use std::fmt;
use std::sync::Arc;

/// How many units of work [`Context::run_loop`] dispatches before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCount {
    /// Dispatch exactly this many units, blocking between them.
    Bounded(usize),
    /// Dispatch until an error surfaces.
    Unbounded,
}

/// One execution location: a location id, its representative cache and its
/// event manager.
///
/// A context is driven by exactly one thread. Any thread may create one; the
/// first created becomes location 0 and runs process-wide initialization.
pub struct Context {
    runtime: Arc<Runtime>,
    location: Location,
    resolver: Resolver,
    events: Arc<EventManager>,
}

impl Context {
    /// Claim the next location of `runtime`.
    ///
    /// Location 0 runs the runtime's initializers; every other location
    /// blocks until they have completed. Then the start hook runs.
    ///
    /// # Errors
    ///
    /// - `TranslationError::ContextsExhausted` when every location is taken
    /// - `EbbError::InitFailed` at other locations if location 0 failed
    /// - whatever the initializers or the start hook return
    pub fn new(runtime: &Arc<Runtime>) -> Result<Self> {
        let location = runtime.allocate_location()?;
        if location.is_first() {
            runtime.initialize()?;
        } else {
            runtime.wait_initialized()?;
        }

        let context = Self {
            runtime: runtime.clone(),
            location,
            resolver: runtime.resolver_for(location),
            events: Arc::new(EventManager::new(location, runtime.config())),
        };
        tracing::info!("Context {} started", location);

        runtime.start(&context)?;
        Ok(context)
    }

    /// This context's location.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Representative cache for this location.
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Event manager for this location.
    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    /// The runtime this context belongs to.
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Resolve `ebb` to its representative at this location.
    pub fn resolve_as<T: EbbRep>(&self, ebb: EbbRef<T>) -> Result<Arc<T>> {
        self.resolver.resolve_as(ebb)
    }

    /// Dispatch one unit of work, blocking until one is ready.
    pub fn pump_once(&self) -> Result<()> {
        self.events.pump_once()
    }

    /// Drive the event loop.
    ///
    /// Returns after `Bounded(n)` dispatches, or with the first error.
    /// `Unbounded` only returns on error.
    pub fn run_loop(&self, count: LoopCount) -> Result<()> {
        match count {
            LoopCount::Bounded(n) => {
                for _ in 0..n {
                    self.events.pump_once()?;
                }
                Ok(())
            }
            LoopCount::Unbounded => loop {
                self.events.pump_once().inspect_err(|e| {
                    tracing::error!("Event loop at {} stopped: {}", self.location, e);
                })?;
            },
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("location", &self.location)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
