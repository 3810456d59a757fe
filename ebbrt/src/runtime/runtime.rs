//! The process-wide runtime instance.
//!
//! # Bootstrap
//!
//! ```text
//! Context::new(runtime)            (any thread, any order)
//!   location = runtime.allocate_location()
//!
//!   location 0:                    other locations:
//!     bind every initializer          wait on the init condvar
//!     publish Ready, notify_all  ───▶ wake, continue
//!
//!   every location: run the application start hook
//! ```
//!
//! The barrier is one-shot. If location 0 fails, the failure is published
//! instead and every waiting context returns `EbbError::InitFailed`.

use crate::ebb::{EbbId, EbbRoot, IdAllocator, Location, MissHandler, Resolver, RootMissHandler, RootTable};
use crate::error::{EbbError, Result, TranslationError};
use crate::runtime::{Context, RuntimeConfig};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

type RootFactory = Box<dyn Fn(&Runtime, EbbId) -> Result<Arc<dyn EbbRoot>> + Send + Sync>;
type StartHook = Box<dyn Fn(&Context) -> Result<()> + Send + Sync>;

struct Initializer {
    name: String,
    factory: RootFactory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InitState {
    Pending,
    Ready,
    Failed(String),
}

/// One runtime instance per process.
///
/// Owns the id allocator, the root table and the one-time initialization
/// barrier. Shared by every [`Context`] of the process through an `Arc`.
///
/// # Example
///
/// ```rust,ignore
/// let config = RuntimeConfig::builder()
///     .static_ebb("HashTable", EbbId::new(10))
///     .build();
///
/// let runtime = Runtime::builder(config)
///     .initializer("HashTable", move |_, id| {
///         let dht = DistributedHashTable::new(id, messenger.clone(), dht_config.clone())?;
///         Ok(Arc::new(SharedRoot::new(Arc::new(dht))))
///     })
///     .on_start(|ctx| {
///         tracing::info!("started at {}", ctx.location());
///         Ok(())
///     })
///     .build()?;
///
/// let ctx = Context::new(&runtime)?;
/// ctx.run_loop(LoopCount::Unbounded)?;
/// ```
pub struct Runtime {
    config: RuntimeConfig,
    ids: IdAllocator,
    roots: Arc<RootTable>,
    miss_handler: Arc<dyn MissHandler>,
    next_location: AtomicUsize,
    initializers: Vec<Initializer>,
    init: Mutex<InitState>,
    init_done: Condvar,
    start: Option<StartHook>,
}

impl Runtime {
    /// A runtime with no initializers, the default miss handler and no start hook.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    /// Start configuring a runtime.
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            miss_handler: Arc::new(RootMissHandler),
            initializers: Vec::new(),
            start: None,
        }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The process-wide root table.
    pub fn roots(&self) -> &Arc<RootTable> {
        &self.roots
    }

    /// Issue a fresh dynamic id.
    ///
    /// # Errors
    ///
    /// Returns `TranslationError::IdSpaceExhausted` once the range is used up.
    pub fn allocate_id(&self) -> Result<EbbId> {
        self.ids.allocate().map_err(|e| {
            tracing::error!("{}", e);
            e.into()
        })
    }

    /// Bind `root` to `id`. The first binding of an id wins.
    pub fn bind(&self, id: EbbId, root: Arc<dyn EbbRoot>) -> Result<()> {
        self.roots.bind(id, root)
    }

    /// Id reserved for `name` in the configuration.
    pub fn static_id(&self, name: &str) -> Result<EbbId> {
        self.config
            .static_ebbs()
            .get(name)
            .copied()
            .ok_or_else(|| TranslationError::UnknownStaticName(name.to_string()).into())
    }

    /// Whether location 0 has finished initialization.
    pub fn is_initialized(&self) -> bool {
        *self.lock_init() == InitState::Ready
    }

    /// Number of locations handed out so far.
    pub fn contexts(&self) -> usize {
        self.next_location
            .load(Ordering::Acquire)
            .min(self.config.max_contexts())
    }

    pub(crate) fn allocate_location(&self) -> Result<Location> {
        let max = self.config.max_contexts().min(usize::from(u16::MAX) + 1);
        self.next_location
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < max).then_some(next + 1)
            })
            .map(|raw| Location::new(raw as u16))
            .map_err(|_| {
                tracing::error!("No execution locations left (max: {})", max);
                TranslationError::ContextsExhausted { max }.into()
            })
    }

    pub(crate) fn resolver_for(&self, location: Location) -> Resolver {
        Resolver::new(location, self.roots.clone(), self.miss_handler.clone())
    }

    /// Run every initializer and release the barrier. Location 0 only.
    pub(crate) fn initialize(&self) -> Result<()> {
        let result = self.run_initializers();
        let mut state = self.lock_init();
        *state = match &result {
            Ok(()) => InitState::Ready,
            Err(e) => InitState::Failed(e.to_string()),
        };
        drop(state);
        self.init_done.notify_all();

        match &result {
            Ok(()) => tracing::info!("Runtime initialized ({} static bindings)", self.initializers.len()),
            Err(e) => tracing::error!("Runtime initialization failed: {}", e),
        }
        result
    }

    /// Block until location 0 has published the outcome of initialization.
    pub(crate) fn wait_initialized(&self) -> Result<()> {
        let mut state = self.lock_init();
        while *state == InitState::Pending {
            state = self
                .init_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &*state {
            InitState::Failed(reason) => Err(EbbError::InitFailed(reason.clone())),
            _ => Ok(()),
        }
    }

    pub(crate) fn start(&self, context: &Context) -> Result<()> {
        match &self.start {
            Some(start) => start(context),
            None => Ok(()),
        }
    }

    fn run_initializers(&self) -> Result<()> {
        for init in &self.initializers {
            let id = self.static_id(&init.name)?;
            let root = (init.factory)(self, id)?;
            self.roots.bind(id, root)?;
            tracing::debug!("Static binding {} -> {}", init.name, id);
        }
        Ok(())
    }

    fn lock_init(&self) -> MutexGuard<'_, InitState> {
        self.init.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("contexts", &self.contexts())
            .field("roots", &self.roots)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    miss_handler: Arc<dyn MissHandler>,
    initializers: Vec<Initializer>,
    start: Option<StartHook>,
}

impl RuntimeBuilder {
    /// Replace the default miss handler.
    pub fn miss_handler(mut self, handler: Arc<dyn MissHandler>) -> Self {
        self.miss_handler = handler;
        self
    }

    /// Bind the root built by `factory` to the static id named `name` during
    /// initialization. Initializers run in registration order.
    pub fn initializer(
        mut self,
        name: impl Into<String>,
        factory: impl Fn(&Runtime, EbbId) -> Result<Arc<dyn EbbRoot>> + Send + Sync + 'static,
    ) -> Self {
        self.initializers.push(Initializer {
            name: name.into(),
            factory: Box::new(factory),
        });
        self
    }

    /// Hook every context runs once, after the initialization barrier.
    pub fn on_start(mut self, start: impl Fn(&Context) -> Result<()> + Send + Sync + 'static) -> Self {
        self.start = Some(Box::new(start));
        self
    }

    /// Build the runtime.
    ///
    /// # Errors
    ///
    /// Returns `TranslationError::UnknownStaticName` if an initializer names
    /// an id missing from the configuration.
    pub fn build(self) -> Result<Arc<Runtime>> {
        for init in &self.initializers {
            if !self.config.static_ebbs().contains_key(&init.name) {
                return Err(TranslationError::UnknownStaticName(init.name.clone()).into());
            }
        }
        let ids = IdAllocator::new(self.config.first_dynamic_id(), self.config.max_ebb_id());
        Ok(Arc::new(Runtime {
            ids,
            roots: Arc::new(RootTable::new()),
            miss_handler: self.miss_handler,
            next_location: AtomicUsize::new(0),
            initializers: self.initializers,
            init: Mutex::new(InitState::Pending),
            init_done: Condvar::new(),
            start: self.start,
            config: self.config,
        }))
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .field("initializers", &self.initializers.len())
            .finish_non_exhaustive()
    }
}
