//! Translation tables: process-wide roots and per-context representative caches.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Resolver (one per Context)   │
//! │                              │
//! │  cache: EbbId → Arc<dyn Rep> │──miss──┐
//! └──────────────────────────────┘        │
//!                                         ▼
//!                          ┌──────────────────────────────┐
//!                          │ MissHandler                  │
//!                          │  (default: RootMissHandler)  │
//!                          └──────────────────────────────┘
//!                                         │
//!                                         ▼
//!                          ┌──────────────────────────────┐
//!                          │ RootTable (process-wide)     │
//!                          │  EbbId → Arc<dyn EbbRoot>    │
//!                          └──────────────────────────────┘
//! ```
//!
//! # Resolution
//!
//! ```text
//! Fast path:
//!   1. Look up id in the context cache
//!   2. Hit → return the representative
//!
//! Slow path (first use in this context):
//!   1. Invoke the miss handler (outside the cache lock)
//!   2. Handler asks the bound root for this location's representative
//!   3. Fill the cache; later lookups take the fast path
//! ```

use crate::ebb::{EbbId, EbbRef, EbbRep, EbbRoot, Location};
use crate::error::{Result, TranslationError};
use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Process-wide table of roots keyed by id.
///
/// Bindings are created during process-wide initialization or by
/// [`bind`](RootTable::bind) at any later point, and live until the table is
/// dropped. There is no eviction.
#[derive(Default)]
pub struct RootTable {
    roots: Mutex<HashMap<EbbId, Arc<dyn EbbRoot>>>,
}

impl RootTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `root` for `id`.
    ///
    /// # Errors
    ///
    /// Returns `TranslationError::AlreadyBound` if `id` already has a root;
    /// the first binding wins.
    pub fn bind(&self, id: EbbId, root: Arc<dyn EbbRoot>) -> Result<()> {
        let mut roots = self.roots.lock().unwrap_or_else(PoisonError::into_inner);
        if roots.contains_key(&id) {
            return Err(TranslationError::AlreadyBound(id).into());
        }
        tracing::debug!("Bound {} ({:?})", id, root.policy());
        roots.insert(id, root);
        Ok(())
    }

    /// Find the root bound to `id`.
    pub fn find(&self, id: EbbId) -> Option<Arc<dyn EbbRoot>> {
        self.roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of bound ids.
    pub fn len(&self) -> usize {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for RootTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootTable").field("bound", &self.len()).finish()
    }
}

/// Resolves an id that has no cached representative in a context.
///
/// The handler must either return a usable representative or fail; a
/// failure is unrecoverable for the calling operation.
pub trait MissHandler: Send + Sync {
    /// Produce the representative of `id` for `location`.
    fn handle_miss(
        &self,
        roots: &RootTable,
        location: Location,
        id: EbbId,
    ) -> Result<Arc<dyn EbbRep>>;
}

impl<F> MissHandler for F
where
    F: Fn(&RootTable, Location, EbbId) -> Result<Arc<dyn EbbRep>> + Send + Sync,
{
    fn handle_miss(
        &self,
        roots: &RootTable,
        location: Location,
        id: EbbId,
    ) -> Result<Arc<dyn EbbRep>> {
        self(roots, location, id)
    }
}

/// Default miss handler: ask the bound root, fail if there is none.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootMissHandler;

impl MissHandler for RootMissHandler {
    fn handle_miss(
        &self,
        roots: &RootTable,
        location: Location,
        id: EbbId,
    ) -> Result<Arc<dyn EbbRep>> {
        match roots.find(id) {
            Some(root) => root.rep_for(location),
            None => {
                tracing::error!("Miss on unbound {} at {}", id, location);
                Err(TranslationError::Unbound(id).into())
            }
        }
    }
}

/// Per-context translation cache in front of the process-wide roots.
///
/// Cheap to clone: clones share one cache, so a message handler captured in
/// a closure resolves through the same cache as the context that registered
/// it.
#[derive(Clone)]
pub struct Resolver {
    location: Location,
    roots: Arc<RootTable>,
    miss_handler: Arc<dyn MissHandler>,
    cache: Arc<Mutex<HashMap<EbbId, Arc<dyn EbbRep>>>>,
}

impl Resolver {
    /// Create an empty cache for `location`.
    pub fn new(location: Location, roots: Arc<RootTable>, miss_handler: Arc<dyn MissHandler>) -> Self {
        Self {
            location,
            roots,
            miss_handler,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The location this cache belongs to.
    pub fn location(&self) -> Location {
        self.location
    }

    /// The process-wide root table.
    pub fn roots(&self) -> &Arc<RootTable> {
        &self.roots
    }

    /// Resolve `id` to this context's representative.
    ///
    /// # Errors
    ///
    /// Propagates the miss handler's error (by default
    /// `TranslationError::Unbound` when nothing is bound).
    pub fn resolve(&self, id: EbbId) -> Result<Arc<dyn EbbRep>> {
        if let Some(rep) = self.cached(id) {
            return Ok(rep);
        }

        // The miss handler may itself resolve other ids, so it runs unlocked.
        let rep = self
            .miss_handler
            .handle_miss(&self.roots, self.location, id)?;
        let rep = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert(rep)
            .clone();
        tracing::debug!("Cached {} at {}", id, self.location);
        Ok(rep)
    }

    /// Resolve and downcast to the concrete representative type.
    ///
    /// # Errors
    ///
    /// Returns `TranslationError::TypeMismatch` if the representative is not a `T`.
    pub fn resolve_as<T: EbbRep>(&self, ebb: EbbRef<T>) -> Result<Arc<T>> {
        let rep = self.resolve(ebb.id())?;
        rep.as_any_arc().downcast::<T>().map_err(|_| {
            TranslationError::TypeMismatch {
                id: ebb.id(),
                expected: type_name::<T>(),
            }
            .into()
        })
    }

    /// Pre-populate the cache, bypassing the miss handler.
    pub fn install(&self, id: EbbId, rep: Arc<dyn EbbRep>) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, rep);
    }

    /// Whether `id` already has a cached representative here.
    pub fn is_cached(&self, id: EbbId) -> bool {
        self.cached(id).is_some()
    }

    fn cached(&self, id: EbbId) -> Option<Arc<dyn EbbRep>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}
