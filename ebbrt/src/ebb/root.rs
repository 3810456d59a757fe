//! Roots: factories that produce representatives for an Ebb.
//!
//! A root is what gets bound to an [`EbbId`](crate::ebb::EbbId) in the
//! process-wide [`RootTable`](crate::ebb::RootTable). When a context misses in
//! its local translation cache, the miss handler asks the root for that
//! context's representative.
//!
//! # Sharing Policies
//!
//! ```text
//! SharedRoot<T>                   PerContextRoot<T>
//!
//!  ctx0 ──┐                        ctx0 ──► rep(0)
//!  ctx1 ──┼──► one Arc<T>          ctx1 ──► rep(1)
//!  ctx2 ──┘                        ctx2 ──► rep(2)
//! ```

use crate::ebb::EbbRep;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Identifies one execution context within a runtime instance.
///
/// Location 0 is the context that performs process-wide initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location(u16);

impl Location {
    /// Wrap a raw location index.
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// The raw index.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Whether this is the bootstrapping location.
    pub const fn is_first(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc{}", self.0)
    }
}

/// How representatives are shared between contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingPolicy {
    /// One instance shared by every context in the process.
    Shared,
    /// One instance per execution context.
    PerContext,
}

/// Produces the representative a given context should use.
pub trait EbbRoot: Send + Sync {
    /// Return the representative for `location`, creating it if needed.
    ///
    /// Must return the same instance on repeated calls for one location.
    fn rep_for(&self, location: Location) -> Result<Arc<dyn EbbRep>>;

    /// The sharing policy this root implements.
    fn policy(&self) -> SharingPolicy;
}

type SharedFactory<T> = Box<dyn Fn() -> Result<Arc<T>> + Send + Sync>;
type LocalFactory<T> = Box<dyn Fn(Location) -> Result<Arc<T>> + Send + Sync>;

/// Root whose single representative is shared by all contexts.
pub struct SharedRoot<T: EbbRep> {
    rep: Mutex<Option<Arc<T>>>,
    factory: SharedFactory<T>,
}

impl<T: EbbRep> SharedRoot<T> {
    /// Root around an already constructed representative.
    pub fn new(rep: Arc<T>) -> Self {
        Self {
            rep: Mutex::new(Some(rep.clone())),
            factory: Box::new(move || Ok(rep.clone())),
        }
    }

    /// Root that constructs its representative on first resolution.
    pub fn lazy(factory: impl Fn() -> Result<Arc<T>> + Send + Sync + 'static) -> Self {
        Self {
            rep: Mutex::new(None),
            factory: Box::new(factory),
        }
    }
}

impl<T: EbbRep> EbbRoot for SharedRoot<T> {
    fn rep_for(&self, _location: Location) -> Result<Arc<dyn EbbRep>> {
        // Held across construction so concurrent first resolutions build one instance.
        let mut slot = self.rep.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rep) = slot.as_ref() {
            return Ok(rep.clone());
        }
        let rep = (self.factory)()?;
        *slot = Some(rep.clone());
        Ok(rep)
    }

    fn policy(&self) -> SharingPolicy {
        SharingPolicy::Shared
    }
}

/// Root that builds a separate representative for every context.
pub struct PerContextRoot<T: EbbRep> {
    reps: Mutex<HashMap<Location, Arc<T>>>,
    factory: LocalFactory<T>,
}

impl<T: EbbRep> PerContextRoot<T> {
    /// Root calling `factory` once per location.
    pub fn new(factory: impl Fn(Location) -> Result<Arc<T>> + Send + Sync + 'static) -> Self {
        Self {
            reps: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Number of representatives built so far.
    pub fn instances(&self) -> usize {
        self.reps.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl<T: EbbRep> EbbRoot for PerContextRoot<T> {
    fn rep_for(&self, location: Location) -> Result<Arc<dyn EbbRep>> {
        if let Some(rep) = self
            .reps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&location)
        {
            return Ok(rep.clone());
        }

        // Only `location`'s own loop resolves for it, so building outside the
        // lock cannot race with itself.
        let rep = (self.factory)(location)?;
        let rep = self
            .reps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(location)
            .or_insert(rep)
            .clone();
        Ok(rep)
    }

    fn policy(&self) -> SharingPolicy {
        SharingPolicy::PerContext
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        location: Option<Location>,
    }

    impl EbbRep for Counter {}

    fn same(a: &Arc<dyn EbbRep>, b: &Arc<dyn EbbRep>) -> bool {
        Arc::ptr_eq(&a.clone().as_any_arc(), &b.clone().as_any_arc())
    }

    #[test]
    fn test_shared_root_returns_one_instance() {
        let root = SharedRoot::new(Arc::new(Counter { location: None }));
        let a = root.rep_for(Location::new(0)).unwrap();
        let b = root.rep_for(Location::new(3)).unwrap();
        assert!(same(&a, &b));
        assert_eq!(root.policy(), SharingPolicy::Shared);
    }

    #[test]
    fn test_lazy_shared_root_builds_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let root = SharedRoot::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Counter { location: None }))
        });

        let a = root.rep_for(Location::new(0)).unwrap();
        let b = root.rep_for(Location::new(1)).unwrap();
        assert!(same(&a, &b));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_per_context_root_builds_per_location() {
        let root = PerContextRoot::new(|location| {
            Ok(Arc::new(Counter {
                location: Some(location),
            }))
        });

        let a0 = root.rep_for(Location::new(0)).unwrap();
        let a1 = root.rep_for(Location::new(1)).unwrap();
        let again = root.rep_for(Location::new(0)).unwrap();

        assert!(!same(&a0, &a1));
        assert!(same(&a0, &again));
        assert_eq!(root.instances(), 2);

        let rep = a1.as_any_arc().downcast::<Counter>().unwrap();
        assert_eq!(rep.location, Some(Location::new(1)));
    }
}
