//! Core identifier types for elastic building blocks.

use crate::error::TranslationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// System-wide identifier of one logical component instance.
///
/// An `EbbId` names a component independent of where its representatives
/// live. It is stable for the component's lifetime and never reissued by the
/// [`IdAllocator`] that produced it.
///
/// # Wire Format
///
/// Encoded as a little-endian `u32` in every message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EbbId(u32);

impl EbbId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw integer value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Little-endian encoding used in message headers.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Decode from the little-endian header encoding.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for EbbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ebb#{}", self.0)
    }
}

/// Typed handle to an Ebb.
///
/// Carries only the [`EbbId`]; the type parameter records which
/// representative type a resolution is expected to produce, so
/// [`Resolver::resolve_as`](crate::ebb::Resolver::resolve_as) can downcast.
///
/// # Example
///
/// ```rust,ignore
/// let table: EbbRef<DistributedHashTable> = EbbRef::new(runtime.allocate_id()?);
/// let rep = ctx.resolver().resolve_as(table)?;
/// rep.set(b"foo", "bar", None)?;
/// ```
pub struct EbbRef<T: ?Sized> {
    id: EbbId,
    _rep: PhantomData<fn() -> T>,
}

impl<T: ?Sized> EbbRef<T> {
    /// Create a typed handle for `id`.
    pub const fn new(id: EbbId) -> Self {
        Self {
            id,
            _rep: PhantomData,
        }
    }

    /// The untyped identifier.
    pub const fn id(&self) -> EbbId {
        self.id
    }
}

impl<T: ?Sized> Clone for EbbRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for EbbRef<T> {}

impl<T: ?Sized> fmt::Debug for EbbRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EbbRef").field(&self.id).finish()
    }
}

impl<T: ?Sized> PartialEq for EbbRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T: ?Sized> Eq for EbbRef<T> {}

/// Hands out fresh identifiers from a bounded range.
///
/// Ids below `first` are reserved for static bindings (see
/// [`RuntimeConfig::static_ebbs`](crate::runtime::RuntimeConfig)). The
/// counter only moves forward, so an id is never issued twice. Id 0 is
/// never issued.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
    max: u32,
}

impl IdAllocator {
    /// Allocator issuing ids in `first..=max`.
    pub fn new(first: u32, max: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
            max,
        }
    }

    /// Issue the next identifier.
    ///
    /// # Errors
    ///
    /// Returns `TranslationError::IdSpaceExhausted` once `max` has been issued.
    pub fn allocate(&self) -> Result<EbbId, TranslationError> {
        let max = self.max;
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                // 0 marks exhaustion once the counter would overflow.
                if next == 0 || next > max {
                    None
                } else {
                    Some(next.checked_add(1).unwrap_or(0))
                }
            })
            .map(EbbId::new)
            .map_err(|_| TranslationError::IdSpaceExhausted { max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_is_monotonic() {
        let alloc = IdAllocator::new(256, 1000);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!(a, EbbId::new(256));
        assert_eq!(b, EbbId::new(257));
    }

    #[test]
    fn test_allocator_exhaustion() {
        let alloc = IdAllocator::new(10, 11);
        assert!(alloc.allocate().is_ok());
        assert!(alloc.allocate().is_ok());
        let err = alloc.allocate().unwrap_err();
        assert!(matches!(err, TranslationError::IdSpaceExhausted { max: 11 }));
        // Stays exhausted.
        assert!(alloc.allocate().is_err());
    }

    #[test]
    fn test_allocator_full_range() {
        let alloc = IdAllocator::new(u32::MAX, u32::MAX);
        assert_eq!(alloc.allocate().unwrap(), EbbId::new(u32::MAX));
        assert!(alloc.allocate().is_err());
    }

    #[test]
    fn test_ebb_ref_is_copy() {
        let r: EbbRef<String> = EbbRef::new(EbbId::new(7));
        let copy = r;
        assert_eq!(r, copy);
        assert_eq!(copy.id().as_u32(), 7);
    }

    #[test]
    fn test_ebb_id_le_round_trip() {
        let id = EbbId::new(0x0102_0304);
        assert_eq!(id.to_le_bytes(), [4, 3, 2, 1]);
        assert_eq!(EbbId::from_le_bytes(id.to_le_bytes()), id);
    }
}
