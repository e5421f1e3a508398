//! Payload arena (`spec.md` §3, §4.5, §9).
//!
//! The original design notes (`spec.md` §9) recommend the slab-allocator variant over the
//! bump-with-wrap buffer: a shared byte budget guards admission, and each in-flight request's
//! storage is released back to the budget when its slot is dropped. This keeps the non-overlap
//! invariant without unsafe pointer arithmetic into a shared buffer.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use thiserror::Error;

/// Error reserving arena space for an in-flight request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArenaError {
    /// The request would push outstanding usage past the arena's byte budget.
    #[error("arena exhausted: requested {requested} bytes, {available} available of {capacity}")]
    Exhausted {
        /// Bytes requested by this reservation.
        requested: usize,
        /// Bytes currently available.
        available: usize,
        /// Total configured capacity.
        capacity: usize,
    },
}

struct Inner {
    capacity: usize,
    in_use: AtomicUsize,
}

/// A shared byte budget bounding the total size of concurrently in-flight request payloads.
#[derive(Clone)]
pub struct PayloadArena {
    inner: Arc<Inner>,
}

impl PayloadArena {
    /// Construct an arena with the given byte capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Total configured byte capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently reserved by outstanding slots.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Reserve `len` bytes, copying `payload` into an owned slot.
    ///
    /// The reservation is released back to the arena's budget when the returned [`ArenaSlot`] is
    /// dropped, matching the spec's "released when its response has been sent" lifecycle as long
    /// as callers drop the slot only after the response is handed to the send thread.
    ///
    /// # Errors
    ///
    /// Returns `Err` if admitting `len` more bytes would exceed the arena's capacity.
    pub fn reserve(&self, payload: &[u8]) -> Result<ArenaSlot, ArenaError> {
        let len = payload.len();
        let mut current = self.inner.in_use.load(Ordering::Acquire);
        loop {
            let next = current + len;
            if next > self.inner.capacity {
                return Err(ArenaError::Exhausted {
                    requested: len,
                    available: self.inner.capacity.saturating_sub(current),
                    capacity: self.inner.capacity,
                });
            }
            match self.inner.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Ok(ArenaSlot {
            arena: self.inner.clone(),
            bytes: payload.to_vec(),
        })
    }
}

/// An owned, arena-accounted copy of a request's payload bytes.
///
/// Dropping the slot credits its byte length back to the owning arena's budget.
pub struct ArenaSlot {
    arena: Arc<Inner>,
    bytes: Vec<u8>,
}

impl ArenaSlot {
    /// The reserved payload bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes this slot holds the arena's budget against.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether this slot holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for ArenaSlot {
    fn drop(&mut self) {
        self.arena.in_use.fetch_sub(self.bytes.len(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_tracks_in_use_bytes() {
        let arena = PayloadArena::new(16);
        let slot = arena.reserve(&[0u8; 8]).unwrap();
        assert_eq!(arena.in_use(), 8);
        drop(slot);
        assert_eq!(arena.in_use(), 0);
    }

    #[test]
    fn reserve_rejects_over_capacity() {
        let arena = PayloadArena::new(8);
        let _slot = arena.reserve(&[0u8; 8]).unwrap();
        let err = arena.reserve(&[0u8; 1]).unwrap_err();
        assert!(matches!(err, ArenaError::Exhausted { .. }));
    }

    #[test]
    fn concurrent_slots_never_exceed_capacity() {
        let arena = PayloadArena::new(64);
        let a = arena.reserve(&[0u8; 20]).unwrap();
        let b = arena.reserve(&[0u8; 20]).unwrap();
        let c = arena.reserve(&[0u8; 20]).unwrap();
        assert_eq!(arena.in_use(), 60);
        assert!(arena.reserve(&[0u8; 10]).is_err());
        drop(a);
        let d = arena.reserve(&[0u8; 10]).unwrap();
        assert_eq!(arena.in_use(), 50);
        drop((b, c, d));
        assert_eq!(arena.in_use(), 0);
    }
}
