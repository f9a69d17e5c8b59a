//! Mutex-guarded wrapper that lets several threads share one allocator.

use crate::allocators::{Allocation, ArenaId, OffsetAllocator};
use crate::api::error::AllocError;
use crate::api::stats::AllocatorStats;
use crate::sync::mutex::Mutex;

pub use crate::sync::mutex::MutexGuard;

/// An [`OffsetAllocator`] behind a mutex, usable through `&self`.
///
/// Uses `parking_lot` when the feature is enabled.
#[derive(Debug)]
pub struct SharedAllocator<A> {
    arena: ArenaId,
    inner: Mutex<A>,
}

impl<A: OffsetAllocator> SharedAllocator<A> {
    pub fn new(allocator: A) -> Self {
        Self {
            arena: allocator.arena(),
            inner: Mutex::new(allocator),
        }
    }

    /// The wrapped allocator's arena.
    pub fn arena(&self) -> ArenaId {
        self.arena
    }

    pub fn allocate(&self, size: u64) -> Result<Allocation, AllocError> {
        self.inner.lock().allocate(size)
    }

    pub fn free(&self, allocation: &Allocation) -> Result<(), AllocError> {
        self.inner.lock().free(allocation)
    }

    pub fn used(&self) -> u64 {
        self.inner.lock().used()
    }

    pub fn stats(&self) -> AllocatorStats {
        self.inner.lock().stats()
    }

    /// Lock the allocator for a batch of operations or for inherent methods
    /// the trait does not expose.
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }

    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}
