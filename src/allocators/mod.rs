//! Allocation backends.
//!
//! Every backend manages offsets inside a byte-addressable region it does not
//! own; creating the device memory behind that region is the caller's job.

pub mod atomic_ring;
pub mod buddy;
pub mod pool;
pub mod ring;
pub mod shared;
pub mod tlsf;

use crate::api::error::AllocError;
use crate::api::stats::AllocatorStats;

/// Identifies the allocator instance an [`Allocation`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ArenaId(pub u32);

impl ArenaId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A live sub-allocation.
///
/// `size` is the reserved size after rounding, so `[offset, offset + size)`
/// never intersects another live allocation of the same arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub offset: u64,
    pub size: u64,
    pub alignment: u32,
    pub arena: ArenaId,
}

impl Allocation {
    /// One past the last reserved byte.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether this allocation's byte range intersects `other`'s.
    pub fn overlaps(&self, other: &Allocation) -> bool {
        self.arena == other.arena
            && crate::util::layout::ranges_overlap(self.offset, self.size, other.offset, other.size)
    }
}

/// Operations shared by every allocator in the suite.
pub trait OffsetAllocator {
    /// The arena this allocator hands out ranges from.
    fn arena(&self) -> ArenaId;

    /// Reserve at least `size` bytes.
    fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError>;

    /// Return a previously reserved range.
    fn free(&mut self, allocation: &Allocation) -> Result<(), AllocError>;

    /// Total bytes managed.
    fn capacity(&self) -> u64;

    /// Bytes currently reserved.
    fn used(&self) -> u64;

    /// Bytes not currently reserved.
    fn available(&self) -> u64 {
        self.capacity().saturating_sub(self.used())
    }

    /// Snapshot of the allocator's counters.
    fn stats(&self) -> AllocatorStats;
}

/// An allocator whose live ranges may be relocated by the
/// [`Defragmenter`](crate::coordinator::defrag::Defragmenter).
pub trait Compactable: OffsetAllocator {
    /// Live allocations sorted by offset.
    fn live_allocations(&self) -> Vec<Allocation>;

    /// Alignment a relocated copy of `allocation` must be placed at.
    fn placement_alignment(&self, allocation: &Allocation) -> u64;

    /// Reserve exactly `[offset, offset + size)`; fails with
    /// [`AllocError::RangeUnavailable`] if any byte of it is not free.
    fn claim_at(&mut self, offset: u64, size: u64) -> Result<Allocation, AllocError>;

    /// Whether `allocation` is still allocated with the same offset and size.
    fn is_live(&self, allocation: &Allocation) -> bool;

    /// External fragmentation of the free space, in `0.0..=1.0`.
    fn fragmentation(&self) -> f32 {
        self.stats().fragmentation()
    }
}

impl<A: OffsetAllocator + ?Sized> OffsetAllocator for Box<A> {
    fn arena(&self) -> ArenaId {
        (**self).arena()
    }

    fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        (**self).allocate(size)
    }

    fn free(&mut self, allocation: &Allocation) -> Result<(), AllocError> {
        (**self).free(allocation)
    }

    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn used(&self) -> u64 {
        (**self).used()
    }

    fn stats(&self) -> AllocatorStats {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_requires_same_arena() {
        let a = Allocation { offset: 0, size: 512, alignment: 256, arena: ArenaId(0) };
        let b = Allocation { offset: 256, size: 512, alignment: 256, arena: ArenaId(0) };
        let c = Allocation { arena: ArenaId(1), ..b };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.end(), 512);
    }

    #[test]
    fn test_boxed_allocator_forwards() {
        let mut boxed: Box<dyn OffsetAllocator> =
            Box::new(buddy::BuddyAllocator::new(ArenaId(3), 256, 4096, 256));
        let allocation = boxed.allocate(300).unwrap();
        assert_eq!(allocation.arena, ArenaId(3));
        assert_eq!(boxed.used(), 512);
        boxed.free(&allocation).unwrap();
        assert_eq!(boxed.available(), 4096);
    }
}
