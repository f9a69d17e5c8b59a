//! Power-of-two buddy allocator for variable-size long-lived allocations.
//!
//! Block sizes are `min_block << level`. A block's buddy at level `L` lives
//! at `offset ^ (min_block << L)`, so coalescing needs no parent or child
//! links: only the per-level free lists.

use std::collections::{BTreeMap, BTreeSet};

use crate::allocators::{Allocation, ArenaId, Compactable, OffsetAllocator};
use crate::api::config::SuiteConfig;
use crate::api::error::{reject_free, AllocError, ConfigError};
use crate::api::stats::AllocatorStats;

/// Buddy allocator over a single `max_block`-sized arena.
#[derive(Debug)]
pub struct BuddyAllocator {
    arena: ArenaId,

    /// Smallest block size, level 0
    min_block: u64,

    /// Largest block size, also the arena size
    max_block: u64,

    /// Free block offsets per level, lowest offset first
    free_lists: Vec<BTreeSet<u64>>,

    /// Level of every allocated block, keyed by offset
    allocated: BTreeMap<u64, usize>,

    used: u64,
    strict_frees: bool,

    allocation_count: u64,
    deallocation_count: u64,
    failed_allocations: u64,
    peak_used: u64,
}

impl BuddyAllocator {
    /// Create a buddy allocator whose blocks range from `min_block` to
    /// `max_block` bytes. `min_block` is raised to `alignment` if smaller,
    /// since every block is aligned to its own size.
    ///
    /// # Panics
    ///
    /// Panics if the bounds or the alignment are not powers of two, or if
    /// the (raised) minimum exceeds `max_block`.
    pub fn new(arena: ArenaId, min_block: u64, max_block: u64, alignment: u64) -> Self {
        assert!(
            min_block.is_power_of_two() && max_block.is_power_of_two(),
            "buddy block bounds must be powers of two"
        );
        assert!(alignment.is_power_of_two(), "buddy alignment must be a power of two");

        let min_block = min_block.max(alignment);
        assert!(min_block <= max_block, "buddy min block exceeds max block");

        let levels = (max_block / min_block).trailing_zeros() as usize + 1;
        let mut free_lists = vec![BTreeSet::new(); levels];
        // The root block covers the whole arena.
        free_lists[levels - 1].insert(0);

        Self {
            arena,
            min_block,
            max_block,
            free_lists,
            allocated: BTreeMap::new(),
            used: 0,
            strict_frees: cfg!(debug_assertions),
            allocation_count: 0,
            deallocation_count: 0,
            failed_allocations: 0,
            peak_used: 0,
        }
    }

    /// Create the buddy allocator described by `config`.
    pub fn from_config(arena: ArenaId, config: &SuiteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.buddy_max_block < config.sub_allocation_alignment {
            return Err(ConfigError::new(
                "buddy_max_block",
                "must be at least the sub-allocation alignment",
            ));
        }
        Ok(Self::new(
            arena,
            config.buddy_min_block,
            config.buddy_max_block,
            config.sub_allocation_alignment,
        )
        .with_strict_frees(config.strict_frees))
    }

    /// Builder pattern: panic on invalid frees instead of logging them.
    pub fn with_strict_frees(mut self, strict: bool) -> Self {
        self.strict_frees = strict;
        self
    }

    /// Number of levels, `log2(max_block / min_block) + 1`.
    pub fn level_count(&self) -> usize {
        self.free_lists.len()
    }

    fn top_level(&self) -> usize {
        self.free_lists.len() - 1
    }

    /// Block size at `level`.
    pub fn block_size(&self, level: usize) -> u64 {
        self.min_block << level
    }

    /// Level serving a request of `size` bytes, or `None` above `max_block`.
    pub fn level_for(&self, size: u64) -> Option<usize> {
        if size > self.max_block {
            return None;
        }
        let block = size.max(self.min_block).next_power_of_two();
        Some((block / self.min_block).trailing_zeros() as usize)
    }

    /// Offset of the buddy of the block at `offset` on `level`.
    pub fn buddy_of(&self, offset: u64, level: usize) -> u64 {
        offset ^ self.block_size(level)
    }

    /// Reserve a block of at least `size` bytes.
    ///
    /// Fails with [`AllocError::OutOfMemory`] when no level at or above the
    /// requested one has a free block. The caller may defragment and retry once.
    pub fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        if size == 0 {
            self.failed_allocations += 1;
            return Err(AllocError::InvalidSize { size });
        }
        let level = match self.level_for(size) {
            Some(level) => level,
            None => {
                self.failed_allocations += 1;
                return Err(AllocError::TooLarge { requested: size, max: self.max_block });
            }
        };

        // Start searching at the requested level going up.
        let found = (level..self.free_lists.len()).find(|&l| !self.free_lists[l].is_empty());
        let (mut current, offset) = match found.and_then(|l| self.free_lists[l].pop_first().map(|o| (l, o))) {
            Some(hit) => hit,
            None => {
                self.failed_allocations += 1;
                log::debug!(
                    "buddy {:?} out of memory: {} bytes requested, {} free",
                    self.arena,
                    size,
                    self.max_block - self.used
                );
                return Err(AllocError::OutOfMemory { requested: size });
            }
        };

        // Split down, keeping the lower half and freeing each upper half.
        while current > level {
            current -= 1;
            let upper = offset + self.block_size(current);
            self.free_lists[current].insert(upper);
        }

        Ok(self.commit(offset, level))
    }

    fn commit(&mut self, offset: u64, level: usize) -> Allocation {
        let size = self.block_size(level);
        self.allocated.insert(offset, level);
        self.used += size;
        self.allocation_count += 1;
        self.peak_used = self.peak_used.max(self.used);

        log::trace!("buddy {:?} allocate level {} -> offset {}", self.arena, level, offset);

        Allocation {
            offset,
            size,
            alignment: size.min(u64::from(u32::MAX)) as u32,
            arena: self.arena,
        }
    }

    /// Free the block at `offset` that was allocated for `size` bytes
    /// (either the requested or the rounded size).
    pub fn free(&mut self, offset: u64, size: u64) -> Result<(), AllocError> {
        let level = match self.allocated.get(&offset) {
            Some(&level) => level,
            None => {
                return Err(reject_free(
                    self.strict_frees,
                    AllocError::InvalidFree { offset, reason: "no buddy block is allocated there" },
                ));
            }
        };
        if self.level_for(size) != Some(level) {
            return Err(reject_free(
                self.strict_frees,
                AllocError::InvalidFree { offset, reason: "size does not match the allocated block" },
            ));
        }

        self.allocated.remove(&offset);
        self.used -= self.block_size(level);
        self.deallocation_count += 1;

        let (offset, level) = self.coalesce(offset, level);
        self.free_lists[level].insert(offset);
        Ok(())
    }

    /// Merge with free buddies while possible; returns the merged block.
    fn coalesce(&mut self, mut offset: u64, mut level: usize) -> (u64, usize) {
        while level < self.top_level() {
            let buddy = self.buddy_of(offset, level);
            if !self.free_lists[level].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            level += 1;
        }
        (offset, level)
    }

    /// Free blocks currently on `level`'s list.
    pub fn free_blocks_at(&self, level: usize) -> Vec<u64> {
        self.free_lists
            .get(level)
            .map(|list| list.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the arena has coalesced back into the single root block.
    pub fn is_fully_free(&self) -> bool {
        self.allocated.is_empty()
            && self.free_lists[self.top_level()].len() == 1
            && self.free_lists[..self.top_level()].iter().all(BTreeSet::is_empty)
    }

    fn largest_free_block(&self) -> u64 {
        (0..self.free_lists.len())
            .rev()
            .find(|&l| !self.free_lists[l].is_empty())
            .map_or(0, |l| self.block_size(l))
    }
}

impl OffsetAllocator for BuddyAllocator {
    fn arena(&self) -> ArenaId {
        self.arena
    }

    fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        BuddyAllocator::allocate(self, size)
    }

    fn free(&mut self, allocation: &Allocation) -> Result<(), AllocError> {
        if allocation.arena != self.arena {
            return Err(reject_free(
                self.strict_frees,
                AllocError::InvalidFree {
                    offset: allocation.offset,
                    reason: "allocation belongs to another arena",
                },
            ));
        }
        BuddyAllocator::free(self, allocation.offset, allocation.size)
    }

    fn capacity(&self) -> u64 {
        self.max_block
    }

    fn used(&self) -> u64 {
        self.used
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            capacity: self.max_block,
            used: self.used,
            peak_used: self.peak_used,
            allocation_count: self.allocation_count,
            deallocation_count: self.deallocation_count,
            failed_allocations: self.failed_allocations,
            free_block_count: self.free_lists.iter().map(|l| l.len() as u64).sum(),
            largest_free_block: self.largest_free_block(),
        }
    }
}

impl Compactable for BuddyAllocator {
    fn live_allocations(&self) -> Vec<Allocation> {
        self.allocated
            .iter()
            .map(|(&offset, &level)| {
                let size = self.block_size(level);
                Allocation {
                    offset,
                    size,
                    alignment: size.min(u64::from(u32::MAX)) as u32,
                    arena: self.arena,
                }
            })
            .collect()
    }

    fn placement_alignment(&self, allocation: &Allocation) -> u64 {
        allocation.size.max(self.min_block).next_power_of_two()
    }

    fn is_live(&self, allocation: &Allocation) -> bool {
        allocation.arena == self.arena
            && self
                .allocated
                .get(&allocation.offset)
                .is_some_and(|&level| self.block_size(level) == allocation.size)
    }

    fn claim_at(&mut self, offset: u64, size: u64) -> Result<Allocation, AllocError> {
        let unavailable = AllocError::RangeUnavailable { offset, size };
        let level = self.level_for(size).ok_or(unavailable.clone())?;
        let block = self.block_size(level);
        if offset % block != 0 || offset + block > self.max_block {
            return Err(unavailable);
        }

        // Find the free ancestor containing the target block.
        let found = (level..self.free_lists.len()).find_map(|l| {
            let ancestor = offset & !(self.block_size(l) - 1);
            self.free_lists[l].contains(&ancestor).then_some((l, ancestor))
        });
        let (mut current, mut ancestor) = found.ok_or(unavailable)?;
        self.free_lists[current].remove(&ancestor);

        // Split towards the target, freeing the half that does not contain it.
        while current > level {
            current -= 1;
            let half = self.block_size(current);
            let right = ancestor + half;
            if offset >= right {
                self.free_lists[current].insert(ancestor);
                ancestor = right;
            } else {
                self.free_lists[current].insert(right);
            }
        }
        debug_assert_eq!(ancestor, offset);

        Ok(self.commit(offset, level))
    }
}
