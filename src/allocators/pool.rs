//! Fixed-block pool allocator for uniform long-lived allocations.
//!
//! All blocks share one size, so the free list is a plain index stack and
//! fragmentation cannot occur.

use crate::allocators::{Allocation, ArenaId, OffsetAllocator};
use crate::api::config::SuiteConfig;
use crate::api::error::{reject_free, AllocError, ConfigError};
use crate::api::stats::AllocatorStats;
use crate::util::layout::align_up;

/// A block handed out by [`PoolAllocator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAllocation {
    /// Index of the block within the pool
    pub index: u32,
    /// Byte offset of the block within the arena
    pub offset: u64,
}

/// Pool of `block_count` blocks of `block_size` bytes each.
#[derive(Debug)]
pub struct PoolAllocator {
    arena: ArenaId,

    /// Size of every block (a multiple of `alignment`)
    block_size: u64,

    /// Number of blocks
    block_count: u32,

    alignment: u64,

    /// Free block indices; popped from the back
    free_list: Vec<u32>,

    /// Allocation state per block, guards against double frees
    allocated: Vec<bool>,

    strict_frees: bool,

    allocation_count: u64,
    deallocation_count: u64,
    failed_allocations: u64,
    peak_allocated: u32,
}

impl PoolAllocator {
    /// Create a pool. The block size rounds up to `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two or the pool is empty.
    pub fn new(arena: ArenaId, block_size: u64, block_count: u32, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two(), "pool alignment must be a power of two");
        assert!(block_size > 0 && block_count > 0, "pool must hold at least one block");

        // Reverse order so that index 0 is handed out first.
        let free_list = (0..block_count).rev().collect();

        Self {
            arena,
            block_size: align_up(block_size, alignment),
            block_count,
            alignment,
            free_list,
            allocated: vec![false; block_count as usize],
            strict_frees: cfg!(debug_assertions),
            allocation_count: 0,
            deallocation_count: 0,
            failed_allocations: 0,
            peak_allocated: 0,
        }
    }

    /// Create the pool described by `config`.
    pub fn from_config(arena: ArenaId, config: &SuiteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            arena,
            config.pool_block_size,
            config.pool_block_count,
            config.sub_allocation_alignment,
        )
        .with_strict_frees(config.strict_frees))
    }

    /// Builder pattern: panic on invalid frees instead of logging them.
    pub fn with_strict_frees(mut self, strict: bool) -> Self {
        self.strict_frees = strict;
        self
    }

    /// Pop a free block.
    pub fn allocate(&mut self) -> Result<BlockAllocation, AllocError> {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.failed_allocations += 1;
                return Err(AllocError::PoolExhausted { block_count: self.block_count });
            }
        };

        self.allocated[index as usize] = true;
        self.allocation_count += 1;
        self.peak_allocated = self.peak_allocated.max(self.allocated_blocks());

        log::trace!("pool {:?} allocate block {}", self.arena, index);

        Ok(BlockAllocation {
            index,
            offset: self.offset_of(index),
        })
    }

    /// Return a block. Freeing an unknown or already free index is an
    /// [`AllocError::InvalidFree`] and leaves the free list untouched.
    pub fn free(&mut self, index: u32) -> Result<(), AllocError> {
        match self.allocated.get(index as usize) {
            Some(true) => {}
            Some(false) => {
                return Err(reject_free(
                    self.strict_frees,
                    AllocError::InvalidFree {
                        offset: self.offset_of(index),
                        reason: "pool block is already free",
                    },
                ));
            }
            None => {
                return Err(reject_free(
                    self.strict_frees,
                    AllocError::InvalidFree {
                        offset: u64::from(index).saturating_mul(self.block_size),
                        reason: "pool block index out of range",
                    },
                ));
            }
        }

        self.allocated[index as usize] = false;
        self.free_list.push(index);
        self.deallocation_count += 1;
        Ok(())
    }

    /// Whether block `index` is currently allocated.
    pub fn is_allocated(&self, index: u32) -> bool {
        self.allocated.get(index as usize).copied().unwrap_or(false)
    }

    /// Size of every block.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of blocks.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Number of free blocks.
    pub fn free_blocks(&self) -> u32 {
        self.free_list.len() as u32
    }

    /// Number of allocated blocks.
    pub fn allocated_blocks(&self) -> u32 {
        self.block_count - self.free_blocks()
    }

    fn offset_of(&self, index: u32) -> u64 {
        u64::from(index) * self.block_size
    }

    fn index_of(&self, offset: u64) -> Option<u32> {
        if offset % self.block_size != 0 {
            return None;
        }
        u32::try_from(offset / self.block_size)
            .ok()
            .filter(|&index| index < self.block_count)
    }
}

impl OffsetAllocator for PoolAllocator {
    fn arena(&self) -> ArenaId {
        self.arena
    }

    fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize { size });
        }
        if size > self.block_size {
            self.failed_allocations += 1;
            return Err(AllocError::TooLarge { requested: size, max: self.block_size });
        }

        let block = PoolAllocator::allocate(self)?;
        Ok(Allocation {
            offset: block.offset,
            size: self.block_size,
            alignment: self.alignment as u32,
            arena: self.arena,
        })
    }

    fn free(&mut self, allocation: &Allocation) -> Result<(), AllocError> {
        let index = match self.index_of(allocation.offset) {
            Some(index) if allocation.arena == self.arena => index,
            _ => {
                return Err(reject_free(
                    self.strict_frees,
                    AllocError::InvalidFree {
                        offset: allocation.offset,
                        reason: "offset is not a block of this pool",
                    },
                ));
            }
        };
        PoolAllocator::free(self, index)
    }

    fn capacity(&self) -> u64 {
        u64::from(self.block_count) * self.block_size
    }

    fn used(&self) -> u64 {
        u64::from(self.allocated_blocks()) * self.block_size
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            capacity: self.capacity(),
            used: self.used(),
            peak_used: u64::from(self.peak_allocated) * self.block_size,
            allocation_count: self.allocation_count,
            deallocation_count: self.deallocation_count,
            failed_allocations: self.failed_allocations,
            free_block_count: u64::from(self.free_blocks()),
            largest_free_block: if self.free_list.is_empty() { 0 } else { self.block_size },
        }
    }
}
