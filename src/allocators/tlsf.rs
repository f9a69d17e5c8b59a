//! Two-level segregated fit allocator.
//!
//! Free blocks are bucketed by `(first_level, second_level)`: the first level
//! is the power of two of the size, the second level splits that range into
//! 16 linear classes. A `u64` first-level bitmap and one `u32` second-level
//! bitmap per first level find the smallest suitable non-empty bucket with two
//! bit scans. Blocks live in a flat arena and link to their physical and
//! free-list neighbours by index.

use std::collections::BTreeMap;

use crate::allocators::{Allocation, ArenaId, Compactable, OffsetAllocator};
use crate::api::config::SuiteConfig;
use crate::api::error::{reject_free, AllocError, ConfigError};
use crate::api::stats::AllocatorStats;
use crate::util::layout::{align_down, align_up, checked_align_up, ffs, fls};

/// log2 of the number of second-level classes.
const SL_INDEX_COUNT_LOG2: u32 = 4;

/// Number of second-level classes per first level.
const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

/// Smallest granularity, regardless of the requested alignment.
const MIN_GRANULARITY: u64 = 16;

type BlockIndex = usize;

/// A physical block, free or allocated.
#[derive(Debug, Clone)]
struct Block {
    offset: u64,
    size: u64,
    free: bool,
    prev_phys: Option<BlockIndex>,
    next_phys: Option<BlockIndex>,
    prev_free: Option<BlockIndex>,
    next_free: Option<BlockIndex>,
}

/// TLSF allocator over a fixed arena.
#[derive(Debug)]
pub struct SegregatedFitAllocator {
    arena: ArenaId,
    capacity: u64,

    /// Size granularity and minimum split threshold
    granularity: u64,

    /// log2(granularity << SL_INDEX_COUNT_LOG2): sizes below map linearly into first level 0
    fl_index_shift: u32,

    fl_bitmap: u64,
    sl_bitmaps: Vec<u32>,
    free_heads: Vec<[Option<BlockIndex>; SL_INDEX_COUNT]>,

    blocks: Vec<Block>,
    vacant: Vec<BlockIndex>,

    /// Allocated block per offset
    allocated: BTreeMap<u64, BlockIndex>,

    used: u64,
    free_count: u64,
    strict_frees: bool,

    allocation_count: u64,
    deallocation_count: u64,
    failed_allocations: u64,
    peak_used: u64,
}

impl SegregatedFitAllocator {
    /// Create an allocator over `capacity` bytes. Every size rounds up to
    /// the granularity `max(alignment, 16)`; the capacity rounds down to it.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two or `capacity` is smaller
    /// than the granularity.
    pub fn new(arena: ArenaId, capacity: u64, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two(), "tlsf alignment must be a power of two");
        let granularity = alignment.max(MIN_GRANULARITY);
        assert!(capacity >= granularity, "tlsf capacity must hold at least one block");

        let capacity = align_down(capacity, granularity);
        let fl_index_shift = SL_INDEX_COUNT_LOG2 + granularity.trailing_zeros();
        let fl_count = if capacity >> fl_index_shift == 0 {
            1
        } else {
            (fls(capacity) + 2 - fl_index_shift) as usize
        };

        let mut tlsf = Self {
            arena,
            capacity,
            granularity,
            fl_index_shift,
            fl_bitmap: 0,
            sl_bitmaps: vec![0; fl_count],
            free_heads: vec![[None; SL_INDEX_COUNT]; fl_count],
            blocks: Vec::new(),
            vacant: Vec::new(),
            allocated: BTreeMap::new(),
            used: 0,
            free_count: 0,
            strict_frees: cfg!(debug_assertions),
            allocation_count: 0,
            deallocation_count: 0,
            failed_allocations: 0,
            peak_used: 0,
        };

        let root = tlsf.new_block(Block {
            offset: 0,
            size: capacity,
            free: false,
            prev_phys: None,
            next_phys: None,
            prev_free: None,
            next_free: None,
        });
        tlsf.insert_free(root);
        tlsf
    }

    /// Create the allocator described by `config`.
    pub fn from_config(arena: ArenaId, config: &SuiteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = align_up(config.tlsf_capacity_bytes, config.heap_alignment);
        Ok(Self::new(arena, capacity, config.sub_allocation_alignment)
            .with_strict_frees(config.strict_frees))
    }

    /// Builder pattern: panic on invalid frees instead of logging them.
    pub fn with_strict_frees(mut self, strict: bool) -> Self {
        self.strict_frees = strict;
        self
    }

    /// Size granularity, also the minimum split threshold.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Number of free blocks.
    pub fn free_block_count(&self) -> u64 {
        self.free_count
    }

    /// Bucket a free block of `size` bytes is filed under.
    fn mapping_insert(&self, size: u64) -> (usize, usize) {
        if size >> self.fl_index_shift == 0 {
            // Small sizes: first level 0, one granularity step per class.
            (0, (size / self.granularity) as usize)
        } else {
            let fl = fls(size);
            let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) as usize ^ SL_INDEX_COUNT;
            ((fl + 1 - self.fl_index_shift) as usize, sl)
        }
    }

    /// Bucket to start searching from for a request of `size` bytes: rounds
    /// up to the next class boundary so that every block found is large enough.
    fn mapping_search(&self, size: u64) -> Option<(usize, usize)> {
        let size = if size >> self.fl_index_shift == 0 {
            size
        } else {
            let round = (1u64 << (fls(size) - SL_INDEX_COUNT_LOG2)) - 1;
            size.checked_add(round)?
        };
        Some(self.mapping_insert(size))
    }

    /// Smallest non-empty bucket at or above `(fl, sl)`.
    fn find_suitable(&self, fl: usize, sl: usize) -> Option<(usize, usize)> {
        if fl >= self.sl_bitmaps.len() {
            return None;
        }

        let sl_map = self.sl_bitmaps[fl] & (!0u32 << sl);
        if sl_map != 0 {
            return Some((fl, ffs(u64::from(sl_map)) as usize));
        }

        let fl_map = self.fl_bitmap & (!0u64).checked_shl(fl as u32 + 1).unwrap_or(0);
        if fl_map == 0 {
            return None;
        }
        let fl = ffs(fl_map) as usize;
        Some((fl, ffs(u64::from(self.sl_bitmaps[fl])) as usize))
    }

    /// First block of at least `size` bytes in the class `size` itself maps
    /// to. Only consulted when the rounded-up search comes back empty.
    fn first_fit_in_class(&self, size: u64) -> Option<BlockIndex> {
        let (fl, sl) = self.mapping_insert(size);
        let mut cursor = self.free_heads.get(fl)?[sl];
        while let Some(index) = cursor {
            if self.blocks[index].size >= size {
                return Some(index);
            }
            cursor = self.blocks[index].next_free;
        }
        None
    }

    fn new_block(&mut self, block: Block) -> BlockIndex {
        match self.vacant.pop() {
            Some(index) => {
                self.blocks[index] = block;
                index
            }
            None => {
                self.blocks.push(block);
                self.blocks.len() - 1
            }
        }
    }

    fn insert_free(&mut self, index: BlockIndex) {
        let (fl, sl) = self.mapping_insert(self.blocks[index].size);
        let head = self.free_heads[fl][sl];

        let block = &mut self.blocks[index];
        block.free = true;
        block.prev_free = None;
        block.next_free = head;
        if let Some(head) = head {
            self.blocks[head].prev_free = Some(index);
        }

        self.free_heads[fl][sl] = Some(index);
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmaps[fl] |= 1 << sl;
        self.free_count += 1;
    }

    fn remove_free(&mut self, index: BlockIndex) {
        let (fl, sl) = self.mapping_insert(self.blocks[index].size);
        let (prev, next) = {
            let block = &mut self.blocks[index];
            block.free = false;
            (block.prev_free.take(), block.next_free.take())
        };

        if let Some(next) = next {
            self.blocks[next].prev_free = prev;
        }
        match prev {
            Some(prev) => self.blocks[prev].next_free = next,
            None => {
                self.free_heads[fl][sl] = next;
                if next.is_none() {
                    self.sl_bitmaps[fl] &= !(1 << sl);
                    if self.sl_bitmaps[fl] == 0 {
                        self.fl_bitmap &= !(1 << fl);
                    }
                }
            }
        }
        self.free_count -= 1;
    }

    /// Cut `index` down to `size` bytes, filing the remainder as a new free block.
    fn split(&mut self, index: BlockIndex, size: u64) {
        let (offset, total, next) = {
            let block = &self.blocks[index];
            (block.offset, block.size, block.next_phys)
        };
        if total - size < self.granularity {
            return;
        }

        let rest = self.new_block(Block {
            offset: offset + size,
            size: total - size,
            free: false,
            prev_phys: Some(index),
            next_phys: next,
            prev_free: None,
            next_free: None,
        });
        if let Some(next) = next {
            self.blocks[next].prev_phys = Some(rest);
        }
        self.blocks[index].size = size;
        self.blocks[index].next_phys = Some(rest);
        self.insert_free(rest);
    }

    /// Fold the physical successor `next` into `index` and recycle its slot.
    fn absorb_next(&mut self, index: BlockIndex, next: BlockIndex) {
        let (size, after) = (self.blocks[next].size, self.blocks[next].next_phys);
        self.blocks[index].size += size;
        self.blocks[index].next_phys = after;
        if let Some(after) = after {
            self.blocks[after].prev_phys = Some(index);
        }
        self.vacant.push(next);
    }

    fn commit(&mut self, index: BlockIndex) -> Allocation {
        let (offset, size) = (self.blocks[index].offset, self.blocks[index].size);
        self.allocated.insert(offset, index);
        self.used += size;
        self.allocation_count += 1;
        self.peak_used = self.peak_used.max(self.used);

        log::trace!("tlsf {:?} allocate {} bytes -> offset {}", self.arena, size, offset);

        Allocation {
            offset,
            size,
            alignment: self.granularity.min(u64::from(u32::MAX)) as u32,
            arena: self.arena,
        }
    }

    /// Reserve at least `size` bytes in O(1).
    pub fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        let adjusted = match checked_align_up(size, self.granularity) {
            Some(adjusted) if size > 0 => adjusted,
            _ => {
                self.failed_allocations += 1;
                return Err(AllocError::InvalidSize { size });
            }
        };
        if adjusted > self.capacity {
            self.failed_allocations += 1;
            return Err(AllocError::TooLarge { requested: size, max: self.capacity });
        }

        let index = self
            .mapping_search(adjusted)
            .and_then(|(fl, sl)| self.find_suitable(fl, sl))
            .and_then(|(fl, sl)| self.free_heads[fl][sl])
            .or_else(|| self.first_fit_in_class(adjusted));
        let Some(index) = index else {
            self.failed_allocations += 1;
            log::debug!(
                "tlsf {:?} out of memory: {} bytes requested, {} free in {} blocks",
                self.arena,
                size,
                self.capacity - self.used,
                self.free_count
            );
            return Err(AllocError::OutOfMemory { requested: size });
        };

        self.remove_free(index);
        debug_assert!(self.blocks[index].size >= adjusted);
        self.split(index, adjusted);
        Ok(self.commit(index))
    }

    /// Free the allocation starting at `offset`, merging with free physical neighbours.
    pub fn free(&mut self, offset: u64) -> Result<(), AllocError> {
        let Some(mut index) = self.allocated.remove(&offset) else {
            return Err(reject_free(
                self.strict_frees,
                AllocError::InvalidFree { offset, reason: "no tlsf block is allocated there" },
            ));
        };

        self.used -= self.blocks[index].size;
        self.deallocation_count += 1;

        if let Some(prev) = self.blocks[index].prev_phys.filter(|&p| self.blocks[p].free) {
            self.remove_free(prev);
            self.absorb_next(prev, index);
            index = prev;
        }
        if let Some(next) = self.blocks[index].next_phys.filter(|&n| self.blocks[n].free) {
            self.remove_free(next);
            self.absorb_next(index, next);
        }

        self.insert_free(index);
        Ok(())
    }

    /// Block containing `offset`, walking the physical chain from the start.
    fn block_containing(&self, offset: u64) -> Option<BlockIndex> {
        // Block 0 always starts at offset 0: merges keep the lower block.
        let mut cursor = Some(0);
        while let Some(index) = cursor {
            let block = &self.blocks[index];
            if offset < block.offset + block.size {
                return (offset >= block.offset).then_some(index);
            }
            cursor = block.next_phys;
        }
        None
    }

    fn largest_free_block(&self) -> u64 {
        if self.fl_bitmap == 0 {
            return 0;
        }
        let fl = fls(self.fl_bitmap) as usize;
        let sl = fls(u64::from(self.sl_bitmaps[fl])) as usize;

        let mut largest = 0;
        let mut cursor = self.free_heads[fl][sl];
        while let Some(index) = cursor {
            largest = largest.max(self.blocks[index].size);
            cursor = self.blocks[index].next_free;
        }
        largest
    }
}

impl OffsetAllocator for SegregatedFitAllocator {
    fn arena(&self) -> ArenaId {
        self.arena
    }

    fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        SegregatedFitAllocator::allocate(self, size)
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
        SegregatedFitAllocator::free(self, allocation.offset)
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn used(&self) -> u64 {
        self.used
    }

    fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            capacity: self.capacity,
            used: self.used,
            peak_used: self.peak_used,
            allocation_count: self.allocation_count,
            deallocation_count: self.deallocation_count,
            failed_allocations: self.failed_allocations,
            free_block_count: self.free_count,
            largest_free_block: self.largest_free_block(),
        }
    }
}

impl Compactable for SegregatedFitAllocator {
    fn live_allocations(&self) -> Vec<Allocation> {
        self.allocated
            .iter()
            .map(|(&offset, &index)| Allocation {
                offset,
                size: self.blocks[index].size,
                alignment: self.granularity.min(u64::from(u32::MAX)) as u32,
                arena: self.arena,
            })
            .collect()
    }

    fn placement_alignment(&self, _allocation: &Allocation) -> u64 {
        self.granularity
    }

    fn is_live(&self, allocation: &Allocation) -> bool {
        allocation.arena == self.arena
            && self
                .allocated
                .get(&allocation.offset)
                .is_some_and(|&index| self.blocks[index].size == allocation.size)
    }

    fn claim_at(&mut self, offset: u64, size: u64) -> Result<Allocation, AllocError> {
        let unavailable = AllocError::RangeUnavailable { offset, size };
        let adjusted = match checked_align_up(size, self.granularity) {
            Some(adjusted) if size > 0 && offset % self.granularity == 0 => adjusted,
            _ => return Err(unavailable),
        };

        let index = self.block_containing(offset).ok_or(unavailable.clone())?;
        let (block_offset, block_size, free) = {
            let block = &self.blocks[index];
            (block.offset, block.size, block.free)
        };
        if !free || offset + adjusted > block_offset + block_size {
            return Err(unavailable);
        }

        self.remove_free(index);

        // Keep the leading gap as its own free block.
        let target = if offset > block_offset {
            self.split(index, offset - block_offset);
            let rest = self.blocks[index].next_phys.ok_or(unavailable)?;
            self.remove_free(rest);
            self.insert_free(index);
            rest
        } else {
            index
        };

        self.split(target, adjusted);
        Ok(self.commit(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlsf(capacity: u64) -> SegregatedFitAllocator {
        SegregatedFitAllocator::new(ArenaId(3), capacity, 256).with_strict_frees(false)
    }

    #[test]
    fn test_mapping_matches_reference_rounding() {
        let tlsf = tlsf(1 << 20);
        // Small sizes map linearly below 16 * 256 bytes.
        assert_eq!(tlsf.mapping_insert(256), (0, 1));
        assert_eq!(tlsf.mapping_insert(3840), (0, 15));
        assert_eq!(tlsf.mapping_insert(4096), (1, 0));
        assert_eq!(tlsf.mapping_insert(4352), (1, 1));

        // [8192, 8704) shares a class, so a search for 8448 must skip it.
        assert_eq!(tlsf.mapping_insert(8448), (2, 0));
        assert_eq!(tlsf.mapping_search(8448), Some((2, 1)));
        assert_eq!(tlsf.mapping_search(8704), Some((2, 1)));
    }

    #[test]
    fn test_request_in_top_class_of_odd_capacity() {
        // 1_280_000 is not a class boundary, so rounding the request up
        // overshoots every bucket the arena has.
        let mut tlsf = tlsf(1_280_000);
        let big = tlsf.allocate(1_254_400).unwrap();
        assert_eq!((big.offset, big.size), (0, 1_254_400));
        assert_eq!(tlsf.free_block_count(), 1);
        assert!(matches!(tlsf.allocate(25_856), Err(AllocError::OutOfMemory { .. })));
        assert_eq!(tlsf.allocate(25_600).unwrap().offset, 1_254_400);

        tlsf.free(big.offset).unwrap();
        assert_eq!(tlsf.allocate(1_254_400).unwrap().offset, 0);
    }

    #[test]
    fn test_fit_guarantee() {
        let mut tlsf = tlsf(1 << 22);
        let mut seed = 0xdead_beef_u64;
        let mut live = Vec::new();

        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let size = 1 + seed % 40_000;

            if seed % 4 == 0 && !live.is_empty() {
                let a: Allocation = live.swap_remove((seed as usize / 4) % live.len());
                tlsf.free(a.offset).unwrap();
            } else if let Ok(a) = tlsf.allocate(size) {
                assert!(a.size >= size);
                assert_eq!(a.offset % 256, 0);
                assert!(live.iter().all(|other: &Allocation| !a.overlaps(other)));
                live.push(a);
            }
        }
    }

    #[test]
    fn test_identical_sequences_use_identical_bytes() {
        let run = || {
            let mut tlsf = tlsf(1 << 20);
            let mut live = Vec::new();
            for i in 0..500u64 {
                if i % 5 == 4 {
                    let a: Allocation = live.remove(0);
                    tlsf.free(a.offset).unwrap();
                } else if let Ok(a) = tlsf.allocate(100 + (i * 7919) % 9000) {
                    live.push(a);
                }
            }
            tlsf.used()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_free_merges_both_neighbours() {
        let mut tlsf = tlsf(4096);
        let a = tlsf.allocate(1024).unwrap();
        let b = tlsf.allocate(1024).unwrap();
        let c = tlsf.allocate(1024).unwrap();
        assert_eq!((a.offset, b.offset, c.offset), (0, 1024, 2048));
        assert_eq!(tlsf.free_block_count(), 1);

        tlsf.free(a.offset).unwrap();
        tlsf.free(c.offset).unwrap();
        assert_eq!(tlsf.free_block_count(), 2);

        // Freeing the middle block joins all three with the tail.
        tlsf.free(b.offset).unwrap();
        assert_eq!(tlsf.free_block_count(), 1);
        assert_eq!(tlsf.stats().largest_free_block, 4096);
        assert_eq!(tlsf.allocate(4096).unwrap().offset, 0);
    }

    #[test]
    fn test_out_of_memory_and_invalid_free() {
        let mut tlsf = tlsf(4096);
        assert!(matches!(tlsf.allocate(8192), Err(AllocError::TooLarge { .. })));
        assert!(matches!(tlsf.allocate(0), Err(AllocError::InvalidSize { .. })));

        let whole = tlsf.allocate(4000).unwrap();
        assert_eq!(whole.size, 4096);
        assert_eq!(tlsf.allocate(1), Err(AllocError::OutOfMemory { requested: 1 }));

        assert!(matches!(tlsf.free(512), Err(AllocError::InvalidFree { .. })));
        tlsf.free(whole.offset).unwrap();
        assert!(matches!(tlsf.free(whole.offset), Err(AllocError::InvalidFree { .. })));
        assert_eq!(tlsf.used(), 0);
    }

    #[test]
    fn test_claim_at_splits_around_target() {
        let mut tlsf = tlsf(8192);
        let claimed = tlsf.claim_at(2048, 1000).unwrap();
        assert_eq!((claimed.offset, claimed.size), (2048, 1024));
        assert_eq!(tlsf.free_block_count(), 2);

        assert!(matches!(tlsf.claim_at(2560, 256), Err(AllocError::RangeUnavailable { .. })));
        assert!(matches!(tlsf.claim_at(1792, 512), Err(AllocError::RangeUnavailable { .. })));

        let low = tlsf.claim_at(0, 2048).unwrap();
        assert_eq!(low.offset, 0);

        tlsf.free(claimed.offset).unwrap();
        tlsf.free(low.offset).unwrap();
        assert_eq!(tlsf.free_block_count(), 1);
        assert_eq!(tlsf.stats().largest_free_block, 8192);
    }

    #[test]
    fn test_live_allocations_sorted() {
        let mut tlsf = tlsf(8192);
        let a = tlsf.allocate(512).unwrap();
        let b = tlsf.allocate(512).unwrap();
        tlsf.free(a.offset).unwrap();
        let c = tlsf.allocate(256).unwrap();

        let live = tlsf.live_allocations();
        let offsets: Vec<u64> = live.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![c.offset, b.offset]);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_is_live_rejects_reused_range() {
        let mut tlsf = tlsf(8192);
        let a = tlsf.allocate(1024).unwrap();
        assert!(tlsf.is_live(&a));

        tlsf.free(a.offset).unwrap();
        let b = tlsf.allocate(512).unwrap();
        assert_eq!(b.offset, a.offset);
        assert!(!tlsf.is_live(&a));
        assert!(tlsf.is_live(&b));
        assert!(!tlsf.is_live(&Allocation { arena: ArenaId(9), ..b }));
    }
}
