//! Thread-safe ring allocator for concurrent command recording.
//!
//! `head` and `tail` are monotonically increasing virtual positions; the
//! physical offset is the position modulo capacity. Producers claim space
//! with a compare-and-swap loop on `head` and never block each other.
//! Frame markers sit behind a mutex, touched only at frame boundaries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::allocators::{Allocation, ArenaId, OffsetAllocator};
use crate::api::config::SuiteConfig;
use crate::api::error::{reject_free, AllocError, ConfigError};
use crate::api::stats::AllocatorStats;
use crate::sync::atomics::{AtomicCounter, AtomicHighWater};
use crate::sync::mutex::Mutex;
use crate::util::layout::{align_down, align_up, checked_align_up};

/// Lock-free ring allocator shared by several recording threads.
#[derive(Debug)]
pub struct AtomicRingAllocator {
    arena: ArenaId,
    capacity: u64,
    alignment: u64,

    /// Virtual position of the next write
    head: AtomicU64,

    /// Virtual position of the oldest reserved byte
    tail: AtomicU64,

    /// `(completion_value, virtual head)` per closed frame, oldest first
    markers: Mutex<VecDeque<(u64, u64)>>,

    last_completed: AtomicU64,
    strict_frees: bool,

    allocation_count: AtomicCounter,
    failed_allocations: AtomicCounter,
    cas_retries: AtomicCounter,
    reclaimed_frames: AtomicCounter,
    peak_used: AtomicHighWater,
}

impl AtomicRingAllocator {
    /// Create a ring of `capacity` bytes handing out `alignment`-aligned ranges.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two, does not fit in a `u32`,
    /// or exceeds `capacity`.
    pub fn new(arena: ArenaId, capacity: u64, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two(), "ring alignment must be a power of two");
        assert!(u32::try_from(alignment).is_ok(), "ring alignment must fit in a u32");
        assert!(capacity >= alignment, "ring capacity must hold at least one aligned range");

        Self {
            arena,
            capacity: align_down(capacity, alignment),
            alignment,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            markers: Mutex::new(VecDeque::new()),
            last_completed: AtomicU64::new(0),
            strict_frees: cfg!(debug_assertions),
            allocation_count: AtomicCounter::default(),
            failed_allocations: AtomicCounter::default(),
            cas_retries: AtomicCounter::default(),
            reclaimed_frames: AtomicCounter::default(),
            peak_used: AtomicHighWater::default(),
        }
    }

    /// Create the ring described by `config`.
    pub fn from_config(arena: ArenaId, config: &SuiteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = align_up(config.ring_capacity_bytes, config.heap_alignment);
        Ok(Self::new(arena, capacity, config.sub_allocation_alignment)
            .with_strict_frees(config.strict_frees))
    }

    /// Builder pattern: panic on invalid frees instead of logging them.
    pub fn with_strict_frees(mut self, strict: bool) -> Self {
        self.strict_frees = strict;
        self
    }

    /// Reserve `size` bytes. Safe to call from any number of threads.
    pub fn allocate(&self, size: u64) -> Result<Allocation, AllocError> {
        let aligned = match checked_align_up(size, self.alignment) {
            Some(aligned) if size > 0 => aligned,
            _ => {
                self.failed_allocations.increment();
                return Err(AllocError::InvalidSize { size });
            }
        };

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let offset = head % self.capacity;

            // A range never straddles the end: skip to the next lap instead.
            let start = if offset + aligned > self.capacity {
                head + (self.capacity - offset)
            } else {
                head
            };
            let end = start + aligned;

            // An empty ring has nothing live in the skipped bytes.
            let floor = if head == tail { start } else { tail };
            if end - floor > self.capacity {
                self.failed_allocations.increment();
                return Err(AllocError::Exhausted {
                    requested: size,
                    available: self.capacity.saturating_sub(head - tail),
                });
            }

            match self
                .head
                .compare_exchange_weak(head, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if head == tail && start > head {
                        self.tail.fetch_max(start, Ordering::AcqRel);
                    }
                    self.allocation_count.increment();
                    self.peak_used.update_max(end - floor);
                    return Ok(Allocation {
                        offset: start % self.capacity,
                        size: aligned,
                        alignment: self.alignment as u32,
                        arena: self.arena,
                    });
                }
                Err(current) => {
                    self.cas_retries.increment();
                    head = current;
                }
            }
        }
    }

    /// Close the current frame.
    ///
    /// Every allocation that completed before this call belongs to the
    /// closed frame; callers close a frame once its recording threads are done.
    pub fn mark_frame_end(&self, completion_value: u64) -> u64 {
        let head = self.head.load(Ordering::Acquire);
        self.markers.lock().push_back((completion_value, head));
        head % self.capacity
    }

    /// Observe a completion value and reclaim every frame it covers.
    pub fn reset_tail(&self, completed_value: u64) {
        let completed = self
            .last_completed
            .fetch_max(completed_value, Ordering::AcqRel)
            .max(completed_value);

        let mut markers = self.markers.lock();
        while let Some(&(value, head)) = markers.front() {
            if value > completed {
                break;
            }
            markers.pop_front();
            self.tail.fetch_max(head, Ordering::AcqRel);
            self.reclaimed_frames.increment();
        }
    }

    /// Number of CAS attempts lost to another producer.
    pub fn contention_count(&self) -> u64 {
        self.cas_retries.get()
    }

    /// Frames closed but not yet reclaimed.
    pub fn pending_frames(&self) -> usize {
        self.markers.lock().len()
    }

    /// Bytes between tail and head.
    pub fn used_bytes(&self) -> u64 {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        head.saturating_sub(tail).min(self.capacity)
    }
}

impl OffsetAllocator for AtomicRingAllocator {
    fn arena(&self) -> ArenaId {
        self.arena
    }

    fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        AtomicRingAllocator::allocate(self, size)
    }

    fn free(&mut self, allocation: &Allocation) -> Result<(), AllocError> {
        if allocation.arena != self.arena || allocation.end() > self.capacity {
            return Err(reject_free(
                self.strict_frees,
                AllocError::InvalidFree {
                    offset: allocation.offset,
                    reason: "range does not belong to this ring",
                },
            ));
        }
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn used(&self) -> u64 {
        self.used_bytes()
    }

    fn stats(&self) -> AllocatorStats {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        let used = head.saturating_sub(tail).min(self.capacity);

        let (free_block_count, largest_free_block) = if used == self.capacity {
            (0, 0)
        } else if used == 0 {
            (1, self.capacity)
        } else {
            let head_offset = head % self.capacity;
            let tail_offset = tail % self.capacity;
            if head_offset > tail_offset {
                let end_gap = self.capacity - head_offset;
                (u64::from(tail_offset > 0) + 1, end_gap.max(tail_offset))
            } else {
                (1, tail_offset - head_offset)
            }
        };

        AllocatorStats {
            capacity: self.capacity,
            used,
            peak_used: self.peak_used.get(),
            allocation_count: self.allocation_count.get(),
            deallocation_count: self.reclaimed_frames.get(),
            failed_allocations: self.failed_allocations.get(),
            free_block_count,
            largest_free_block,
        }
    }
}
