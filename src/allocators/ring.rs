//! Ring allocator - bump allocation with fence-gated wraparound.
//!
//! This is the hot path for per-frame transient data (upload buffers,
//! per-draw constants). Nothing is freed individually: every frame pushes a
//! marker carrying its completion value, and once the execution engine has
//! reached that value everything the frame allocated is reclaimed at once.

use std::collections::VecDeque;

use crate::allocators::{Allocation, ArenaId, OffsetAllocator};
use crate::api::config::SuiteConfig;
use crate::api::error::{reject_free, AllocError, ConfigError};
use crate::api::stats::AllocatorStats;
use crate::util::layout::{align_down, align_up, checked_align_up};

/// End-of-frame boundary waiting for its completion value.
#[derive(Debug, Clone, Copy)]
struct FrameMarker {
    /// Completion value the engine signals once the frame is done
    completion_value: u64,
    /// Head offset when the frame ended; becomes the tail on reclaim
    head: u64,
    /// Bytes the frame consumed, wrap padding included
    bytes: u64,
    /// Allocations made during the frame
    allocations: u64,
}

/// A bump allocator over a fixed-size ring.
///
/// Allocations are a bounds check and an add. Space comes back only when a
/// frame's completion value is observed through [`reset_tail`](Self::reset_tail).
#[derive(Debug)]
pub struct RingAllocator {
    arena: ArenaId,

    /// Total capacity in bytes (a multiple of `alignment`)
    capacity: u64,

    /// Sub-allocation alignment
    alignment: u64,

    /// Next write offset
    head: u64,

    /// Start of the oldest still-reserved range
    tail: u64,

    /// Bytes between tail and head, wrap padding included
    used: u64,

    /// Bytes consumed by the frame currently being recorded
    frame_bytes: u64,

    /// Allocations made by the frame currently being recorded
    frame_allocations: u64,

    /// Unreclaimed frames, oldest first
    markers: VecDeque<FrameMarker>,

    /// Last completion value observed from the engine
    last_completed: u64,

    strict_frees: bool,

    allocation_count: u64,
    reclaimed_count: u64,
    failed_allocations: u64,
    peak_used: u64,
}

impl RingAllocator {
    /// Create a ring of `capacity` bytes handing out `alignment`-aligned ranges.
    ///
    /// The capacity is rounded down to the alignment.
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
            head: 0,
            tail: 0,
            used: 0,
            frame_bytes: 0,
            frame_allocations: 0,
            markers: VecDeque::new(),
            last_completed: 0,
            strict_frees: cfg!(debug_assertions),
            allocation_count: 0,
            reclaimed_count: 0,
            failed_allocations: 0,
            peak_used: 0,
        }
    }

    /// Create the ring described by `config`, rounding its capacity up to the heap alignment.
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

    /// Reserve `size` bytes for the current frame.
    ///
    /// Fails with [`AllocError::Exhausted`] when neither the end of the ring
    /// nor, after wrapping, the space before the oldest in-flight frame can
    /// hold the request. That means the ring is undersized for the workload;
    /// the caller should not retry.
    pub fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        if size == 0 {
            self.failed_allocations += 1;
            return Err(AllocError::InvalidSize { size });
        }

        self.reclaim();

        let aligned = match checked_align_up(size, self.alignment) {
            Some(aligned) => aligned,
            None => {
                self.failed_allocations += 1;
                return Err(AllocError::InvalidSize { size });
            }
        };

        let (offset, padding) = match self.place(aligned) {
            Some(placement) => placement,
            None => {
                self.failed_allocations += 1;
                log::warn!(
                    "ring {:?} exhausted: {} bytes requested, head {} tail {} used {}/{}",
                    self.arena,
                    size,
                    self.head,
                    self.tail,
                    self.used,
                    self.capacity
                );
                return Err(AllocError::Exhausted {
                    requested: size,
                    available: self.available(),
                });
            }
        };

        if padding > 0 {
            log::debug!("ring {:?} wrapped, skipping {} trailing bytes", self.arena, padding);
        }

        self.head = offset + aligned;
        self.used += padding + aligned;
        self.frame_bytes += padding + aligned;
        self.frame_allocations += 1;
        self.allocation_count += 1;
        self.peak_used = self.peak_used.max(self.used);

        log::trace!("ring {:?} allocate {} -> offset {}", self.arena, size, offset);

        Ok(Allocation {
            offset,
            size: aligned,
            alignment: self.alignment as u32,
            arena: self.arena,
        })
    }

    /// Find where `aligned` bytes fit, returning the offset and the wrap padding.
    fn place(&self, aligned: u64) -> Option<(u64, u64)> {
        if aligned > self.capacity - self.used {
            return None;
        }

        if self.head >= self.tail {
            // Live range is [tail, head): free space at the end, then before tail.
            if self.head + aligned <= self.capacity {
                Some((self.head, 0))
            } else if aligned <= self.tail {
                Some((0, self.capacity - self.head))
            } else {
                None
            }
        } else if self.head + aligned <= self.tail {
            // Live range wraps: the only gap is [head, tail).
            Some((self.head, 0))
        } else {
            None
        }
    }

    /// Close the current frame. Its ranges are reclaimed once
    /// `completion_value` is observed. Returns the head offset recorded.
    pub fn mark_frame_end(&mut self, completion_value: u64) -> u64 {
        debug_assert!(
            self.markers.back().map_or(true, |m| m.completion_value < completion_value),
            "frame completion values must increase"
        );

        self.markers.push_back(FrameMarker {
            completion_value,
            head: self.head,
            bytes: self.frame_bytes,
            allocations: self.frame_allocations,
        });
        self.frame_bytes = 0;
        self.frame_allocations = 0;
        self.head
    }

    /// Observe a completion value and reclaim every frame it covers.
    ///
    /// Lower values than one already observed are ignored.
    pub fn reset_tail(&mut self, completed_value: u64) {
        self.last_completed = self.last_completed.max(completed_value);
        self.reclaim();
    }

    /// Move the head back to offset 0 when the end of the ring is fully
    /// consumed and the oldest frame leaves room at the start.
    pub fn wrap_if_needed(&mut self) -> bool {
        if self.head == self.capacity && self.tail > 0 {
            self.head = 0;
            log::debug!("ring {:?} wrapped at end of buffer", self.arena);
            true
        } else {
            false
        }
    }

    /// Pop every marker whose completion value has been reached.
    fn reclaim(&mut self) {
        while let Some(marker) = self.markers.front().copied() {
            if marker.completion_value > self.last_completed {
                break;
            }
            self.markers.pop_front();
            self.tail = marker.head;
            self.used -= marker.bytes;
            self.reclaimed_count += marker.allocations;
        }

        if self.used == 0 && (self.head != 0 || self.tail != 0) {
            // Nothing live: restart at 0 for the largest contiguous run.
            // Pending markers are all empty frames, so their heads move too.
            self.head = 0;
            self.tail = 0;
            for marker in &mut self.markers {
                marker.head = 0;
            }
        }
    }

    /// Next write offset.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Start of the oldest still-reserved range.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// Sub-allocation alignment.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Frames closed but not yet reclaimed.
    pub fn pending_frames(&self) -> usize {
        self.markers.len()
    }

    /// Last completion value observed.
    pub fn last_completed_value(&self) -> u64 {
        self.last_completed
    }

    /// Free contiguous ranges, as `(offset, size)`.
    fn free_ranges(&self) -> [(u64, u64); 2] {
        if self.used == 0 {
            [(0, self.capacity), (0, 0)]
        } else if self.used == self.capacity {
            [(0, 0), (0, 0)]
        } else if self.head >= self.tail {
            [(self.head, self.capacity - self.head), (0, self.tail)]
        } else {
            [(self.head, self.tail - self.head), (0, 0)]
        }
    }
}

impl OffsetAllocator for RingAllocator {
    fn arena(&self) -> ArenaId {
        self.arena
    }

    fn allocate(&mut self, size: u64) -> Result<Allocation, AllocError> {
        RingAllocator::allocate(self, size)
    }

    /// Ring ranges are reclaimed by frame completion; this only validates.
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
        if allocation.end() > self.capacity {
            return Err(reject_free(
                self.strict_frees,
                AllocError::InvalidFree {
                    offset: allocation.offset,
                    reason: "range lies outside the ring",
                },
            ));
        }
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn used(&self) -> u64 {
        self.used
    }

    fn stats(&self) -> AllocatorStats {
        let ranges = self.free_ranges();
        AllocatorStats {
            capacity: self.capacity,
            used: self.used,
            peak_used: self.peak_used,
            allocation_count: self.allocation_count,
            deallocation_count: self.reclaimed_count,
            failed_allocations: self.failed_allocations,
            free_block_count: ranges.iter().filter(|(_, size)| *size > 0).count() as u64,
            largest_free_block: ranges.iter().map(|(_, size)| *size).max().unwrap_or(0),
        }
    }
}
