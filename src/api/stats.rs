//! Allocation statistics.

use crate::util::size::format_bytes;

/// Point-in-time statistics of a single allocator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocatorStats {
    /// Total bytes managed by the allocator.
    pub capacity: u64,

    /// Bytes currently reserved, including rounding and ring wrap padding.
    pub used: u64,

    /// Peak reserved bytes (high water mark).
    pub peak_used: u64,

    /// Total number of successful allocations.
    pub allocation_count: u64,

    /// Total number of frees (explicit, or reclaimed en masse for the ring).
    pub deallocation_count: u64,

    /// Number of requests that failed.
    pub failed_allocations: u64,

    /// Number of distinct free ranges.
    pub free_block_count: u64,

    /// Size of the largest free range.
    pub largest_free_block: u64,
}

impl AllocatorStats {
    /// Bytes not currently reserved.
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Used bytes as a fraction of capacity.
    pub fn utilization(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.used as f32 / self.capacity as f32
    }

    /// External fragmentation: `1 - largest_free / total_free`.
    pub fn fragmentation(&self) -> f32 {
        fragmentation(self.available(), self.largest_free_block)
    }
}

/// External fragmentation of a free space of `total_free` bytes whose
/// largest contiguous range is `largest_free` bytes.
pub(crate) fn fragmentation(total_free: u64, largest_free: u64) -> f32 {
    if total_free == 0 {
        return 0.0;
    }
    1.0 - largest_free as f32 / total_free as f32
}

impl std::fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Allocator Statistics:")?;
        writeln!(f, "  Capacity:      {}", format_bytes(self.capacity))?;
        writeln!(f, "  Used:          {}", format_bytes(self.used))?;
        writeln!(f, "  Peak used:     {}", format_bytes(self.peak_used))?;
        writeln!(f, "  Allocations:   {}", self.allocation_count)?;
        writeln!(f, "  Frees:         {}", self.deallocation_count)?;
        writeln!(f, "  Failures:      {}", self.failed_allocations)?;
        writeln!(f, "  Free blocks:   {}", self.free_block_count)?;
        writeln!(f, "  Largest free:  {}", format_bytes(self.largest_free_block))?;
        Ok(())
    }
}
