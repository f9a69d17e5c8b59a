//! Suite configuration.

use std::time::Duration;

use crate::api::error::ConfigError;
use crate::util::size::{kb, mb};

/// Configuration for the allocator suite.
///
/// Every allocator has a `from_config` constructor reading its section.
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    /// Size of the per-frame upload ring (default: 16 MB)
    pub ring_capacity_bytes: u64,

    /// Block size of the fixed-block pool (default: 64 KB)
    pub pool_block_size: u64,

    /// Number of blocks in the pool (default: 256)
    pub pool_block_count: u32,

    /// Smallest buddy block (default: 256 B)
    pub buddy_min_block: u64,

    /// Largest buddy block, also the buddy arena size (default: 64 MB)
    pub buddy_max_block: u64,

    /// Size of the segregated-fit arena (default: 64 MB)
    pub tlsf_capacity_bytes: u64,

    /// Frames the CPU may record ahead of the execution engine (default: 3)
    pub frames_in_flight: usize,

    /// Wall-clock budget of one defragmenter update (default: 500 µs)
    pub defrag_time_budget_us: u64,

    /// Fragmentation ratio above which the defragmenter starts a pass on its own (default: 0.25)
    pub defrag_fragmentation_threshold: f32,

    /// Usage/budget ratio above which the pressure callback fires (default: 1.0)
    pub budget_pressure_threshold: f32,

    /// Number of budget samples kept for the trend (default: 60)
    pub budget_history_len: usize,

    /// Sanity timeout for completion waits before declaring an engine hang (default: 5 s)
    pub engine_wait_timeout_ms: u64,

    /// Platform heap alignment; arena capacities round up to it (default: 64 KB)
    pub heap_alignment: u64,

    /// Platform sub-allocation alignment; every request rounds up to it (default: 256 B)
    pub sub_allocation_alignment: u64,

    /// Panic on invalid frees instead of logging them (default: on in debug builds)
    pub strict_frees: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            ring_capacity_bytes: mb(16),
            pool_block_size: kb(64),
            pool_block_count: 256,
            buddy_min_block: 256,
            buddy_max_block: mb(64),
            tlsf_capacity_bytes: mb(64),
            frames_in_flight: 3,
            defrag_time_budget_us: 500,
            defrag_fragmentation_threshold: 0.25,
            budget_pressure_threshold: 1.0,
            budget_history_len: 60,
            engine_wait_timeout_ms: 5_000,
            heap_alignment: kb(64),
            sub_allocation_alignment: 256,
            strict_frees: cfg!(debug_assertions),
        }
    }
}

impl SuiteConfig {
    /// Create a minimal config for testing or constrained environments.
    pub fn minimal() -> Self {
        Self {
            ring_capacity_bytes: mb(1),
            pool_block_size: kb(4),
            pool_block_count: 64,
            buddy_min_block: 256,
            buddy_max_block: mb(1),
            tlsf_capacity_bytes: mb(1),
            frames_in_flight: 2,
            budget_history_len: 16,
            ..Self::default()
        }
    }

    /// Create a config optimized for streaming-heavy scenarios.
    pub fn high_performance() -> Self {
        Self {
            ring_capacity_bytes: mb(64),
            pool_block_size: kb(64),
            pool_block_count: 1024,
            buddy_min_block: kb(4),
            buddy_max_block: mb(256),
            tlsf_capacity_bytes: mb(256),
            frames_in_flight: 3,
            defrag_time_budget_us: 250,
            ..Self::default()
        }
    }

    /// Builder pattern: set ring capacity.
    pub fn with_ring_capacity(mut self, bytes: u64) -> Self {
        self.ring_capacity_bytes = bytes;
        self
    }

    /// Builder pattern: set pool geometry.
    pub fn with_pool(mut self, block_size: u64, block_count: u32) -> Self {
        self.pool_block_size = block_size;
        self.pool_block_count = block_count;
        self
    }

    /// Builder pattern: set buddy block bounds.
    pub fn with_buddy_blocks(mut self, min_block: u64, max_block: u64) -> Self {
        self.buddy_min_block = min_block;
        self.buddy_max_block = max_block;
        self
    }

    /// Builder pattern: set segregated-fit arena size.
    pub fn with_tlsf_capacity(mut self, bytes: u64) -> Self {
        self.tlsf_capacity_bytes = bytes;
        self
    }

    /// Builder pattern: set frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Builder pattern: set the defragmenter time budget in microseconds.
    pub fn with_defrag_time_budget_us(mut self, micros: u64) -> Self {
        self.defrag_time_budget_us = micros;
        self
    }

    /// Builder pattern: set the pressure threshold ratio.
    pub fn with_pressure_threshold(mut self, ratio: f32) -> Self {
        self.budget_pressure_threshold = ratio;
        self
    }

    /// Builder pattern: set the engine-hang timeout in milliseconds.
    pub fn with_engine_wait_timeout_ms(mut self, millis: u64) -> Self {
        self.engine_wait_timeout_ms = millis;
        self
    }

    /// Builder pattern: set platform alignments.
    pub fn with_alignment(mut self, heap: u64, sub_allocation: u64) -> Self {
        self.heap_alignment = heap;
        self.sub_allocation_alignment = sub_allocation;
        self
    }

    /// Builder pattern: enable strict invalid-free handling.
    pub fn with_strict_frees(mut self, strict: bool) -> Self {
        self.strict_frees = strict;
        self
    }

    /// Defragmenter budget as a duration.
    pub fn defrag_time_budget(&self) -> Duration {
        Duration::from_micros(self.defrag_time_budget_us)
    }

    /// Engine-hang timeout as a duration.
    pub fn engine_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_wait_timeout_ms)
    }

    /// Check every option for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.heap_alignment.is_power_of_two() {
            return Err(ConfigError::new("heap_alignment", "must be a power of two"));
        }
        if !self.sub_allocation_alignment.is_power_of_two() {
            return Err(ConfigError::new("sub_allocation_alignment", "must be a power of two"));
        }
        if self.sub_allocation_alignment > u64::from(u32::MAX) {
            return Err(ConfigError::new("sub_allocation_alignment", "must fit in 32 bits"));
        }
        if self.sub_allocation_alignment > self.heap_alignment {
            return Err(ConfigError::new("sub_allocation_alignment", "must not exceed heap_alignment"));
        }
        if self.ring_capacity_bytes == 0 {
            return Err(ConfigError::new("ring_capacity_bytes", "must be non-zero"));
        }
        if self.pool_block_size == 0 || self.pool_block_count == 0 {
            return Err(ConfigError::new("pool_block_size", "pool geometry must be non-zero"));
        }
        if !self.buddy_min_block.is_power_of_two() || !self.buddy_max_block.is_power_of_two() {
            return Err(ConfigError::new("buddy_min_block", "buddy bounds must be powers of two"));
        }
        if self.buddy_min_block > self.buddy_max_block {
            return Err(ConfigError::new("buddy_max_block", "must be at least buddy_min_block"));
        }
        if self.tlsf_capacity_bytes < self.sub_allocation_alignment {
            return Err(ConfigError::new("tlsf_capacity_bytes", "must hold at least one aligned block"));
        }
        if self.frames_in_flight == 0 {
            return Err(ConfigError::new("frames_in_flight", "must be at least 1"));
        }
        if self.defrag_time_budget_us == 0 {
            return Err(ConfigError::new("defrag_time_budget_us", "must be non-zero"));
        }
        if !(self.budget_pressure_threshold > 0.0) {
            return Err(ConfigError::new("budget_pressure_threshold", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.defrag_fragmentation_threshold) {
            return Err(ConfigError::new("defrag_fragmentation_threshold", "must be within 0..=1"));
        }
        if self.budget_history_len == 0 {
            return Err(ConfigError::new("budget_history_len", "must be at least 1"));
        }
        Ok(())
    }
}
