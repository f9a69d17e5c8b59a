//! Error types returned by the allocators and the frame coordinator.

use std::time::Duration;

use thiserror::Error;

/// Failure of an allocation, free or reservation request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No free block can satisfy the request, even after coalescing.
    #[error("out of memory: no free block can hold {requested} bytes")]
    OutOfMemory { requested: u64 },

    /// The ring cannot wrap because the oldest in-flight frame still holds the space.
    #[error("ring exhausted: {requested} bytes requested, {available} bytes reclaimable space left")]
    Exhausted { requested: u64, available: u64 },

    /// Every block of the pool is allocated.
    #[error("pool exhausted: all {block_count} blocks are allocated")]
    PoolExhausted { block_count: u32 },

    /// Freeing an unknown or already free allocation.
    #[error("invalid free at offset {offset:#x}: {reason}")]
    InvalidFree { offset: u64, reason: &'static str },

    /// Zero-sized or otherwise unrepresentable request.
    #[error("invalid allocation size {size}")]
    InvalidSize { size: u64 },

    /// The request exceeds the largest block the allocator can ever hand out.
    #[error("request of {requested} bytes exceeds the largest block ({max} bytes)")]
    TooLarge { requested: u64, max: u64 },

    /// An exact-placement reservation hit a range that is not free.
    #[error("range {offset:#x}+{size} is not free")]
    RangeUnavailable { offset: u64, size: u64 },
}

impl AllocError {
    /// Whether the caller may evict or defragment and retry the request once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocError::OutOfMemory { .. } | AllocError::PoolExhausted { .. })
    }
}

/// Failure of a frame-lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The completion counter never reached the awaited value. Unrecoverable.
    #[error("execution engine hang: waited {waited:?} for completion value {awaited}, last completed {completed}")]
    EngineHang {
        awaited: u64,
        completed: u64,
        waited: Duration,
    },

    /// Completion values handed to `end_frame` must strictly increase.
    #[error("completion value {signaled} does not follow previous value {previous}")]
    NonMonotonicSignal { previous: u64, signaled: u64 },

    /// `end_frame` without a matching `begin_frame`.
    #[error("no frame is being recorded")]
    NotRecording,

    /// `begin_frame` while a frame is already being recorded.
    #[error("frame {frame_number} is already being recorded")]
    AlreadyRecording { frame_number: u64 },
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: `{field}` {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl ConfigError {
    pub(crate) const fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

/// Report an invalid free. Panics in strict mode, otherwise logs and hands
/// the error back so the caller can return it without touching any state.
#[track_caller]
pub(crate) fn reject_free(strict: bool, err: AllocError) -> AllocError {
    if strict {
        panic!("[fencealloc] {}", err);
    }
    log::warn!("ignoring {}", err);
    err
}
