//! # fencealloc
//!
//! Frame-synchronized GPU memory sub-allocation for real-time renderers.
//!
//! The suite manages offsets inside memory regions the caller creates; it
//! never talks to a graphics API. Reuse of a region is gated on completion
//! values reported by the execution engine, so nothing is overwritten while
//! the GPU may still read it.
//!
//! ## Features
//!
//! - Ring allocator for per-frame transient data, reclaimed by completion value
//! - Lock-free ring variant for multi-threaded command recording
//! - Fixed-block pool for uniform long-lived allocations
//! - Buddy and two-level segregated fit (TLSF) allocators for variable sizes
//! - Frame lifecycle manager with N frames in flight and deferred deletion
//! - Budget monitoring with pressure callbacks
//! - Priority-based eviction and load selection
//! - Incremental, time-budgeted defragmentation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fencealloc::{ArenaId, CompletionCounter, FrameLifecycleManager, RingAllocator, SuiteConfig};
//!
//! let config = SuiteConfig::default();
//! let engine = Arc::new(CompletionCounter::new());
//! let ring = RingAllocator::from_config(ArenaId(0), &config).unwrap();
//!
//! let mut frames = FrameLifecycleManager::<Vec<u8>, _>::from_config(&config, Arc::clone(&engine))
//!     .unwrap()
//!     .with_ring(ring);
//!
//! for frame in 1..=3u64 {
//!     frames.begin_frame().unwrap();
//!     let upload = frames.ring_mut().unwrap().allocate(4096).unwrap();
//!     // ... record commands reading `upload.offset` ...
//!     frames.defer_delete(vec![0u8; 16]);
//!     frames.end_frame(frame).unwrap();
//!
//!     // Normally signaled by the engine's completion callback.
//!     engine.signal(frame);
//! }
//! ```

pub mod allocators;
pub mod api;
pub mod coordinator;

mod sync;
mod util;

pub use allocators::atomic_ring::AtomicRingAllocator;
pub use allocators::buddy::BuddyAllocator;
pub use allocators::pool::{BlockAllocation, PoolAllocator};
pub use allocators::ring::RingAllocator;
pub use allocators::shared::SharedAllocator;
pub use allocators::tlsf::SegregatedFitAllocator;
pub use allocators::{Allocation, ArenaId, Compactable, OffsetAllocator};

pub use api::config::SuiteConfig;
pub use api::error::{AllocError, ConfigError, FrameError};
pub use api::stats::AllocatorStats;

pub use coordinator::{
    BudgetMonitor, BudgetSnapshot, CompletionCounter, CompletionSource, DefragState, DefragStats,
    Defragmenter, EvictionPolicy, FrameInfo, FrameLifecycleManager, FrameState, PlannedMove,
    Priority, RelocationHandler, ResourceDescriptor, ResourceHandle,
};

pub use util::size::{format_bytes, gb, kb, mb};
