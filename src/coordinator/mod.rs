//! Frame pacing, budget observation, eviction and compaction.
//!
//! These components sit above the allocators: they decide when memory may be
//! reused or moved, but never allocate device memory themselves.

pub mod budget;
pub mod defrag;
pub mod eviction;
pub mod fence;
pub mod frame;

pub use budget::{BudgetMonitor, BudgetSnapshot};
pub use defrag::{DefragState, DefragStats, Defragmenter, PlannedMove, RelocationHandler};
pub use eviction::{EvictionPolicy, Priority, ResourceDescriptor, ResourceHandle};
pub use fence::{CompletionCounter, CompletionSource};
pub use frame::{FrameInfo, FrameLifecycleManager, FrameState};
