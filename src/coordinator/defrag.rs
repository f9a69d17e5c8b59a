//! Incremental, time-budgeted compaction.
//!
//! Each [`Defragmenter::update`] call advances a small state machine for at
//! most the configured wall-clock budget:
//!
//! ```text
//! Idle -> Scanning -> Copying -> Barrier -> Updating -> Copying ... -> Idle
//! ```
//!
//! Live allocations slide toward offset 0. A move is only planned when the
//! destination ends at or before the source, so source and destination never
//! overlap and the copy can be issued as a plain transfer. Moving the bytes
//! and patching references is the owner's job, through [`RelocationHandler`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::allocators::{Allocation, Compactable};
use crate::api::config::SuiteConfig;
use crate::api::error::ConfigError;
use crate::util::layout::align_up;

/// Defragmenter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefragState {
    /// No pass in progress
    Idle,
    /// Computing the move plan
    Scanning,
    /// Reserving the next destination and issuing its copy
    Copying,
    /// Waiting for the issued copy to become visible
    Barrier,
    /// Patching references and freeing the old range
    Updating,
}

/// One relocation of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedMove {
    pub source: Allocation,
    pub target_offset: u64,
}

/// Owner-side half of a relocation.
pub trait RelocationHandler {
    /// Issue a copy of `from`'s bytes into `to`.
    fn copy(&mut self, from: &Allocation, to: &Allocation);

    /// Whether the last issued copy is complete. Returning `false` makes
    /// the defragmenter yield until the next update.
    fn barrier(&mut self) -> bool;

    /// Repoint every reference to `from` at `to`.
    fn update_references(&mut self, from: &Allocation, to: &Allocation);
}

/// Defragmentation statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragStats {
    pub passes_started: u64,
    pub passes_completed: u64,
    pub moves_completed: u64,
    /// Moves dropped because the destination was taken or the source was
    /// freed while its copy was in flight
    pub moves_skipped: u64,
    pub bytes_moved: u64,
}

/// Compacts one [`Compactable`] allocator a few steps at a time.
#[derive(Debug)]
pub struct Defragmenter {
    state: DefragState,
    time_budget: Duration,
    fragmentation_threshold: f32,
    pass_requested: bool,

    plan: VecDeque<PlannedMove>,
    in_flight: Option<(Allocation, Allocation)>,
    pass_moves: u64,

    /// Allocator deallocation count the current plan is valid for
    observed_frees: u64,

    /// Allocator counters when a pass last found nothing to move
    settled_at: Option<(u64, u64)>,

    stats: DefragStats,
}

impl Defragmenter {
    /// Create a defragmenter spending at most `time_budget` per update that
    /// starts a pass on its own once fragmentation exceeds `fragmentation_threshold`.
    pub fn new(time_budget: Duration, fragmentation_threshold: f32) -> Self {
        Self {
            state: DefragState::Idle,
            time_budget,
            fragmentation_threshold,
            pass_requested: false,
            plan: VecDeque::new(),
            in_flight: None,
            pass_moves: 0,
            observed_frees: 0,
            settled_at: None,
            stats: DefragStats::default(),
        }
    }

    pub fn from_config(config: &SuiteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            config.defrag_time_budget(),
            config.defrag_fragmentation_threshold,
        ))
    }

    /// Start a pass on the next update regardless of fragmentation.
    pub fn request_pass(&mut self) {
        self.pass_requested = true;
    }

    pub fn state(&self) -> DefragState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == DefragState::Idle
    }

    pub fn stats(&self) -> DefragStats {
        self.stats
    }

    /// Moves planned but not yet started.
    pub fn pending_moves(&self) -> usize {
        self.plan.len()
    }

    /// Run steps until the time budget is spent, the handler asks to wait,
    /// or a pass finishes. At least one step runs per call.
    pub fn update<T, H>(&mut self, target: &mut T, handler: &mut H) -> DefragState
    where
        T: Compactable + ?Sized,
        H: RelocationHandler + ?Sized,
    {
        let start = Instant::now();
        loop {
            let was_idle = self.is_idle();
            let progressed = self.step(target, handler);

            if !progressed || (!was_idle && self.is_idle()) || start.elapsed() >= self.time_budget {
                return self.state;
            }
        }
    }

    /// Advance one state. Returns `false` when there is nothing to do right now.
    fn step<T, H>(&mut self, target: &mut T, handler: &mut H) -> bool
    where
        T: Compactable + ?Sized,
        H: RelocationHandler + ?Sized,
    {
        match self.state {
            DefragState::Idle => {
                if !self.pass_requested && !self.fragmentation_exceeded(target) {
                    return false;
                }
                self.pass_requested = false;
                self.stats.passes_started += 1;
                self.pass_moves = 0;
                self.state = DefragState::Scanning;
                true
            }
            DefragState::Scanning => {
                self.plan = Self::plan_moves(target);
                self.observed_frees = target.stats().deallocation_count;
                log::debug!(
                    "defrag pass {}: {} moves planned, fragmentation {:.3}",
                    self.stats.passes_started,
                    self.plan.len(),
                    target.fragmentation()
                );
                self.state = DefragState::Copying;
                true
            }
            DefragState::Copying => {
                let Some(planned) = self.plan.pop_front() else {
                    self.finish_pass(target);
                    return true;
                };

                if self.owner_freed(target) || !target.is_live(&planned.source) {
                    log::debug!(
                        "defrag replanning: allocator freed memory since the scan of pass {}",
                        self.stats.passes_started
                    );
                    self.state = DefragState::Scanning;
                    return true;
                }

                match target.claim_at(planned.target_offset, planned.source.size) {
                    Ok(destination) => {
                        handler.copy(&planned.source, &destination);
                        self.in_flight = Some((planned.source, destination));
                        self.state = DefragState::Barrier;
                    }
                    Err(err) => {
                        self.stats.moves_skipped += 1;
                        log::warn!(
                            "defrag skipped move of offset {} to {}: {}",
                            planned.source.offset,
                            planned.target_offset,
                            err
                        );
                    }
                }
                true
            }
            DefragState::Barrier => {
                if !handler.barrier() {
                    return false;
                }
                self.state = DefragState::Updating;
                true
            }
            DefragState::Updating => {
                if let Some((source, destination)) = self.in_flight.take() {
                    // A free during the copy may have reused the source range,
                    // so the copied bytes can no longer be trusted.
                    if self.owner_freed(target) || !target.is_live(&source) {
                        if let Err(err) = target.free(&destination) {
                            log::warn!(
                                "defrag could not release destination offset {}: {}",
                                destination.offset,
                                err
                            );
                        }
                        self.stats.moves_skipped += 1;
                        self.state = DefragState::Scanning;
                        return true;
                    }
                    handler.update_references(&source, &destination);
                    if let Err(err) = target.free(&source) {
                        log::warn!("defrag could not free relocated offset {}: {}", source.offset, err);
                    }
                    self.observed_frees = target.stats().deallocation_count;
                    self.stats.moves_completed += 1;
                    self.stats.bytes_moved += source.size;
                    self.pass_moves += 1;
                }
                self.state = DefragState::Copying;
                true
            }
        }
    }

    /// Whether something other than this defragmenter freed memory since the
    /// plan was made.
    fn owner_freed<T: Compactable + ?Sized>(&self, target: &T) -> bool {
        target.stats().deallocation_count != self.observed_frees
    }

    fn fragmentation_exceeded<T: Compactable + ?Sized>(&self, target: &T) -> bool {
        if target.fragmentation() <= self.fragmentation_threshold {
            return false;
        }
        let stats = target.stats();
        self.settled_at != Some((stats.allocation_count, stats.deallocation_count))
    }

    fn plan_moves<T: Compactable + ?Sized>(target: &T) -> VecDeque<PlannedMove> {
        let mut plan = VecDeque::new();
        let mut cursor = 0;

        for allocation in target.live_allocations() {
            let target_offset = align_up(cursor, target.placement_alignment(&allocation));
            if target_offset + allocation.size <= allocation.offset {
                plan.push_back(PlannedMove {
                    source: allocation,
                    target_offset,
                });
                cursor = target_offset + allocation.size;
            } else {
                cursor = allocation.end();
            }
        }
        plan
    }

    fn finish_pass<T: Compactable + ?Sized>(&mut self, target: &T) {
        self.stats.passes_completed += 1;
        self.settled_at = (self.pass_moves == 0).then(|| {
            let stats = target.stats();
            (stats.allocation_count, stats.deallocation_count)
        });
        self.state = DefragState::Idle;

        log::debug!(
            "defrag pass {} finished: {} moves, fragmentation {:.3}",
            self.stats.passes_completed,
            self.pass_moves,
            target.fragmentation()
        );
    }
}

impl Default for Defragmenter {
    fn default() -> Self {
        let config = SuiteConfig::default();
        Self::new(config.defrag_time_budget(), config.defrag_fragmentation_threshold)
    }
}
