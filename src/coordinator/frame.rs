//! Frame lifecycle: N frames in flight, completion-gated reclamation and
//! deferred deletion.
//!
//! Each frame slot remembers the completion value its submission signals.
//! A slot is only reused, and the resources deferred into it only dropped,
//! once the execution engine has reached that value:
//!
//! ```text
//! Idle -> Recording -> Submitted -> (engine completes) -> Completed -> Recording ...
//! ```

use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::allocators::ring::RingAllocator;
use crate::api::config::SuiteConfig;
use crate::api::error::{ConfigError, FrameError};
use crate::coordinator::budget::BudgetMonitor;
use crate::coordinator::fence::CompletionSource;

/// State of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// Never used, or drained by `wait_idle`
    Idle,
    /// Commands for this slot are being recorded
    Recording,
    /// Submitted; waiting for the engine to reach the completion value
    Submitted,
    /// The engine reached the completion value
    Completed,
}

/// Returned by [`FrameLifecycleManager::begin_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Number of the frame now being recorded, starting at 0
    pub frame_number: u64,
    /// Slot the frame records into
    pub slot: usize,
    /// Deferred resources released while reclaiming the slot
    pub released: usize,
}

/// Per-frame bookkeeping.
struct FrameSlot<R> {
    completion_value: u64,
    /// Ring head when the frame was closed; the tail reaches it on completion
    ring_tail_offset: u64,
    deferred: SegQueue<R>,
    state: FrameState,
}

impl<R> FrameSlot<R> {
    fn new() -> Self {
        Self {
            completion_value: 0,
            ring_tail_offset: 0,
            deferred: SegQueue::new(),
            state: FrameState::Idle,
        }
    }

    /// Drop every deferred resource, returning how many there were.
    fn release(&self) -> usize {
        let mut released = 0;
        while let Some(resource) = self.deferred.pop() {
            drop(resource);
            released += 1;
        }
        released
    }
}

type UsageProbe = Box<dyn Fn() -> (u64, u64) + Send + Sync>;

/// Drives frames through their slots and owns what must outlive them.
///
/// `R` is the deferred resource type; releasing a resource means dropping it.
/// `C` reports how far the execution engine has progressed.
pub struct FrameLifecycleManager<R, C> {
    slots: Vec<FrameSlot<R>>,
    current: usize,
    recording: bool,

    /// Slot receiving `defer_delete` calls
    deferred_target: usize,

    frame_number: u64,
    last_signaled: Option<u64>,
    last_completed: u64,

    completion: C,
    wait_timeout: Duration,
    poisoned: Option<FrameError>,

    ring: Option<RingAllocator>,
    monitor: Option<(BudgetMonitor, UsageProbe)>,

    released_total: u64,
}

impl<R, C: CompletionSource> FrameLifecycleManager<R, C> {
    /// Create a manager with `frames_in_flight` slots.
    ///
    /// # Panics
    ///
    /// Panics if `frames_in_flight` is zero.
    pub fn new(frames_in_flight: usize, completion: C, wait_timeout: Duration) -> Self {
        assert!(frames_in_flight > 0, "at least one frame must be in flight");

        Self {
            slots: (0..frames_in_flight).map(|_| FrameSlot::new()).collect(),
            current: 0,
            recording: false,
            deferred_target: 0,
            frame_number: 0,
            last_signaled: None,
            last_completed: completion.completed_value(),
            completion,
            wait_timeout,
            poisoned: None,
            ring: None,
            monitor: None,
            released_total: 0,
        }
    }

    pub fn from_config(config: &SuiteConfig, completion: C) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            config.frames_in_flight,
            completion,
            config.engine_wait_timeout(),
        ))
    }

    /// Builder pattern: own the per-frame ring, reclaiming it at frame boundaries.
    pub fn with_ring(mut self, ring: RingAllocator) -> Self {
        self.ring = Some(ring);
        self
    }

    /// Builder pattern: sample `monitor` at every `begin_frame` with the
    /// `(usage, budget)` pair returned by `sample_usage`.
    pub fn with_budget_monitor<F>(mut self, monitor: BudgetMonitor, sample_usage: F) -> Self
    where
        F: Fn() -> (u64, u64) + Send + Sync + 'static,
    {
        self.monitor = Some((monitor, Box::new(sample_usage)));
        self
    }

    /// Start recording a frame into the next slot.
    ///
    /// Blocks while that slot's previous submission is still executing.
    pub fn begin_frame(&mut self) -> Result<FrameInfo, FrameError> {
        self.check_poisoned()?;
        if self.recording {
            return Err(FrameError::AlreadyRecording {
                frame_number: self.frame_number,
            });
        }

        let slot = self.current;
        self.wait_slot(slot)?;
        self.observe_completion();

        let released = self.slots[slot].release();
        self.released_total += released as u64;

        if let Some(ring) = self.ring.as_mut() {
            ring.reset_tail(self.last_completed);
        }
        if let Some((monitor, sample_usage)) = self.monitor.as_mut() {
            let (usage, budget) = sample_usage();
            monitor.update(usage, budget);
        }

        self.slots[slot].state = FrameState::Recording;
        self.recording = true;
        self.deferred_target = slot;

        log::trace!(
            "begin frame {} in slot {} ({} deferred released)",
            self.frame_number,
            slot,
            released
        );

        Ok(FrameInfo {
            frame_number: self.frame_number,
            slot,
            released,
        })
    }

    /// Close the frame being recorded. Its slot is reusable once the engine
    /// reports `signaled_value`.
    pub fn end_frame(&mut self, signaled_value: u64) -> Result<(), FrameError> {
        self.check_poisoned()?;
        if !self.recording {
            return Err(FrameError::NotRecording);
        }
        if let Some(previous) = self.last_signaled {
            if signaled_value <= previous {
                return Err(FrameError::NonMonotonicSignal {
                    previous,
                    signaled: signaled_value,
                });
            }
        }

        let ring_head = self
            .ring
            .as_mut()
            .map(|ring| ring.mark_frame_end(signaled_value))
            .unwrap_or(0);

        let slot = &mut self.slots[self.current];
        slot.completion_value = signaled_value;
        slot.ring_tail_offset = ring_head;
        slot.state = FrameState::Submitted;

        // Resources deferred between frames join the frame just submitted.
        self.deferred_target = self.current;
        self.last_signaled = Some(signaled_value);
        self.current = (self.current + 1) % self.slots.len();
        self.recording = false;
        self.frame_number += 1;
        Ok(())
    }

    /// Queue `resource` for release once the GPU work that may use it is
    /// done. Callable from several recording threads.
    pub fn defer_delete(&self, resource: R) {
        self.slots[self.deferred_target].deferred.push(resource);
    }

    /// Wait for every submitted frame and release all deferred resources.
    /// Returns the number of released resources.
    pub fn wait_idle(&mut self) -> Result<usize, FrameError> {
        self.check_poisoned()?;
        if self.recording {
            return Err(FrameError::AlreadyRecording {
                frame_number: self.frame_number,
            });
        }

        for slot in 0..self.slots.len() {
            self.wait_slot(slot)?;
        }
        self.observe_completion();

        let mut released = 0;
        for slot in &mut self.slots {
            released += slot.release();
            slot.state = FrameState::Idle;
        }
        self.released_total += released as u64;

        if let Some(ring) = self.ring.as_mut() {
            ring.reset_tail(self.last_completed);
        }

        log::debug!("frame manager idle, {} deferred resources released", released);
        Ok(released)
    }

    /// Abandon any frame being recorded, wait for all submitted frames and
    /// release everything.
    pub fn shutdown(mut self) -> Result<usize, FrameError> {
        if self.recording {
            log::debug!("shutdown abandons unsubmitted frame {}", self.frame_number);
            self.slots[self.current].state = FrameState::Idle;
            self.recording = false;
        }
        self.wait_idle()
    }

    /// Wait until `slot`'s submission has completed.
    fn wait_slot(&mut self, slot: usize) -> Result<(), FrameError> {
        if self.slots[slot].state != FrameState::Submitted {
            return Ok(());
        }

        let awaited = self.slots[slot].completion_value;
        if !self.completion.is_reached(awaited) {
            log::debug!("waiting for completion value {} (slot {})", awaited, slot);

            let start = Instant::now();
            if !self.completion.wait_for(awaited, self.wait_timeout) {
                let err = FrameError::EngineHang {
                    awaited,
                    completed: self.completion.completed_value(),
                    waited: start.elapsed(),
                };
                log::error!("{}", err);
                self.poisoned = Some(err.clone());
                return Err(err);
            }
        }

        self.slots[slot].state = FrameState::Completed;
        Ok(())
    }

    /// Pick up the latest completion value and mark every covered slot.
    fn observe_completion(&mut self) {
        self.last_completed = self.last_completed.max(self.completion.completed_value());
        for slot in &mut self.slots {
            if slot.state == FrameState::Submitted && slot.completion_value <= self.last_completed {
                slot.state = FrameState::Completed;
            }
        }
    }

    fn check_poisoned(&self) -> Result<(), FrameError> {
        match &self.poisoned {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Number of the frame being recorded, or of the next one.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Slot being recorded, or the next slot to record into.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Whether an engine hang made the manager unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Highest completion value observed at a frame boundary.
    pub fn last_completed_value(&self) -> u64 {
        self.last_completed
    }

    pub fn slot_state(&self, slot: usize) -> Option<FrameState> {
        self.slots.get(slot).map(|s| s.state)
    }

    /// Completion value stamped on `slot` and the ring head it releases.
    pub fn slot_marker(&self, slot: usize) -> Option<(u64, u64)> {
        self.slots
            .get(slot)
            .map(|s| (s.completion_value, s.ring_tail_offset))
    }

    /// Resources waiting for their frame to complete.
    pub fn pending_deferred(&self) -> usize {
        self.slots.iter().map(|s| s.deferred.len()).sum()
    }

    /// Total resources released so far.
    pub fn released_total(&self) -> u64 {
        self.released_total
    }

    pub fn ring(&self) -> Option<&RingAllocator> {
        self.ring.as_ref()
    }

    /// The owned ring, for allocating frame data.
    pub fn ring_mut(&mut self) -> Option<&mut RingAllocator> {
        self.ring.as_mut()
    }

    pub fn monitor(&self) -> Option<&BudgetMonitor> {
        self.monitor.as_ref().map(|(monitor, _)| monitor)
    }

    pub fn completion(&self) -> &C {
        &self.completion
    }
}

impl<R, C> Drop for FrameLifecycleManager<R, C> {
    fn drop(&mut self) {
        // Slots are never released here without confirmed completion.
        let unconfirmed = |slot: &FrameSlot<R>| {
            slot.state == FrameState::Submitted || slot.state == FrameState::Recording
        };

        let mut leaked = 0;
        for slot in self.slots.iter().filter(|s| unconfirmed(*s)) {
            while let Some(resource) = slot.deferred.pop() {
                std::mem::forget(resource);
                leaked += 1;
            }
        }
        if leaked > 0 {
            log::error!(
                "frame manager dropped with unfinished frames, leaking {} deferred resources",
                leaked
            );
        }
    }
}

impl<R, C> std::fmt::Debug for FrameLifecycleManager<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLifecycleManager")
            .field("frames_in_flight", &self.slots.len())
            .field("current", &self.current)
            .field("recording", &self.recording)
            .field("frame_number", &self.frame_number)
            .field("last_completed", &self.last_completed)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
