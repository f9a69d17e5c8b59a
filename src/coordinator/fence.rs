//! Completion values reported by the execution engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Condvar;
use std::time::{Duration, Instant};

use crate::sync::atomics::AtomicCounter;

/// Source of monotonically increasing completion values.
///
/// Value `V` counts as reached once `completed_value() >= V`.
pub trait CompletionSource {
    /// Highest value the engine has signaled so far.
    fn completed_value(&self) -> u64;

    /// Block until `value` is reached or `timeout` elapses.
    /// Returns whether the value was reached.
    fn wait_for(&self, value: u64, timeout: Duration) -> bool;

    /// Whether `value` has been reached, without blocking.
    fn is_reached(&self, value: u64) -> bool {
        self.completed_value() >= value
    }
}

/// In-process completion counter, signaled from an engine callback thread.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    value: AtomicU64,
    lock: std::sync::Mutex<()>,
    signaled: Condvar,
    blocked_waits: AtomicCounter,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the engine finished every submission up to `value`.
    /// Lower values than the current one are ignored.
    pub fn signal(&self, value: u64) {
        let previous = self.value.fetch_max(value, Ordering::AcqRel);
        if value > previous {
            // Taking the lock orders this notify after any waiter's check.
            drop(self.lock.lock());
            self.signaled.notify_all();
        }
    }

    /// Number of `wait_for` calls that had to block.
    pub fn blocked_waits(&self) -> u64 {
        self.blocked_waits.get()
    }
}

impl CompletionSource for CompletionCounter {
    fn completed_value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn wait_for(&self, value: u64, timeout: Duration) -> bool {
        if self.is_reached(value) {
            return true;
        }
        self.blocked_waits.increment();

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !self.is_reached(value) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.signaled.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl<T: CompletionSource + ?Sized> CompletionSource for std::sync::Arc<T> {
    fn completed_value(&self) -> u64 {
        (**self).completed_value()
    }

    fn wait_for(&self, value: u64, timeout: Duration) -> bool {
        (**self).wait_for(value, timeout)
    }
}
