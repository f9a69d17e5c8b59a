//! Atomic helpers for statistics and counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// An atomic counter for statistics.
#[derive(Debug)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create a new counter.
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Increment the counter.
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// High-water mark over byte counts observed from several threads.
#[derive(Debug)]
pub struct AtomicHighWater(AtomicU64);

impl AtomicHighWater {
    /// Create a new mark.
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Raise the mark to `value` if it is higher.
    pub fn update_max(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }
}

impl Default for AtomicHighWater {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = AtomicCounter::default();
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_high_water_only_rises() {
        let mark = AtomicHighWater::default();
        mark.update_max(100);
        mark.update_max(40);
        assert_eq!(mark.get(), 100);
    }
}
