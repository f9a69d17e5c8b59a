//! Memory budget monitoring.
//!
//! The monitor only observes: it never allocates, frees or evicts. Callers
//! feed it the usage and budget reported by the platform once per frame and
//! react to pressure in the callback, typically by asking the
//! [`EvictionPolicy`](crate::coordinator::eviction::EvictionPolicy) what to drop.

use std::collections::VecDeque;

use crate::api::config::SuiteConfig;
use crate::api::error::ConfigError;

/// Samples per trend window half.
const TREND_HALF_WINDOW: usize = 5;

/// One budget sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSnapshot {
    /// Budget granted by the platform
    pub budget: u64,

    /// Bytes in use
    pub current_usage: u64,

    /// `current_usage / budget`
    pub ratio: f32,

    /// Change of the ratio between the older and newer half of the last samples
    pub trend: f32,
}

impl BudgetSnapshot {
    /// Bytes over budget, zero when within it.
    pub fn overage_bytes(&self) -> u64 {
        self.current_usage.saturating_sub(self.budget)
    }

    /// Whether usage exceeds the budget.
    pub fn is_over_budget(&self) -> bool {
        self.current_usage > self.budget
    }
}

type PressureCallback = Box<dyn Fn(&BudgetSnapshot) + Send + Sync>;

/// Tracks usage against a budget and reports pressure.
pub struct BudgetMonitor {
    /// Usage ratios, oldest first
    history: VecDeque<f32>,
    history_len: usize,

    pressure_threshold: f32,
    pressure_callback: Option<PressureCallback>,

    latest: Option<BudgetSnapshot>,
    peak_ratio: f32,
    pressure_events: u64,
}

impl BudgetMonitor {
    /// Create a monitor keeping `history_len` samples that reports pressure
    /// once the ratio exceeds `pressure_threshold`.
    pub fn new(history_len: usize, pressure_threshold: f32) -> Self {
        Self {
            history: VecDeque::with_capacity(history_len.max(1)),
            history_len: history_len.max(1),
            pressure_threshold,
            pressure_callback: None,
            latest: None,
            peak_ratio: 0.0,
            pressure_events: 0,
        }
    }

    pub fn from_config(config: &SuiteConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config.budget_history_len, config.budget_pressure_threshold))
    }

    /// Builder pattern: register the pressure callback.
    pub fn with_pressure_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BudgetSnapshot) + Send + Sync + 'static,
    {
        self.set_pressure_callback(callback);
        self
    }

    /// Set a callback for pressure events, replacing any previous one.
    pub fn set_pressure_callback<F>(&mut self, callback: F)
    where
        F: Fn(&BudgetSnapshot) + Send + Sync + 'static,
    {
        self.pressure_callback = Some(Box::new(callback));
    }

    /// Record a sample.
    pub fn update(&mut self, current_usage: u64, budget: u64) -> BudgetSnapshot {
        let ratio = if budget == 0 {
            if current_usage == 0 {
                0.0
            } else {
                f32::INFINITY
            }
        } else {
            (current_usage as f64 / budget as f64) as f32
        };

        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(ratio);

        let snapshot = BudgetSnapshot {
            budget,
            current_usage,
            ratio,
            trend: self.trend(),
        };
        self.latest = Some(snapshot);
        self.peak_ratio = self.peak_ratio.max(ratio);

        if ratio > self.pressure_threshold {
            self.pressure_events += 1;
            log::warn!(
                "memory pressure: {} of {} bytes in use (ratio {:.2}, trend {:+.3})",
                current_usage,
                budget,
                ratio,
                snapshot.trend
            );
            if let Some(callback) = &self.pressure_callback {
                callback(&snapshot);
            }
        }

        snapshot
    }

    /// Average of the newest half minus average of the oldest half of the
    /// last (up to) ten samples.
    fn trend(&self) -> f32 {
        let window = self.history.len().min(TREND_HALF_WINDOW * 2);
        if window < 2 {
            return 0.0;
        }
        let half = window / 2;
        let start = self.history.len() - window;

        let average = |range: std::ops::Range<usize>| {
            let len = range.len() as f32;
            range.map(|i| self.history[i]).sum::<f32>() / len
        };
        let older = average(start..start + half);
        let newer = average(self.history.len() - half..self.history.len());
        newer - older
    }

    /// The most recent sample.
    pub fn latest(&self) -> Option<&BudgetSnapshot> {
        self.latest.as_ref()
    }

    /// Recorded ratios, oldest first.
    pub fn history(&self) -> impl Iterator<Item = f32> + '_ {
        self.history.iter().copied()
    }

    /// Highest ratio ever recorded.
    pub fn peak_ratio(&self) -> f32 {
        self.peak_ratio
    }

    /// Number of samples above the pressure threshold.
    pub fn pressure_events(&self) -> u64 {
        self.pressure_events
    }

    pub fn pressure_threshold(&self) -> f32 {
        self.pressure_threshold
    }
}

impl Default for BudgetMonitor {
    fn default() -> Self {
        let config = SuiteConfig::default();
        Self::new(config.budget_history_len, config.budget_pressure_threshold)
    }
}

impl std::fmt::Debug for BudgetMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetMonitor")
            .field("samples", &self.history.len())
            .field("pressure_threshold", &self.pressure_threshold)
            .field("latest", &self.latest)
            .field("pressure_events", &self.pressure_events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_ratio_and_zero_budget() {
        let mut monitor = BudgetMonitor::new(60, 1.0);
        assert_eq!(monitor.update(50, 100).ratio, 0.5);
        assert_eq!(monitor.update(0, 0).ratio, 0.0);
        assert!(monitor.update(1, 0).ratio.is_infinite());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut monitor = BudgetMonitor::new(4, 1.0);
        for usage in 0..10 {
            monitor.update(usage, 10);
        }
        let history: Vec<f32> = monitor.history().collect();
        assert_eq!(history, vec![0.6, 0.7, 0.8, 0.9]);
    }

    #[test]
    fn test_trend() {
        let mut monitor = BudgetMonitor::new(60, 10.0);
        assert_eq!(monitor.update(10, 100).trend, 0.0);

        // Two samples: one per half.
        let trend = monitor.update(30, 100).trend;
        assert!((trend - 0.2).abs() < 1e-6);

        // Ten rising samples: last five average 0.8, first five 0.3.
        let mut monitor = BudgetMonitor::new(60, 10.0);
        let mut last = None;
        for i in 1..=10 {
            last = Some(monitor.update(i * 10, 100));
        }
        let trend = last.unwrap().trend;
        assert!((trend - 0.5).abs() < 1e-5, "trend was {trend}");

        // Flat usage has no trend.
        for _ in 0..10 {
            last = Some(monitor.update(40, 100));
        }
        assert!(last.unwrap().trend.abs() < 1e-6);
    }

    #[test]
    fn test_pressure_callback_receives_snapshot() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut monitor = BudgetMonitor::new(60, 1.0)
            .with_pressure_callback(move |snapshot| sink.lock().unwrap().push(*snapshot));

        monitor.update(100, 100);
        assert!(seen.lock().unwrap().is_empty());

        monitor.update(150, 100);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].ratio, 1.5);
        assert_eq!(seen[0].overage_bytes(), 50);
        assert_eq!(monitor.pressure_events(), 1);
        assert_eq!(monitor.peak_ratio(), 1.5);
    }

    #[test]
    fn test_custom_threshold() {
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        let mut monitor = BudgetMonitor::new(8, 0.9).with_pressure_callback(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        monitor.update(89, 100);
        monitor.update(95, 100);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.latest().map(|s| s.current_usage), Some(95));
    }
}
