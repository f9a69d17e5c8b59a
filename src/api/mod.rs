//! Public API types shared by every allocator and coordinator.

pub mod config;
pub mod error;
pub mod stats;
