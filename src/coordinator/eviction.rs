//! Priority-based eviction and load selection.
//!
//! The policy owns nothing: resource owners describe their resources and
//! act on the handles returned.

use std::cmp::Reverse;

/// Residency priority. Variants are ordered from most to least important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Never evicted (render targets, active frame data)
    Critical,
    /// Needed soon
    High,
    /// Normal priority
    #[default]
    Normal,
    /// Can be evicted under pressure
    Low,
    /// Evicted first (prefetched or distant content)
    Background,
}

/// Caller-defined resource identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle(pub u64);

impl ResourceHandle {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// What the policy needs to know about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub priority: Priority,
    pub size: u64,
    /// Tick (usually the frame number) of the last use
    pub last_used_tick: u64,
    /// Whether the resource currently occupies memory
    pub resident: bool,
}

/// Chooses which resources to evict or load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Resources at this priority or more important are never evicted
    protection_floor: Priority,
}

impl EvictionPolicy {
    /// Policy that evicts only [`Priority::Low`] and [`Priority::Background`] resources.
    pub fn new() -> Self {
        Self {
            protection_floor: Priority::Normal,
        }
    }

    /// Builder pattern: protect everything at least as important as `floor`.
    /// [`Priority::Critical`] stays protected whatever the floor.
    pub fn with_protection_floor(mut self, floor: Priority) -> Self {
        self.protection_floor = floor;
        self
    }

    pub fn protection_floor(&self) -> Priority {
        self.protection_floor
    }

    /// Whether a resource of `priority` may be evicted.
    pub fn is_evictable(&self, priority: Priority) -> bool {
        priority != Priority::Critical && priority > self.protection_floor
    }

    /// Resident resources to evict to free at least `target_bytes`,
    /// least important and least recently used first.
    ///
    /// Returns fewer bytes than requested when nothing else is evictable.
    pub fn eviction_candidates<'a, I>(&self, resources: I, target_bytes: u64) -> Vec<ResourceHandle>
    where
        I: IntoIterator<Item = (ResourceHandle, &'a ResourceDescriptor)>,
    {
        if target_bytes == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<_> = resources
            .into_iter()
            .filter(|(_, desc)| desc.resident && self.is_evictable(desc.priority))
            .collect();
        candidates.sort_by_key(|(handle, desc)| (Reverse(desc.priority), desc.last_used_tick, *handle));

        let mut freed = 0u64;
        let mut selected = Vec::new();
        for (handle, desc) in candidates {
            if freed >= target_bytes {
                break;
            }
            freed = freed.saturating_add(desc.size);
            selected.push(handle);
        }

        if freed < target_bytes {
            log::warn!(
                "eviction covers only {} of {} requested bytes",
                freed,
                target_bytes
            );
        } else {
            log::debug!("evicting {} resources for {} bytes", selected.len(), freed);
        }
        selected
    }

    /// Non-resident resources to load within `budget_bytes`, most important
    /// and most recently used first. A resource too large for the remaining
    /// budget is skipped; smaller ones after it may still fit.
    pub fn load_candidates<'a, I>(&self, resources: I, budget_bytes: u64) -> Vec<ResourceHandle>
    where
        I: IntoIterator<Item = (ResourceHandle, &'a ResourceDescriptor)>,
    {
        let mut candidates: Vec<_> = resources.into_iter().filter(|(_, desc)| !desc.resident).collect();
        candidates.sort_by_key(|(handle, desc)| (desc.priority, Reverse(desc.last_used_tick), *handle));

        let mut remaining = budget_bytes;
        candidates
            .into_iter()
            .filter(|(_, desc)| {
                let fits = desc.size <= remaining;
                if fits {
                    remaining -= desc.size;
                }
                fits
            })
            .map(|(handle, _)| handle)
            .collect()
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new()
    }
}
