//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., the mapped total may briefly disagree with the sum
//! of per-tier counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
///
/// With the `stats` feature disabled the mutators compile to nothing and
/// every reader observes zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(feature = "stats")]
    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[cfg(feature = "stats")]
    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[cfg(not(feature = "stats"))]
    #[inline]
    pub fn add(&self, _val: usize) {}

    #[cfg(feature = "stats")]
    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[cfg(not(feature = "stats"))]
    #[inline]
    pub fn sub(&self, _val: usize) {}

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

/// Monotone event counter. Same feature gating as [`Counter`].
pub struct EventCounter(AtomicU64);

impl EventCounter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[cfg(feature = "stats")]
    #[inline]
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(not(feature = "stats"))]
    #[inline]
    pub fn hit(&self) {}

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// Total bytes currently mapped by the engine (all tiers).
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}

// Breakdown by tier.
crate::sync::static_atomic! {
    pub static BLOCK_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static HUGE_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static OS_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static POOL_BYTES: Counter = Counter::new();
}

// Operation counters.
crate::sync::static_atomic! {
    pub static CONTEXTS_CREATED: EventCounter = EventCounter::new();
}
crate::sync::static_atomic! {
    pub static GROUPS_OBTAINED: EventCounter = EventCounter::new();
}
crate::sync::static_atomic! {
    pub static GROUPS_RETURNED: EventCounter = EventCounter::new();
}
crate::sync::static_atomic! {
    pub static PARTIAL_RETURNS: EventCounter = EventCounter::new();
}
crate::sync::static_atomic! {
    pub static PUBLIC_FREES: EventCounter = EventCounter::new();
}
crate::sync::static_atomic! {
    pub static LOCATIONS_STOLEN: EventCounter = EventCounter::new();
}
crate::sync::static_atomic! {
    pub static HUGE_CACHE_HITS: EventCounter = EventCounter::new();
}
crate::sync::static_atomic! {
    pub static HUGE_CACHE_EVICTIONS: EventCounter = EventCounter::new();
}

/// Point-in-time snapshot of the gauge counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryStats {
    pub total_mapped: usize,
    pub block_bytes: usize,
    pub huge_bytes: usize,
    pub os_bytes: usize,
    pub pool_bytes: usize,
    pub contexts_created: u64,
    pub groups_obtained: u64,
    pub groups_returned: u64,
    pub public_frees: u64,
    pub locations_stolen: u64,
    pub huge_cache_hits: u64,
    pub huge_cache_evictions: u64,
}

impl MemoryStats {
    pub fn snapshot() -> Self {
        Self {
            total_mapped: TOTAL_MAPPED.get(),
            block_bytes: BLOCK_BYTES.get(),
            huge_bytes: HUGE_BYTES.get(),
            os_bytes: OS_BYTES.get(),
            pool_bytes: POOL_BYTES.get(),
            contexts_created: CONTEXTS_CREATED.get(),
            groups_obtained: GROUPS_OBTAINED.get(),
            groups_returned: GROUPS_RETURNED.get(),
            public_frees: PUBLIC_FREES.get(),
            locations_stolen: LOCATIONS_STOLEN.get(),
            huge_cache_hits: HUGE_CACHE_HITS.get(),
            huge_cache_evictions: HUGE_CACHE_EVICTIONS.get(),
        }
    }
}

#[cfg(all(test, not(loom), feature = "stats"))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let c = Counter::new();
        c.sub(10);
        assert_eq!(c.get(), 0);
        c.add(25);
        assert_eq!(c.get(), 15);
    }

    #[test]
    fn test_event_counter() {
        let c = EventCounter::new();
        assert_eq!(c.get(), 0);
        c.hit();
        c.hit();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn test_snapshot_reads_globals() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = MemoryStats::snapshot();
        TOTAL_MAPPED.add(4096);
        let after = MemoryStats::snapshot();
        assert_eq!(after.total_mapped, before.total_mapped + 4096);
        TOTAL_MAPPED.sub(4096);
    }
}
