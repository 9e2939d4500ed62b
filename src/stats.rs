//! All counters use `Relaxed` ordering.  Individual counter values are
//! eventually consistent.  Cross-counter snapshots may be transiently
//! inconsistent (e.g., the total may briefly disagree with the sum of
//! per-subsystem counters).  This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero.  Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
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

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    #[inline]
    pub fn fetch_add(&self, val: usize, ordering: Ordering) -> usize {
        self.0
            .fetch_add(Self::delta(val), ordering)
            .max(0)
            .cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Total address space reserved by the allocator (arenas + oversize).
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}

// Address space held by live arenas.
crate::sync::static_atomic! {
    pub static ARENA_RESERVED: Counter = Counter::new();
}

// Number of live arenas across all pools and policies.
crate::sync::static_atomic! {
    pub static ARENA_COUNT: Counter = Counter::new();
}

// Address space held by oversize (direct OS) allocations.
crate::sync::static_atomic! {
    pub static OVERSIZE_RESERVED: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub(crate) fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time view of the allocator's address-space gauges.
#[derive(Clone, Copy, Debug)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub arena_reserved: usize,
    pub arena_count: usize,
    pub oversize_reserved: usize,
}

/// Snapshot the gauges.  Eventually consistent; diagnostics only.
#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        total_reserved: TOTAL_RESERVED.load(Ordering::Relaxed),
        arena_reserved: ARENA_RESERVED.load(Ordering::Relaxed),
        arena_count: ARENA_COUNT.load(Ordering::Relaxed),
        oversize_reserved: OVERSIZE_RESERVED.load(Ordering::Relaxed),
    }
}
