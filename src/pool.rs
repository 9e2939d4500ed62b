//! Pool of arenas for one size class.
//!
//! Holds up to [`MAX_ARENAS_PER_CLASS`] arena slots.  Arenas are only ever
//! appended, never removed, for the pool's lifetime; the slot count moves
//! backwards only to roll back a failed creation.  Lookups are
//! load-balanced by a round-robin `current_arena` hint; races on the hint
//! are accepted and harmless.

use crate::arena::Arena;
use crate::policy::{AllocPolicy, CounterCell, SlotCell};
use crate::sync::hint;
use crate::vm::VmError;
use std::ptr::NonNull;

/// Maximum number of arenas per size class.
pub(crate) const MAX_ARENAS_PER_CLASS: usize = 16;

pub(crate) struct ArenaPool<P: AllocPolicy> {
    slots: [P::Slot<Arena<P>>; MAX_ARENAS_PER_CLASS],
    /// Populated slot count.  Under `Shared`, a slot index may be reserved
    /// (count advanced) before its arena pointer is published; scans skip
    /// the still-null slot.
    num_arenas: P::Counter,
    /// Round-robin hint: the arena that last satisfied an allocation.
    current_arena: P::Counter,
    block_size: usize,
}

impl<P: AllocPolicy> ArenaPool<P> {
    /// An empty pool fixed to one block size.  Reserves nothing until the
    /// first allocation.
    pub fn new(block_size: usize) -> Self {
        Self {
            slots: std::array::from_fn(|_| SlotCell::empty()),
            num_arenas: CounterCell::new(0),
            current_arena: CounterCell::new(0),
            block_size,
        }
    }

    /// Allocate one block from any arena, growing by one arena if every
    /// existing one is full.
    ///
    /// `Ok(None)` means all [`MAX_ARENAS_PER_CLASS`] arenas exist and are
    /// full — expected exhaustion, reported as a value so the front-end
    /// decides how to fail.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if growing required an OS reservation and it
    /// failed; the reserved slot count is rolled back first.
    pub fn allocate(&self) -> Result<Option<NonNull<u8>>, VmError> {
        loop {
            let num = self.num_arenas.load_acquire();
            let current = self.current_arena.load();

            if current < num
                && let Some(ptr) = self.allocate_from(current)
            {
                return Ok(Some(ptr));
            }

            for i in 0..num {
                if i == current {
                    continue;
                }
                if let Some(ptr) = self.allocate_from(i) {
                    // Best-effort hint update; concurrent writers may race.
                    self.current_arena.store(i);
                    return Ok(Some(ptr));
                }
            }

            if num >= MAX_ARENAS_PER_CLASS {
                return Ok(None);
            }

            if !self.num_arenas.try_reserve(num) {
                // Another thread claimed the slot; wait out its publish
                // and rescan including its arena.
                hint::spin_loop();
                continue;
            }

            let arena = match Arena::new(self.block_size) {
                Ok(arena) => arena,
                Err(e) => {
                    self.num_arenas.rollback_reserve();
                    return Err(e);
                }
            };

            let raw = Box::into_raw(arena);
            self.slots[num].store(raw);
            self.current_arena.store(num);

            // Safety: raw was just published and is owned by this pool
            // until drop.
            match unsafe { &*raw }.allocate() {
                Some(ptr) => return Ok(Some(ptr)),
                // Drained by other threads before we got a block; rescan.
                None => continue,
            }
        }
    }

    /// Route a free to the arena owning `ptr`.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on
    /// this pool and must not have been freed already.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let num = self.num_arenas.load_acquire();
        for i in 0..num {
            let raw = self.slots[i].load();
            if raw.is_null() {
                continue;
            }
            // Safety: published slots stay valid until the pool drops.
            let arena = unsafe { &*raw };
            if arena.owns(ptr.as_ptr()) {
                // Safety: ownership just verified; pairing upheld by caller.
                unsafe { arena.deallocate(ptr) };
                return;
            }
        }
        debug_assert!(
            false,
            "pointer {ptr:p} does not belong to any arena of this pool",
        );
    }

    fn allocate_from(&self, index: usize) -> Option<NonNull<u8>> {
        let raw = self.slots[index].load();
        if raw.is_null() {
            // Slot reserved by a grower that has not published yet.
            return None;
        }
        // Safety: published slots stay valid until the pool drops.
        unsafe { &*raw }.allocate()
    }

    #[cfg(test)]
    pub(crate) fn arena_count(&self) -> usize {
        self.num_arenas.load()
    }

    #[cfg(test)]
    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }
}

impl<P: AllocPolicy> Drop for ArenaPool<P> {
    fn drop(&mut self) {
        for slot in &self.slots {
            let raw = slot.load();
            if !raw.is_null() {
                // Safety: the pool owns every published arena; each slot is
                // released exactly once.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}
