//! A single fixed-size arena: one 64MB reserved region dedicated to one
//! block size, with a bump cursor for never-touched space and a two-level
//! free bitmap for recycled blocks.
//!
//! Region layout, front to back: `num_blocks` payload blocks, then the L2
//! bitmap (one bit per block, set = free), then the L1 bitmap (one summary
//! bit per [`L2_WORDS_PER_L1_BIT`] L2 words, set = "some block in this
//! region may be free").  L1 lets the search skip fully-occupied regions
//! without touching their L2 words.
//!
//! A block index is in exactly one of three states: above the bump cursor
//! (never allocated, not represented in the bitmap), set in L2 (freed,
//! available for reuse), or clear in L2 and below the bump cursor
//! (currently allocated).

use crate::policy::{AllocPolicy, CounterCell};
use crate::stats;
use crate::sync::atomic::Ordering;
use crate::vm::{PlatformVmOps, VmError, VmOps};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Size of each arena's reserved region in bytes (64MB).
pub(crate) const ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Number of L2 bitmap words summarized by one L1 bit.
pub(crate) const L2_WORDS_PER_L1_BIT: usize = 64;

/// Half-open span of address space: `[base, base + len)`.
///
/// Ownership tests and pointer/offset conversions go through this type
/// instead of ad-hoc pointer arithmetic.
#[derive(Clone, Copy)]
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    /// Single-comparison bound check: a pointer below `base` wraps to a
    /// huge offset and fails the `< len` test.
    #[inline]
    fn contains(&self, ptr: *const u8) -> bool {
        (ptr as usize).wrapping_sub(self.base.as_ptr() as usize) < self.len
    }

    /// Byte offset of `ptr` from the base.  Caller guarantees
    /// [`contains`](Self::contains).
    #[inline]
    fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        debug_assert!(self.contains(ptr.as_ptr()));
        (ptr.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize)
    }

    /// Pointer at `offset` from the base.
    ///
    /// # Safety
    /// `offset` must be within the span.
    #[inline]
    unsafe fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.len);
        // Safety: offset is within the owned span.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    #[inline]
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }
}

pub(crate) struct Arena<P: AllocPolicy> {
    /// Block payload span.  Truncated to whole blocks, so the last block
    /// can never reach into the bitmaps carved from the region tail.
    blocks: Region,
    block_size: usize,
    /// log2(block_size), for O(1) pointer <-> index conversion.
    block_shift: u32,
    num_blocks: usize,
    /// Next never-yet-allocated byte offset.  Monotonic; reset only by
    /// destruction.
    bump: P::Counter,
    /// Monotonic allocation counter seeding the round-robin bitmap search
    /// start.  Not a live count.
    alloc_count: P::Counter,
    l2_words: usize,
    l1_bits: usize,
    l1_words: usize,
    l2: *mut u64,
    l1: *mut u64,
    _policy: PhantomData<P>,
}

// Safety: Arena owns its region; the raw bitmap pointers alias nothing
// outside it.
unsafe impl<P: AllocPolicy> Send for Arena<P> {}

// Safety: under the Shared policy every mutable field is accessed through
// atomic operations only.
unsafe impl Sync for Arena<crate::policy::Shared> {}

impl<P: AllocPolicy> Arena<P> {
    /// Reserve a 64MB region for `block_size`-byte blocks and carve the
    /// bitmaps from its tail.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the OS reservation fails.
    pub fn new(block_size: usize) -> Result<Box<Self>, VmError> {
        debug_assert!(
            block_size.is_power_of_two()
                && block_size >= crate::size_class::MIN_SIZE_CLASS
                && block_size <= crate::size_class::MAX_SIZE_CLASS,
            "invalid arena block size {block_size}",
        );

        // Safety: FFI call to reserve memory.
        let base = unsafe { PlatformVmOps::reserve(ARENA_SIZE)? };

        stats::TOTAL_RESERVED.fetch_add(ARENA_SIZE, Ordering::Relaxed);
        stats::ARENA_RESERVED.fetch_add(ARENA_SIZE, Ordering::Relaxed);
        stats::ARENA_COUNT.fetch_add(1, Ordering::Relaxed);

        let block_shift = block_size.trailing_zeros();
        let theoretical_blocks = ARENA_SIZE / block_size;
        let l2_words = theoretical_blocks.div_ceil(64);
        let l1_bits = l2_words.div_ceil(L2_WORDS_PER_L1_BIT);
        let l1_words = l1_bits.div_ceil(64);
        let bitmap_bytes = (l2_words + l1_words) * size_of::<u64>();

        let usable = ARENA_SIZE - bitmap_bytes;
        let num_blocks = usable >> block_shift;

        // Safety: usable < ARENA_SIZE and is 8-aligned (bitmap_bytes is a
        // multiple of 8, the base is page aligned).
        let l2 = unsafe { base.as_ptr().add(usable).cast::<u64>() };
        // Safety: the L1 words follow the L2 words inside the mapping.
        let l1 = unsafe { l2.add(l2_words) };
        // All bits clear: no freed blocks yet.
        // Safety: bitmap_bytes bytes starting at l2 are inside the mapping.
        unsafe { std::ptr::write_bytes(l2.cast::<u8>(), 0, bitmap_bytes) };

        Ok(Box::new(Self {
            blocks: Region::new(base, num_blocks << block_shift),
            block_size,
            block_shift,
            num_blocks,
            bump: CounterCell::new(0),
            alloc_count: CounterCell::new(0),
            l2_words,
            l1_bits,
            l1_words,
            l2,
            l1,
            _policy: PhantomData,
        }))
    }

    /// Allocate one block.
    ///
    /// Bump path first (the common case until the arena fills for the
    /// first time), then the bitmap path.  Returns `None` when no block is
    /// available anywhere — an ordinary value, so the owning pool can try
    /// its next arena.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        if let Some(offset) = self.bump.try_bump(self.blocks.len(), self.block_size) {
            // Safety: try_bump bounds the offset by the payload length.
            return Some(unsafe { self.blocks.at(offset) });
        }
        self.bitmap_allocate()
    }

    /// Mark a block free.
    ///
    /// Sets the L2 bit, then unconditionally sets the parent L1 summary
    /// bit.  L1 bits are only ever *cleared* by the allocation path's
    /// region rescans, so this cannot hide free blocks.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on
    /// this exact arena and must not have been freed already.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        debug_assert!(
            self.owns(ptr.as_ptr()),
            "pointer {ptr:p} does not belong to this arena",
        );
        let offset = self.blocks.offset_of(ptr);
        debug_assert!(
            offset.is_multiple_of(self.block_size),
            "pointer {ptr:p} is not aligned to block size {}",
            self.block_size
        );

        let block_index = offset >> self.block_shift;
        let l2_idx = block_index / 64;
        let bit = block_index % 64;

        // Safety: l2_idx < l2_words for any owned block.
        let _prev = unsafe { P::word_or(self.l2.add(l2_idx), 1u64 << bit) };
        debug_assert!(
            _prev & (1u64 << bit) == 0,
            "double free detected: block {block_index} was already free",
        );

        let l1_index = l2_idx / L2_WORDS_PER_L1_BIT;
        // Safety: l1_index / 64 < l1_words.
        unsafe { P::word_or(self.l1.add(l1_index / 64), 1u64 << (l1_index % 64)) };
    }

    /// Whether `ptr` falls inside this arena's block span, allocated or
    /// not.
    #[inline]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.blocks.contains(ptr)
    }

    /// True iff the bump cursor is exhausted and no L1 word advertises a
    /// free block.
    pub fn is_full(&self) -> bool {
        if self.bump.load() < self.blocks.len() {
            return false;
        }
        for i in 0..self.l1_words {
            // Safety: i < l1_words.
            if unsafe { P::word_load(self.l1.add(i)) } != 0 {
                return false;
            }
        }
        true
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Hierarchical bitmap search: pick a round-robin L1 starting bit from
    /// the allocation counter (spreading contending threads across the
    /// bitmap), scan L1 with one full wrap, and descend into the first
    /// advertised L2 region.
    fn bitmap_allocate(&self) -> Option<NonNull<u8>> {
        let counter = self.alloc_count.fetch_inc();
        let start_bit = counter % self.l1_bits;
        let start_word = start_bit / 64;
        let bit_offset = (start_bit % 64) as u32;

        // `l1_words` full visits, then one revisit of the start word
        // covering exactly the bits masked off the first time around.
        for i in 0..=self.l1_words {
            let idx = (start_word + i) % self.l1_words;
            // Safety: idx < l1_words.
            let mut l1_word = unsafe { P::word_load(self.l1.add(idx)) };
            if i == 0 {
                if bit_offset != 0 {
                    l1_word &= !0u64 << bit_offset;
                }
            } else if i == self.l1_words {
                if bit_offset == 0 {
                    break;
                }
                l1_word &= !(!0u64 << bit_offset);
            }

            if l1_word != 0 {
                let l1_bit = l1_word.trailing_zeros() as usize;
                let l1_index = idx * 64 + l1_bit;
                if let Some(ptr) = self.claim_from_region(l1_index) {
                    return Some(ptr);
                }
                // Stale summary bit: the region had nothing left by the
                // time we probed it.
            }
        }

        None
    }

    /// Walk one L1 bit's 64-word L2 region and claim the first free block.
    fn claim_from_region(&self, l1_index: usize) -> Option<NonNull<u8>> {
        let region_start = l1_index * L2_WORDS_PER_L1_BIT;

        for j in 0..L2_WORDS_PER_L1_BIT {
            let l2_idx = region_start + j;
            if l2_idx >= self.l2_words {
                break;
            }
            // Safety: l2_idx < l2_words.
            let word = unsafe { self.l2.add(l2_idx) };
            // Safety: word points into the bitmap span.
            let mut l2_word = unsafe { P::word_load(word) };
            while l2_word != 0 {
                let bit = l2_word.trailing_zeros() as usize;
                let block_index = l2_idx * 64 + bit;
                if block_index >= self.num_blocks {
                    break;
                }
                let new_word = l2_word & !(1u64 << bit);
                // Safety: word points into the bitmap span.
                if unsafe { P::word_try_exchange(word, &mut l2_word, new_word) } {
                    if new_word == 0 {
                        self.update_l1_for_region(l1_index);
                    }
                    let offset = block_index << self.block_shift;
                    #[cfg(debug_assertions)]
                    // Safety: the block was exclusively claimed by the
                    // exchange above.
                    unsafe {
                        std::ptr::write_bytes(self.blocks.at(offset).as_ptr(), 0, self.block_size);
                    }
                    // Safety: block_index < num_blocks.
                    return Some(unsafe { self.blocks.at(offset) });
                }
            }
        }
        None
    }

    /// Recompute one L1 summary bit by rescanning its L2 region.  The bit
    /// is never assumed — a concurrent free may have set words behind us.
    fn update_l1_for_region(&self, l1_index: usize) {
        let region_start = l1_index * L2_WORDS_PER_L1_BIT;

        let mut has_free = false;
        for i in 0..L2_WORDS_PER_L1_BIT {
            let l2_idx = region_start + i;
            if l2_idx >= self.l2_words {
                break;
            }
            // Safety: l2_idx < l2_words.
            if unsafe { P::word_load(self.l2.add(l2_idx)) } != 0 {
                has_free = true;
                break;
            }
        }

        let l1_word = l1_index / 64;
        let l1_bit = l1_index % 64;
        // Safety: l1_word < l1_words.
        unsafe {
            if has_free {
                P::word_or(self.l1.add(l1_word), 1u64 << l1_bit);
            } else {
                P::word_and(self.l1.add(l1_word), !(1u64 << l1_bit));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn num_blocks(&self) -> usize {
        self.num_blocks
    }
}

impl<P: AllocPolicy> Drop for Arena<P> {
    fn drop(&mut self) {
        // Safety: the region was reserved in `new` and released exactly
        // once, here.
        unsafe {
            drop(PlatformVmOps::release(self.blocks.base(), ARENA_SIZE));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, ARENA_SIZE);
        stats::sub_saturating(&stats::ARENA_RESERVED, ARENA_SIZE);
        stats::sub_saturating(&stats::ARENA_COUNT, 1);
    }
}
