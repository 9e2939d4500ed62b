//! Power-of-two size class table.
//!
//! Every pooled request is rounded up to one of [`NUM_SIZE_CLASSES`]
//! power-of-two byte sizes, [`MIN_SIZE_CLASS`] through [`MAX_SIZE_CLASS`].
//! Requests above the largest class bypass the pools entirely (the `0`
//! sentinel from [`round_to_size_class`]).

/// Smallest size class in bytes.
pub const MIN_SIZE_CLASS: usize = 8;

/// Largest size class in bytes (4MB).  Larger requests go straight to the
/// OS.
pub const MAX_SIZE_CLASS: usize = 4 * 1024 * 1024;

/// Number of size classes: 8, 16, 32, ..., 4MB.
pub const NUM_SIZE_CLASSES: usize = 20;

/// Round a request to the next power-of-two size class.
///
/// Returns [`MIN_SIZE_CLASS`] for anything at or below it, and `0` (the
/// "allocate directly from the OS" sentinel) for anything above
/// [`MAX_SIZE_CLASS`].
#[inline]
pub(crate) const fn round_to_size_class(size: usize) -> usize {
    if size <= MIN_SIZE_CLASS {
        return MIN_SIZE_CLASS;
    }
    if size > MAX_SIZE_CLASS {
        return 0;
    }
    size.next_power_of_two()
}

/// Convert a size class to its dense pool-array index, in
/// `[0, NUM_SIZE_CLASSES)`.
///
/// The caller guarantees `size_class` is a power of two produced by
/// [`round_to_size_class`].
#[inline]
pub(crate) const fn class_index(size_class: usize) -> usize {
    if size_class <= MIN_SIZE_CLASS {
        return 0;
    }
    (size_class.ilog2() - MIN_SIZE_CLASS.ilog2()) as usize
}

/// Size class for a pool-array index: `8 << index`.
#[inline]
pub(crate) const fn class_for_index(index: usize) -> usize {
    MIN_SIZE_CLASS << index
}
