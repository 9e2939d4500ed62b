//! Allocator front-end: one [`ArenaPool`] per size class, routed by the
//! rounding table, with per-policy pool storage.
//!
//! - [`Local`]: each OS thread owns a private registry of 20 pools,
//!   created the first time that thread allocates and dropped on thread
//!   exit.
//! - [`Shared`]: exactly one process-wide registry, behind a one-shot
//!   initialization primitive so a single caller performs the 20 pool
//!   constructions.
//!
//! Requests above the largest size class bypass the pools entirely and go
//! straight to the OS, released later with the original byte count.

use crate::policy::{AllocPolicy, Local, Shared};
use crate::pool::{ArenaPool, MAX_ARENAS_PER_CLASS};
use crate::size_class::{NUM_SIZE_CLASSES, class_for_index, class_index, round_to_size_class};
use crate::stats;
use crate::sync::OnceLock;
use crate::sync::atomic::Ordering;
use crate::vm::{PlatformVmOps, VmError, VmOps};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Largest element alignment the pooled paths guarantee (the minimum page
/// size across supported targets).  Element types with stricter alignment
/// are rejected at compile time.
pub const MAX_SUPPORTED_ALIGN: usize = 4096;

/// Terminal allocation failure, raised only at the front-end.
///
/// Exhaustion of a single arena or pool level is an ordinary value
/// internally; only here does it become an error.
#[derive(Debug)]
pub enum AllocationFailure {
    /// Every arena of the size class is full and no further arena may be
    /// created.
    Exhausted { size_class: usize },
    /// The OS refused to reserve backing memory.
    Vm(VmError),
    /// The requested byte size overflowed.
    SizeOverflow,
}

impl fmt::Display for AllocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationFailure::Exhausted { size_class } => write!(
                f,
                "size class {size_class}: all {MAX_ARENAS_PER_CLASS} arenas are full"
            ),
            AllocationFailure::Vm(e) => write!(f, "allocation failed: {e}"),
            AllocationFailure::SizeOverflow => write!(f, "allocation size overflows usize"),
        }
    }
}

impl std::error::Error for AllocationFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocationFailure::Vm(e) => Some(e),
            AllocationFailure::Exhausted { .. } | AllocationFailure::SizeOverflow => None,
        }
    }
}

impl From<VmError> for AllocationFailure {
    fn from(e: VmError) -> Self {
        AllocationFailure::Vm(e)
    }
}

/// One pool per size class, for one policy.
#[doc(hidden)]
pub struct ClassPools<P: AllocPolicy> {
    pools: [ArenaPool<P>; NUM_SIZE_CLASSES],
}

impl<P: AllocPolicy> ClassPools<P> {
    pub(crate) fn new() -> Self {
        Self {
            pools: std::array::from_fn(|i| ArenaPool::new(class_for_index(i))),
        }
    }

    pub(crate) fn pool(&self, index: usize) -> &ArenaPool<P> {
        &self.pools[index]
    }
}

thread_local! {
    /// This thread's private pool registry: constructed the first time the
    /// thread allocates under the `Local` policy, dropped (arenas released)
    /// on thread exit.
    static LOCAL_POOLS: ClassPools<Local> = ClassPools::new();
}

/// Process-wide pool registry for the `Shared` policy.  Initialized exactly
/// once; concurrent first callers wait for the winner's 20 pool
/// constructions to finish.
static SHARED_POOLS: OnceLock<ClassPools<Shared>> = OnceLock::new();

pub(crate) fn with_local_pools<R>(f: impl FnOnce(&ClassPools<Local>) -> R) -> R {
    LOCAL_POOLS.with(|pools| f(pools))
}

pub(crate) fn shared_pools() -> &'static ClassPools<Shared> {
    SHARED_POOLS.get_or_init(ClassPools::new)
}

/// Allocate `bytes` (already rounded to the element alignment) from the
/// policy's pools, or from the OS when no size class fits.
fn allocate_rounded<P: AllocPolicy>(bytes: usize) -> Result<*mut u8, AllocationFailure> {
    let size_class = round_to_size_class(bytes);

    if size_class == 0 {
        // Oversize: straight to the OS, bypassing pools and arenas.
        // Safety: FFI call to reserve memory.
        let ptr = unsafe { PlatformVmOps::reserve(bytes) }?;
        stats::TOTAL_RESERVED.fetch_add(bytes, Ordering::Relaxed);
        stats::OVERSIZE_RESERVED.fetch_add(bytes, Ordering::Relaxed);
        return Ok(ptr.as_ptr());
    }

    let index = class_index(size_class);
    match P::with_pools(|pools| pools.pool(index).allocate())? {
        Some(ptr) => Ok(ptr.as_ptr()),
        None => Err(AllocationFailure::Exhausted { size_class }),
    }
}

/// Return `bytes` (the same value passed to [`allocate_rounded`]) to the
/// policy's pools or the OS.
///
/// # Safety
/// `ptr`/`bytes` must pair an earlier `allocate_rounded` call, and the
/// pointer must not have been freed already.
unsafe fn deallocate_rounded<P: AllocPolicy>(ptr: NonNull<u8>, bytes: usize) {
    let size_class = round_to_size_class(bytes);

    if size_class == 0 {
        // Released with the original byte count, mirroring the reserve.
        // Safety: the ptr/bytes pair came from the oversize allocate path.
        unsafe {
            drop(PlatformVmOps::release(ptr, bytes));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, bytes);
        stats::sub_saturating(&stats::OVERSIZE_RESERVED, bytes);
        return;
    }

    let index = class_index(size_class);
    // Safety: pairing upheld by the caller.
    P::with_pools(|pools| unsafe { pools.pool(index).deallocate(ptr) });
}

/// Size-classed allocator for `T` elements under policy `P`.
///
/// Stateless: every instance of the same type routes to the same pool
/// storage, so instances are freely copyable, always equal, and survive
/// container moves.  Rebind to another element type with
/// [`rebind`](Self::rebind).
pub struct ClassedAllocator<T, P: AllocPolicy = Local> {
    _marker: PhantomData<fn(T) -> T>,
    _policy: PhantomData<P>,
}

/// Thread-private allocator: no synchronization, pools live in
/// thread-local storage.
pub type LocalAllocator<T> = ClassedAllocator<T, Local>;

/// Process-shared allocator: lock-free pools shared by all threads.
pub type SharedAllocator<T> = ClassedAllocator<T, Shared>;

impl<T, P: AllocPolicy> ClassedAllocator<T, P> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
            _policy: PhantomData,
        }
    }

    /// Allocate room for `count` elements.
    ///
    /// Returns a null pointer for `count == 0` without allocating.  The
    /// returned block is aligned for `T` and sized to the request's size
    /// class (or to the exact byte count on the oversize path).
    ///
    /// # Errors
    ///
    /// [`AllocationFailure`] when the size computation overflows, the OS
    /// reservation fails, or all 16 arenas of the size class are full.
    pub fn allocate(&self, count: usize) -> Result<*mut T, AllocationFailure> {
        const {
            assert!(
                align_of::<T>() <= MAX_SUPPORTED_ALIGN,
                "element alignment exceeds MAX_SUPPORTED_ALIGN",
            );
        }
        if count == 0 {
            return Ok(std::ptr::null_mut());
        }
        let bytes = Self::byte_size(count).ok_or(AllocationFailure::SizeOverflow)?;
        allocate_rounded::<P>(bytes).map(|ptr| ptr.cast())
    }

    /// Free `count` elements previously obtained from
    /// [`allocate`](Self::allocate).  Null or zero-count is a no-op.
    ///
    /// # Safety
    /// - `ptr` must have come from `allocate(count)` on an allocator of
    ///   this exact type (any instance — they share storage), on this
    ///   thread for the `Local` policy.
    /// - `count` must match the allocating call.
    /// - `ptr` must not have been freed already.
    pub unsafe fn deallocate(&self, ptr: *mut T, count: usize) {
        if ptr.is_null() || count == 0 {
            return;
        }
        let Some(bytes) = Self::byte_size(count) else {
            debug_assert!(false, "deallocate size computation overflowed");
            return;
        };
        // Safety: NonNull checked above; pairing upheld by caller.
        unsafe { deallocate_rounded::<P>(NonNull::new_unchecked(ptr.cast()), bytes) };
    }

    /// The same allocator viewed at another element type.
    #[must_use]
    pub const fn rebind<U>(&self) -> ClassedAllocator<U, P> {
        ClassedAllocator::new()
    }

    /// Request size in bytes: `count * size_of::<T>()`, rounded up to the
    /// element alignment (zero-sized element types still consume one
    /// aligned slot so the returned pointer is aligned for `T`).
    fn byte_size(count: usize) -> Option<usize> {
        count
            .checked_mul(size_of::<T>())?
            .max(1)
            .checked_next_multiple_of(align_of::<T>())
    }
}

impl<T, P: AllocPolicy> Default for ClassedAllocator<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P: AllocPolicy> Clone for ClassedAllocator<T, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, P: AllocPolicy> Copy for ClassedAllocator<T, P> {}

impl<T, P: AllocPolicy> PartialEq for ClassedAllocator<T, P> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T, P: AllocPolicy> Eq for ClassedAllocator<T, P> {}

impl<T, P: AllocPolicy> fmt::Debug for ClassedAllocator<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClassedAllocator")
    }
}

/// [`GlobalAlloc`](std::alloc::GlobalAlloc) adapter over the shared-policy
/// pools, suitable for `#[global_allocator]`.  Failures surface as null,
/// per the `GlobalAlloc` contract.
pub struct GlobalClassedAlloc;

// Safety: blocks handed out by the pools are disjoint, and the effective
// size class is always a multiple of the layout's alignment (the size is
// rounded up to it first), so returned pointers satisfy the layout.
unsafe impl std::alloc::GlobalAlloc for GlobalClassedAlloc {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        if layout.align() > MAX_SUPPORTED_ALIGN {
            return std::ptr::null_mut();
        }
        let Some(bytes) = layout.size().max(1).checked_next_multiple_of(layout.align()) else {
            return std::ptr::null_mut();
        };
        match allocate_rounded::<Shared>(bytes) {
            Ok(ptr) => ptr,
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: std::alloc::Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let Some(bytes) = layout.size().max(1).checked_next_multiple_of(layout.align()) else {
            debug_assert!(false, "dealloc layout does not match any allocation");
            return;
        };
        // Safety: ptr/layout pairing is the caller's GlobalAlloc contract.
        unsafe { deallocate_rounded::<Shared>(ptr, bytes) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::size_class::MAX_SIZE_CLASS;

    #[test]
    fn test_allocator_basic() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let alloc = LocalAllocator::<i32>::new();
        let ptr = alloc.allocate(10).expect("allocate failed");
        assert!(!ptr.is_null());

        // Safety: Test code.
        unsafe {
            for i in 0..10 {
                ptr.add(i).write(i as i32);
            }
            for i in 0..10 {
                assert_eq!(ptr.add(i).read(), i as i32);
            }
            alloc.deallocate(ptr, 10);
        }
    }

    #[test]
    fn test_zero_allocation() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let alloc = LocalAllocator::<i32>::new();
        let ptr = alloc.allocate(0).expect("zero alloc must not fail");
        assert!(ptr.is_null());
        // Safety: Test code; null/zero is a no-op.
        unsafe { alloc.deallocate(ptr, 0) };
        // Safety: Test code; null with nonzero count is also a no-op.
        unsafe { alloc.deallocate(std::ptr::null_mut(), 4) };
    }

    #[test]
    fn test_single_element_allocation() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let alloc = LocalAllocator::<u64>::new();
        let ptr = alloc.allocate(1).unwrap();
        // Safety: Test code.
        unsafe {
            ptr.write(42);
            assert_eq!(ptr.read(), 42);
            alloc.deallocate(ptr, 1);
        }
    }

    #[test]
    fn test_ten_ints_land_in_class_64() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        // 10 * 4 = 40 bytes rounds to the 64-byte class; class-64 blocks
        // are 64-byte aligned.
        let alloc = LocalAllocator::<i32>::new();
        let ptr = alloc.allocate(10).unwrap();
        assert_eq!(ptr as usize % 64, 0);

        // Freeing makes the block reusable; an immediate identical request
        // must succeed without error.
        // Safety: Test code.
        unsafe { alloc.deallocate(ptr, 10) };
        let again = alloc.allocate(10).unwrap();
        assert!(!again.is_null());
        // Safety: Test code.
        unsafe { alloc.deallocate(again, 10) };
    }

    #[test]
    fn test_non_power_of_two_sizes() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let alloc = LocalAllocator::<u8>::new();
        let sizes = [7usize, 15, 33, 65, 129, 257, 513, 1025];
        let mut ptrs = Vec::new();

        for &size in &sizes {
            let ptr = alloc.allocate(size).unwrap();
            // Safety: Test code.
            unsafe { std::ptr::write_bytes(ptr, 0xCD, size) };
            ptrs.push(ptr);
        }

        for (&size, &ptr) in sizes.iter().zip(&ptrs) {
            // Safety: Test code.
            unsafe {
                let slice = std::slice::from_raw_parts(ptr, size);
                assert!(slice.iter().all(|&b| b == 0xCD));
                alloc.deallocate(ptr, size);
            }
        }
    }

    #[test]
    fn test_large_allocation_bypasses_pools() {
        let _guard = crate::TEST_MUTEX.write().unwrap();
        // More than the largest size class: served by the OS directly and
        // independently freeable.
        let count = (5 * 1024 * 1024) / size_of::<i32>();
        let alloc = LocalAllocator::<i32>::new();

        let oversize_before = stats::OVERSIZE_RESERVED.get();

        let ptr = alloc.allocate(count).unwrap();
        assert!(stats::OVERSIZE_RESERVED.get() > oversize_before);

        // Safety: Test code.
        unsafe {
            ptr.write(1);
            ptr.add(count - 1).write(2);
            assert_eq!(ptr.read(), 1);
            assert_eq!(ptr.add(count - 1).read(), 2);
            alloc.deallocate(ptr, count);
        }
        assert_eq!(stats::OVERSIZE_RESERVED.get(), oversize_before);
    }

    #[test]
    fn test_overaligned_type() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        #[repr(align(64))]
        struct Overaligned {
            _data: [u8; 64],
        }

        let alloc = LocalAllocator::<Overaligned>::new();
        for _ in 0..10 {
            let ptr = alloc.allocate(1).unwrap();
            assert_eq!(
                ptr as usize % 64,
                0,
                "overaligned allocation not properly aligned"
            );
            // Safety: Test code.
            unsafe { alloc.deallocate(ptr, 1) };
        }
    }

    #[test]
    fn test_zero_sized_element_type() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let alloc = LocalAllocator::<()>::new();
        let ptr = alloc.allocate(8).unwrap();
        assert!(!ptr.is_null());
        // Safety: Test code.
        unsafe { alloc.deallocate(ptr, 8) };
    }

    #[test]
    fn test_rebind_and_equality() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let ints = LocalAllocator::<u32>::new();
        let bytes = ints.rebind::<u8>();

        let ptr = bytes.allocate(100).unwrap();
        // Safety: Test code; any same-typed instance may free it.
        unsafe { LocalAllocator::<u8>::new().deallocate(ptr, 100) };

        assert_eq!(ints, LocalAllocator::<u32>::new());
        assert_eq!(ints, ints);
    }

    #[test]
    fn test_size_overflow() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let alloc = LocalAllocator::<u64>::new();
        let result = alloc.allocate(usize::MAX / 2);
        assert!(matches!(result, Err(AllocationFailure::SizeOverflow)));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // 16 mock arenas = 1GB of interpreter-tracked heap
    fn test_exhaustion_reports_allocation_failure() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        // Run in a scratch thread so its Local pools (16 arenas of the
        // largest class) die with it.
        std::thread::spawn(|| {
            let alloc = LocalAllocator::<u8>::new();
            // 15 blocks of 4MB per arena, 16 arenas.
            let capacity = 16 * 15;
            for i in 0..capacity {
                alloc
                    .allocate(MAX_SIZE_CLASS)
                    .unwrap_or_else(|e| panic!("allocation {i} failed below capacity: {e}"));
            }

            let failure = alloc.allocate(MAX_SIZE_CLASS);
            assert!(
                matches!(
                    failure,
                    Err(AllocationFailure::Exhausted { size_class }) if size_class == MAX_SIZE_CLASS
                ),
                "expected exhaustion, got {failure:?}"
            );
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_thread_exit_releases_local_pools() {
        let _guard = crate::TEST_MUTEX.write().unwrap();
        let arenas_before = stats::ARENA_COUNT.get();

        std::thread::spawn(|| {
            let alloc = LocalAllocator::<u8>::new();
            let ptr = alloc.allocate(64).unwrap();
            assert!(stats::ARENA_COUNT.get() > 0);
            // Leak the block on purpose: thread teardown must still release
            // the arena.
            let _ = ptr;
        })
        .join()
        .unwrap();

        assert_eq!(
            stats::ARENA_COUNT.get(),
            arenas_before,
            "thread-local arenas must be released on thread exit"
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)] // thousands of cross-thread allocations; too slow under the interpreter
    fn test_shared_policy_concurrent_allocation() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let num_threads = 8usize;
        let allocs_per_thread = 500usize;

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                std::thread::spawn(move || {
                    let alloc = SharedAllocator::<i32>::new();
                    let mut ptrs = Vec::with_capacity(allocs_per_thread);
                    for i in 0..allocs_per_thread {
                        let ptr = alloc.allocate(10).expect("shared alloc failed");
                        // Safety: Test code; 10-int block just allocated.
                        unsafe {
                            for j in 0..10 {
                                ptr.add(j).write((t * 10000 + i * 10 + j) as i32);
                            }
                        }
                        ptrs.push(ptr as usize);
                    }
                    (t, ptrs)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let alloc = SharedAllocator::<i32>::new();
        for (t, ptrs) in results {
            for (i, &addr) in ptrs.iter().enumerate() {
                let ptr = addr as *mut i32;
                // Safety: Test code; blocks are live until freed below.
                unsafe {
                    for j in 0..10 {
                        assert_eq!(
                            ptr.add(j).read(),
                            (t * 10000 + i * 10 + j) as i32,
                            "overlapping shared allocations"
                        );
                    }
                    alloc.deallocate(ptr, 10);
                }
            }
        }
    }

    #[test]
    fn test_global_alloc_adapter() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let layout = std::alloc::Layout::from_size_align(96, 16).unwrap();
        // Safety: Test code; layout is valid.
        unsafe {
            let ptr = std::alloc::GlobalAlloc::alloc(&GlobalClassedAlloc, layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 16, 0);
            std::ptr::write_bytes(ptr, 0x5A, 96);
            assert_eq!(*ptr.add(95), 0x5A);
            std::alloc::GlobalAlloc::dealloc(&GlobalClassedAlloc, ptr, layout);
        }
    }

    #[test]
    fn test_global_alloc_rejects_huge_alignment() {
        let _guard = crate::TEST_MUTEX.read().unwrap();
        let layout = std::alloc::Layout::from_size_align(64, 8192).unwrap();
        // Safety: Test code.
        let ptr = unsafe { std::alloc::GlobalAlloc::alloc(&GlobalClassedAlloc, layout) };
        assert!(ptr.is_null());
    }

    #[test]
    fn test_allocation_failure_display() {
        let exhausted = AllocationFailure::Exhausted { size_class: 64 };
        assert_eq!(
            exhausted.to_string(),
            "size class 64: all 16 arenas are full"
        );
        assert_eq!(
            AllocationFailure::SizeOverflow.to_string(),
            "allocation size overflows usize"
        );
    }
}
