use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

/// Source of the single contiguous memory block that a [`SlotPool`][crate::SlotPool]
/// subdivides into slots.
///
/// The contract has exactly two operations. There is deliberately no resize: a pool that
/// runs out of slots reports exhaustion and the caller creates another pool.
///
/// Any type honoring this contract can be plugged into a pool via
/// [`SlotPoolBuilder::backing()`][crate::SlotPoolBuilder::backing].
pub trait BackingAllocator: Send + Sync + 'static {
    /// Acquires a block of memory matching `layout`.
    ///
    /// The contents of the returned block are unspecified.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot provide a block of the requested size.
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, BackingError>;

    /// Returns a block previously obtained from [`acquire()`][Self::acquire].
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `acquire()` on this same allocator with the same
    /// `layout`, and must not have been released already. No access to the block may happen
    /// after this call.
    unsafe fn release(&self, block: NonNull<u8>, layout: Layout);
}

/// A backing allocator could not provide a block.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum BackingError {
    /// The backend has no memory left for a block of the requested size.
    #[error("backing allocator could not provide a block of {size} bytes")]
    OutOfMemory {
        /// The requested block size in bytes.
        size: usize,
    },

    /// The backend cannot satisfy the alignment of the requested block.
    #[error("backing allocator cannot provide a block aligned to {align} bytes")]
    UnsupportedAlignment {
        /// The requested block alignment in bytes.
        align: usize,
    },
}

/// Backs pools with memory from the global Rust allocator.
///
/// This is the default backing allocator of [`SlotPool`][crate::SlotPool].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBacking;

impl BackingAllocator for SystemBacking {
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, BackingError> {
        assert!(
            layout.size() > 0,
            "SystemBacking cannot acquire a zero-sized block"
        );

        // SAFETY: The layout has a non-zero size, as asserted above.
        let block = unsafe { alloc(layout) };

        NonNull::new(block).ok_or(BackingError::OutOfMemory {
            size: layout.size(),
        })
    }

    unsafe fn release(&self, block: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding the guarantees of the caller, who promises that the block came
        // from acquire() with this same layout, which allocated it from the global allocator.
        unsafe {
            dealloc(block.as_ptr(), layout);
        }
    }
}

/// The strictest alignment an [`ArenaBacking`] can hand out.
const ARENA_ALIGN: usize = 64;

/// Backs pools with blocks carved out of one region reserved up front.
///
/// Blocks are handed out by bumping an offset through the region. Releasing a block does not
/// make its memory available again; the whole region is returned to the global allocator when
/// the arena is dropped. This suits a set of pools that are created together and torn down
/// together.
///
/// Multiple pools can share one arena by wrapping it in an [`Arc`], which also implements
/// [`BackingAllocator`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use slot_pool::{ArenaBacking, SlotPool};
///
/// let arena = Arc::new(ArenaBacking::with_capacity(4096));
///
/// let pool = SlotPool::builder()
///     .label("widgets")
///     .element_size(64)
///     .capacity(16)
///     .backing(Arc::clone(&arena))
///     .build();
///
/// let slot = pool.allocate().unwrap().unwrap();
/// assert!(pool.owns(slot.as_ptr()));
/// assert_eq!(arena.used_bytes(), 1024);
/// ```
#[derive(Debug)]
pub struct ArenaBacking {
    region: NonNull<u8>,
    region_layout: Layout,

    /// Offset of the first byte not yet handed out.
    used: AtomicUsize,
}

impl ArenaBacking {
    /// Reserves a region of `capacity_bytes` bytes from the global allocator.
    ///
    /// # Panics
    ///
    /// Panics if `capacity_bytes` is zero or if the region cannot be reserved.
    #[must_use]
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        assert!(capacity_bytes > 0, "ArenaBacking must have non-zero capacity");

        let region_layout = Layout::from_size_align(capacity_bytes, ARENA_ALIGN)
            .expect("arena capacity must not overflow isize when rounded to the arena alignment");

        // SAFETY: The layout has a non-zero size, as asserted above.
        let region = NonNull::new(unsafe { alloc(region_layout) })
            .expect("we do not intend to handle allocation failure as a real possibility - OOM results in panic");

        Self {
            region,
            region_layout,
            used: AtomicUsize::new(0),
        }
    }

    /// Total size of the reserved region in bytes.
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.region_layout.size()
    }

    /// Number of bytes handed out so far, including alignment padding.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl BackingAllocator for ArenaBacking {
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, BackingError> {
        if layout.align() > ARENA_ALIGN {
            return Err(BackingError::UnsupportedAlignment {
                align: layout.align(),
            });
        }

        let region_size = self.region_layout.size();

        // The region start is aligned to ARENA_ALIGN, so aligning the offset is enough.
        let bounds = |used: usize| {
            let start = used.checked_next_multiple_of(layout.align())?;
            let end = start.checked_add(layout.size())?;

            (end <= region_size).then_some((start, end))
        };

        // Relaxed is enough because the offset does not guard any other memory.
        let previous = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                bounds(used).map(|(_, end)| end)
            })
            .map_err(|_| BackingError::OutOfMemory {
                size: layout.size(),
            })?;

        let (start, _) = bounds(previous)
            .expect("bounds were valid for this offset when the offset was advanced");

        // SAFETY: `start` is within the region because `start <= end <= region size`.
        Ok(unsafe { self.region.add(start) })
    }

    unsafe fn release(&self, _block: NonNull<u8>, _layout: Layout) {
        // Blocks are reclaimed all at once when the arena is dropped.
    }
}

impl Drop for ArenaBacking {
    fn drop(&mut self) {
        // SAFETY: The region was allocated in with_capacity() with this exact layout and is
        // deallocated only here.
        unsafe {
            dealloc(self.region.as_ptr(), self.region_layout);
        }
    }
}

// SAFETY: The region pointer is owned exclusively by the arena and the only mutable
// bookkeeping about it is atomic. The arena never touches the memory it hands out.
unsafe impl Send for ArenaBacking {}

// SAFETY: See Send above; shared access only reads the immutable region pointer and layout
// or goes through the atomic offset.
unsafe impl Sync for ArenaBacking {}

impl<B> BackingAllocator for Arc<B>
where
    B: BackingAllocator,
{
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, BackingError> {
        B::acquire(self, layout)
    }

    unsafe fn release(&self, block: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding the guarantees of the caller.
        unsafe {
            B::release(self, block, layout);
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SystemBacking: Send, Sync, Debug, BackingAllocator);
    assert_impl_all!(ArenaBacking: Send, Sync, Debug, BackingAllocator);
    assert_impl_all!(Arc<ArenaBacking>: BackingAllocator);

    #[test]
    fn system_backing_round_trip() {
        let layout = Layout::from_size_align(256, 16).unwrap();
        let block = SystemBacking.acquire(layout).unwrap();

        assert_eq!(block.as_ptr().addr() % 16, 0);

        unsafe {
            block.as_ptr().write_bytes(0xAB, 256);
            assert_eq!(block.as_ptr().add(255).read(), 0xAB);

            SystemBacking.release(block, layout);
        }
    }

    #[test]
    #[should_panic]
    fn system_backing_zero_size_panics() {
        let layout = Layout::from_size_align(0, 1).unwrap();
        _ = SystemBacking.acquire(layout);
    }

    #[test]
    fn arena_hands_out_disjoint_aligned_blocks() {
        let arena = ArenaBacking::with_capacity(1024);

        let a = arena
            .acquire(Layout::from_size_align(10, 1).unwrap())
            .unwrap();
        let b = arena
            .acquire(Layout::from_size_align(32, 16).unwrap())
            .unwrap();

        assert_eq!(b.as_ptr().addr() % 16, 0);
        assert!(b.as_ptr().addr() >= a.as_ptr().addr() + 10);

        // 10 bytes, padded to 16, then 32 more.
        assert_eq!(arena.used_bytes(), 48);
        assert_eq!(arena.capacity_bytes(), 1024);
    }

    #[test]
    fn arena_reports_out_of_memory() {
        let arena = ArenaBacking::with_capacity(100);

        let result = arena.acquire(Layout::from_size_align(101, 1).unwrap());
        assert_eq!(result, Err(BackingError::OutOfMemory { size: 101 }));

        // A failed acquisition does not consume anything.
        assert_eq!(arena.used_bytes(), 0);

        let block = arena.acquire(Layout::from_size_align(100, 1).unwrap());
        assert!(block.is_ok());
    }

    #[test]
    fn arena_rejects_excessive_alignment() {
        let arena = ArenaBacking::with_capacity(4096);

        let result = arena.acquire(Layout::from_size_align(8, 128).unwrap());
        assert_eq!(result, Err(BackingError::UnsupportedAlignment { align: 128 }));
    }

    #[test]
    fn arena_release_does_not_reclaim() {
        let arena = ArenaBacking::with_capacity(64);
        let layout = Layout::from_size_align(64, 8).unwrap();

        let block = arena.acquire(layout).unwrap();
        unsafe {
            arena.release(block, layout);
        }

        assert_eq!(arena.used_bytes(), 64);
        assert!(arena.acquire(layout).is_err());
    }

    #[test]
    fn shared_arena_serves_through_arc() {
        let arena = Arc::new(ArenaBacking::with_capacity(128));
        let shared = Arc::clone(&arena);

        let layout = Layout::from_size_align(64, 8).unwrap();
        _ = shared.acquire(layout).unwrap();

        assert_eq!(arena.used_bytes(), 64);
    }

    #[test]
    #[should_panic]
    fn arena_zero_capacity_panics() {
        drop(ArenaBacking::with_capacity(0));
    }
}
