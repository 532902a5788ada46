use std::alloc::Layout;
use std::mem;
use std::num::NonZero;
use std::ptr::NonNull;

use crate::{BackingAllocator, BackingError, IntegrityChecking, Violation};

/// Width of the free-list link stored at the start of every free slot.
pub(crate) const LINK_SIZE: usize = mem::size_of::<usize>();

/// Link value terminating the free list.
const END_OF_FREE_LIST: usize = usize::MAX;

/// The strictest alignment the backing block is requested with. Slots are aligned to the
/// largest power of two dividing the element size, up to this limit.
pub(crate) const MAX_BLOCK_ALIGN: usize = 64;

/// A fixed number of fixed-size slots carved out of one lazily acquired block of memory.
///
/// This type holds no lock; [`SlotPool`][crate::SlotPool] serializes all access to it.
///
/// # Allocation strategy
///
/// Slots that have never been handed out lie beyond the bump cursor and are handed out by
/// advancing it. Released slots form an intrusive stack (the free list) whose links are
/// stored in the first [`LINK_SIZE`] bytes of each free slot. Single-slot allocations pop the
/// free list first and only fall back to the bump cursor when it is empty.
///
/// # Out of band access
///
/// The type never creates references to slot memory, so callers may access live slots through
/// the pointers they were handed without holding any lock.
#[derive(Debug)]
pub(crate) struct SlotBlock {
    element_size: NonZero<usize>,
    capacity: NonZero<usize>,

    /// Layout of the whole backing block, as requested from the backing allocator.
    block_layout: Layout,

    integrity: IntegrityChecking,

    /// Start of the backing block. `None` until first use and again after teardown.
    block: Option<NonNull<u8>>,

    torn_down: bool,

    /// Index of the most recently released slot, which is the next one to be reused.
    free_head: Option<usize>,

    /// Index of the first slot that has never been handed out.
    bump_cursor: usize,

    /// Number of slots not currently handed out, whether on the free list or never touched.
    free_count: usize,

    /// Which slots are on the free list. Only tracked with integrity checking enabled, empty
    /// otherwise.
    released: Vec<bool>,

    total_allocations: u64,
    total_frees: u64,
}

/// Why a [`SlotBlock`] operation could not be carried out.
#[derive(Debug)]
pub(crate) enum Fault {
    Backing(BackingError),
    Violation(Violation),
}

impl From<BackingError> for Fault {
    fn from(value: BackingError) -> Self {
        Self::Backing(value)
    }
}

impl From<Violation> for Fault {
    fn from(value: Violation) -> Self {
        Self::Violation(value)
    }
}

/// What a teardown did, for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TeardownSummary {
    pub(crate) live_count: usize,
    pub(crate) total_allocations: u64,
    pub(crate) total_frees: u64,

    /// Whether a backing block was held and has now been released.
    pub(crate) released_block: bool,
}

impl SlotBlock {
    /// # Panics
    ///
    /// Panics if the element size cannot hold a free-list link or if the total block size
    /// overflows.
    #[must_use]
    pub(crate) fn new(
        element_size: NonZero<usize>,
        capacity: NonZero<usize>,
        integrity: IntegrityChecking,
    ) -> Self {
        Self {
            element_size,
            capacity,
            block_layout: block_layout(element_size, capacity),
            integrity,
            block: None,
            torn_down: false,
            free_head: None,
            bump_cursor: 0,
            free_count: capacity.get(),
            released: Vec::new(),
            total_allocations: 0,
            total_frees: 0,
        }
    }

    #[must_use]
    pub(crate) fn block(&self) -> Option<NonNull<u8>> {
        self.block
    }

    #[must_use]
    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    #[must_use]
    pub(crate) fn free_count(&self) -> usize {
        self.free_count
    }

    #[must_use]
    pub(crate) fn live_count(&self) -> usize {
        // Cannot underflow because free_count never exceeds capacity.
        self.capacity.get().wrapping_sub(self.free_count)
    }

    #[must_use]
    pub(crate) fn bump_cursor(&self) -> usize {
        self.bump_cursor
    }

    #[must_use]
    pub(crate) fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    #[must_use]
    pub(crate) fn total_frees(&self) -> u64 {
        self.total_frees
    }

    /// Acquires the backing block if this has not happened yet.
    ///
    /// Returns `true` if this call acquired the block.
    pub(crate) fn ensure_block<B>(&mut self, backing: &B) -> Result<bool, Fault>
    where
        B: BackingAllocator,
    {
        if self.torn_down {
            return Err(Violation::UseAfterTeardown.into());
        }

        if self.block.is_some() {
            return Ok(false);
        }

        let block = backing.acquire(self.block_layout)?;

        // SAFETY: The backing allocator just handed us exclusive access to a block of this size.
        unsafe {
            self.integrity
                .stamp_untouched(block, self.block_layout.size());
        }

        if self.integrity.is_enabled() {
            self.released = vec![false; self.capacity.get()];
        }

        self.block = Some(block);
        Ok(true)
    }

    /// Hands out `count` contiguous slots, returning a pointer to the first one or `None` if
    /// not enough slots are available.
    ///
    /// A single slot is taken from the free list if possible. Multiple slots are only ever
    /// taken from never-touched capacity, all of them or none.
    ///
    /// # Panics
    ///
    /// Panics if the backing block has not been acquired via [`ensure_block()`][Self::ensure_block].
    pub(crate) fn allocate(
        &mut self,
        count: NonZero<usize>,
    ) -> Result<Option<NonNull<u8>>, Violation> {
        if self.torn_down {
            return Err(Violation::UseAfterTeardown);
        }

        let block = self
            .block
            .expect("backing block must be acquired before allocating from it");

        if count.get() == 1 {
            if let Some(index) = self.free_head {
                return self.reuse_free_slot(block, index).map(Some);
            }
        }

        let Some(end) = self.bump_cursor.checked_add(count.get()) else {
            return Ok(None);
        };

        if end > self.capacity.get() {
            return Ok(None);
        }

        let index = self.bump_cursor;
        self.bump_cursor = end;

        self.record_allocation(count.get());

        Ok(Some(self.slot_ptr(block, index)))
    }

    fn reuse_free_slot(
        &mut self,
        block: NonNull<u8>,
        index: usize,
    ) -> Result<NonNull<u8>, Violation> {
        let slot = self.slot_ptr(block, index);
        let (payload, payload_len) = self.payload(slot);

        // SAFETY: The slot is on the free list, so nobody else is entitled to access it and the
        // payload lies within the slot, which lies within our block.
        let intact = unsafe {
            self.integrity
                .is_freed_stamp_intact(payload, payload_len)
        };

        if !intact {
            return Err(Violation::WriteAfterFree { index });
        }

        // SAFETY: Every slot on the free list carries a link at its start, written by
        // release(). The link may be unaligned if the element size is not a multiple of the
        // link alignment.
        let next = unsafe { slot.cast::<usize>().read_unaligned() };

        // A write into the link of a released slot must not send us to a slot that is out of
        // bounds, live or the slot itself.
        if !self.is_plausible_link(index, next) {
            return Err(Violation::WriteAfterFree { index });
        }

        self.free_head = (next != END_OF_FREE_LIST).then_some(next);
        self.set_released(index, false);

        // SAFETY: The slot is ours until we return it to the caller.
        unsafe {
            self.integrity
                .stamp_untouched(slot, self.element_size.get());
        }

        self.record_allocation(1);

        Ok(slot)
    }

    fn is_plausible_link(&self, index: usize, next: usize) -> bool {
        if next == END_OF_FREE_LIST {
            return true;
        }

        if next >= self.bump_cursor || next == index {
            return false;
        }

        // Without integrity checking we do not know which slots are free, only which ones
        // have been touched.
        !self.integrity.is_enabled() || self.is_released(next)
    }

    fn is_released(&self, index: usize) -> bool {
        self.released.get(index).copied().unwrap_or(false)
    }

    fn set_released(&mut self, index: usize, released: bool) {
        if let Some(flag) = self.released.get_mut(index) {
            *flag = released;
        }
    }

    fn record_allocation(&mut self, count: usize) {
        // Cannot underflow because callers only hand out slots that were counted as free.
        self.free_count = self.free_count.wrapping_sub(count);

        // Cannot overflow in any realistic program lifetime.
        self.total_allocations = self
            .total_allocations
            .wrapping_add(count as u64);
    }

    /// Takes back `count` contiguous slots starting at `ptr`, pushing each onto the free list.
    ///
    /// Every slot is validated before any of them is released, so a violation leaves the block
    /// unchanged.
    pub(crate) fn release(
        &mut self,
        ptr: NonNull<u8>,
        count: NonZero<usize>,
    ) -> Result<(), Violation> {
        let (block, first) = self.validate_release(ptr, count)?;

        for index in first..first.wrapping_add(count.get()) {
            let slot = self.slot_ptr(block, index);
            let (payload, payload_len) = self.payload(slot);

            let next = self.free_head.unwrap_or(END_OF_FREE_LIST);

            // SAFETY: The caller handed the slot back to us, so we have exclusive access to it.
            // The link is written unaligned because slots are only aligned to the largest
            // power of two that divides the element size.
            unsafe {
                slot.cast::<usize>().write_unaligned(next);
                self.integrity.stamp_freed(payload, payload_len);
            }

            self.free_head = Some(index);
            self.set_released(index, true);
        }

        // Cannot overflow, validated above.
        self.free_count = self.free_count.wrapping_add(count.get());
        self.total_frees = self.total_frees.wrapping_add(count.get() as u64);

        Ok(())
    }

    fn validate_release(
        &self,
        ptr: NonNull<u8>,
        count: NonZero<usize>,
    ) -> Result<(NonNull<u8>, usize), Violation> {
        if self.torn_down {
            return Err(Violation::UseAfterTeardown);
        }

        let foreign = Violation::ForeignPointer {
            address: ptr.as_ptr().addr(),
        };

        let block = self.block.ok_or(foreign)?;
        let first = self.index_of(ptr.as_ptr()).ok_or(foreign)?;

        let end = first
            .checked_add(count.get())
            .filter(|end| *end <= self.capacity.get())
            .ok_or(foreign)?;

        for index in first..end {
            if index >= self.bump_cursor {
                return Err(Violation::NeverAllocated { index });
            }

            if self.is_released(index) {
                return Err(Violation::DoubleRelease { index });
            }
        }

        // Without integrity checking this is the only double release detection there is.
        if self.live_count() < count.get() {
            return Err(Violation::DoubleRelease { index: first });
        }

        Ok((block, first))
    }

    /// Returns the index of the slot that starts at `ptr`, or `None` if `ptr` is not the start
    /// of a slot in the backing block.
    #[must_use]
    pub(crate) fn index_of(&self, ptr: *const u8) -> Option<usize> {
        let block = self.block?;

        let offset = ptr.addr().checked_sub(block.as_ptr().addr())?;

        // Element size is non-zero, so neither of these can panic.
        let index = offset.checked_div(self.element_size.get())?;
        let remainder = offset.checked_rem(self.element_size.get())?;

        (remainder == 0 && index < self.capacity.get()).then_some(index)
    }

    /// Resolves `ptr` to a slot index for an identifier lookup.
    pub(crate) fn lookup_index(&self, ptr: NonNull<u8>) -> Result<usize, Violation> {
        if self.torn_down {
            return Err(Violation::UseAfterTeardown);
        }

        self.index_of(ptr.as_ptr())
            .ok_or(Violation::ForeignPointer {
                address: ptr.as_ptr().addr(),
            })
    }

    /// Releases the backing block. Only the first call has any effect.
    pub(crate) fn teardown<B>(&mut self, backing: &B) -> Option<TeardownSummary>
    where
        B: BackingAllocator,
    {
        if self.torn_down {
            return None;
        }

        self.torn_down = true;
        self.free_head = None;

        let block = self.block.take();

        if let Some(block) = block {
            // SAFETY: The block came from this backing allocator with this layout (the pool
            // never changes its backing allocator) and we just forgot the only pointer to it.
            unsafe {
                backing.release(block, self.block_layout);
            }
        }

        Some(TeardownSummary {
            live_count: self.live_count(),
            total_allocations: self.total_allocations,
            total_frees: self.total_frees,
            released_block: block.is_some(),
        })
    }

    fn slot_ptr(&self, block: NonNull<u8>, index: usize) -> NonNull<u8> {
        // Every index reaching this point has been validated against the bump cursor.
        debug_assert!(
            index < self.capacity.get(),
            "slot {index} index out of bounds in pool of capacity {}",
            self.capacity.get()
        );

        // Cannot overflow because the whole block size was computed without overflow.
        let offset = index.wrapping_mul(self.element_size.get());

        // SAFETY: The index is within capacity, so the result stays within the block.
        unsafe { block.add(offset) }
    }

    /// The part of a slot that lies outside its free-list link.
    fn payload(&self, slot: NonNull<u8>) -> (NonNull<u8>, usize) {
        // Cannot underflow, the element size is checked to fit a link on construction.
        let payload_len = self.element_size.get().wrapping_sub(LINK_SIZE);

        // SAFETY: The link lies within the slot, so the payload start is at most one past the
        // end of the slot.
        let payload = unsafe { slot.add(LINK_SIZE) };

        (payload, payload_len)
    }

    /// Walks the free list and verifies that the bookkeeping is consistent.
    #[cfg(test)]
    #[allow(
        clippy::arithmetic_side_effects,
        clippy::indexing_slicing,
        reason = "test logic, panicking on overflow or out of bounds access is the desired outcome"
    )]
    pub(crate) fn integrity_check(&self) {
        let Some(block) = self.block else {
            assert_eq!(self.free_head, None);
            return;
        };

        let mut visited = vec![false; self.capacity.get()];
        let mut free_list_len = 0;
        let mut cursor = self.free_head;

        while let Some(index) = cursor {
            assert!(
                index < self.bump_cursor,
                "free list contains never-allocated slot {index}"
            );
            assert!(!visited[index], "free list contains a cycle through slot {index}");
            visited[index] = true;
            free_list_len += 1;

            // SAFETY: Slots on the free list carry a link at their start.
            let next = unsafe { self.slot_ptr(block, index).cast::<usize>().read_unaligned() };
            cursor = (next != END_OF_FREE_LIST).then_some(next);
        }

        if self.integrity.is_enabled() {
            assert_eq!(
                visited, self.released,
                "released slot flags do not match the free list"
            );
        }

        let untouched = self.capacity.get() - self.bump_cursor;

        assert_eq!(
            free_list_len + untouched,
            self.free_count,
            "free count does not match free list length plus untouched capacity"
        );
    }
}

/// Layout of a block holding `capacity` slots of `element_size` bytes.
///
/// # Panics
///
/// Panics if the element size cannot hold a free-list link or if the block size overflows.
#[must_use]
pub(crate) fn block_layout(element_size: NonZero<usize>, capacity: NonZero<usize>) -> Layout {
    assert!(
        element_size.get() >= LINK_SIZE,
        "element size {} is too small to hold a free-list link of {LINK_SIZE} bytes",
        element_size.get()
    );

    let size = element_size
        .get()
        .checked_mul(capacity.get())
        .expect("block size of element size times capacity must not overflow");

    // The largest power of two dividing the element size keeps every slot equally aligned.
    let align = (1_usize << element_size.trailing_zeros()).min(MAX_BLOCK_ALIGN);

    Layout::from_size_align(size, align)
        .expect("block size must not overflow isize when rounded up to the block alignment")
}

// SAFETY: The block pointer refers to memory owned exclusively by this SlotBlock, which does
// not rely on thread-local state. Access to the slots themselves is governed by the contract
// between the pool and its callers, not by the thread that holds the SlotBlock.
unsafe impl Send for SlotBlock {}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use super::*;
    use crate::SystemBacking;
    use crate::integrity::{FREED_PATTERN, UNTOUCHED_PATTERN};

    fn nz(value: usize) -> NonZero<usize> {
        NonZero::new(value).unwrap()
    }

    fn acquired(element_size: usize, capacity: usize, integrity: IntegrityChecking) -> SlotBlock {
        let mut slots = SlotBlock::new(nz(element_size), nz(capacity), integrity);
        assert!(slots.ensure_block(&SystemBacking).unwrap());
        slots
    }

    fn offset_of(slots: &SlotBlock, ptr: NonNull<u8>) -> usize {
        ptr.as_ptr().addr() - slots.block().unwrap().as_ptr().addr()
    }

    #[test]
    fn smoke_test() {
        let mut slots = acquired(16, 4, IntegrityChecking::Enabled);

        let p0 = slots.allocate(nz(1)).unwrap().unwrap();
        let p1 = slots.allocate(nz(1)).unwrap().unwrap();

        assert_eq!(offset_of(&slots, p0), 0);
        assert_eq!(offset_of(&slots, p1), 16);
        assert_eq!(slots.live_count(), 2);
        assert_eq!(slots.free_count(), 2);

        slots.release(p0, nz(1)).unwrap();
        slots.integrity_check();

        let p2 = slots.allocate(nz(1)).unwrap().unwrap();
        assert_eq!(p2, p0);

        let p3 = slots.allocate(nz(1)).unwrap().unwrap();
        assert_eq!(offset_of(&slots, p3), 32);

        slots.integrity_check();
        assert_eq!(slots.total_allocations(), 4);
        assert_eq!(slots.total_frees(), 1);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn ensure_block_acquires_once() {
        let mut slots = SlotBlock::new(nz(16), nz(4), IntegrityChecking::Disabled);
        assert!(slots.block().is_none());

        assert!(slots.ensure_block(&SystemBacking).unwrap());
        let block = slots.block();
        assert!(!slots.ensure_block(&SystemBacking).unwrap());
        assert_eq!(slots.block(), block);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn fresh_block_is_stamped_untouched() {
        let mut slots = acquired(16, 4, IntegrityChecking::Enabled);

        let block = slots.block().unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == UNTOUCHED_PATTERN));

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn release_stamps_payload_but_not_link() {
        let mut slots = acquired(16, 2, IntegrityChecking::Enabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();
        slots.release(p, nz(1)).unwrap();

        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 16) };
        assert!(bytes[LINK_SIZE..].iter().all(|&b| b == FREED_PATTERN));

        let link = unsafe { p.cast::<usize>().read_unaligned() };
        assert_eq!(link, END_OF_FREE_LIST);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn reused_slot_no_longer_looks_freed() {
        let mut slots = acquired(16, 2, IntegrityChecking::Enabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();
        slots.release(p, nz(1)).unwrap();

        let again = slots.allocate(nz(1)).unwrap().unwrap();
        assert_eq!(again, p);

        // Releasing without ever writing to the slot is legitimate.
        slots.release(again, nz(1)).unwrap();

        slots.integrity_check();
        slots.teardown(&SystemBacking);
    }

    #[test]
    fn exhaustion_is_not_an_error() {
        let mut slots = acquired(8, 2, IntegrityChecking::Disabled);

        assert!(slots.allocate(nz(1)).unwrap().is_some());
        assert!(slots.allocate(nz(1)).unwrap().is_some());
        assert_eq!(slots.allocate(nz(1)), Ok(None));
        assert_eq!(slots.free_count(), 0);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn multi_slot_allocation_is_all_or_nothing() {
        let mut slots = acquired(8, 4, IntegrityChecking::Enabled);

        let first = slots.allocate(nz(3)).unwrap().unwrap();
        assert_eq!(offset_of(&slots, first), 0);
        assert_eq!(slots.free_count(), 1);
        assert_eq!(slots.bump_cursor(), 3);

        // Only one slot left, so two cannot be provided and nothing is consumed.
        assert_eq!(slots.allocate(nz(2)), Ok(None));
        assert_eq!(slots.free_count(), 1);
        assert_eq!(slots.bump_cursor(), 3);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn multi_slot_allocation_ignores_free_list() {
        let mut slots = acquired(8, 4, IntegrityChecking::Enabled);

        let a = slots.allocate(nz(1)).unwrap().unwrap();
        let _b = slots.allocate(nz(1)).unwrap().unwrap();
        let _c = slots.allocate(nz(1)).unwrap().unwrap();
        slots.release(a, nz(1)).unwrap();

        // Two slots are free (index 0 on the free list, index 3 untouched) but they are not
        // contiguous never-touched capacity.
        assert_eq!(slots.free_count(), 2);
        assert_eq!(slots.allocate(nz(2)), Ok(None));

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn multi_slot_release_pushes_each_slot() {
        let mut slots = acquired(8, 4, IntegrityChecking::Enabled);

        let first = slots.allocate(nz(3)).unwrap().unwrap();
        slots.release(first, nz(3)).unwrap();

        assert_eq!(slots.free_count(), 4);
        assert_eq!(slots.total_frees(), 3);
        slots.integrity_check();

        // The last slot of the range was pushed last, so it comes back first.
        let reused = slots.allocate(nz(1)).unwrap().unwrap();
        assert_eq!(offset_of(&slots, reused), 16);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn multi_slot_release_rejects_partially_free_range() {
        let mut slots = acquired(16, 4, IntegrityChecking::Enabled);

        let first = slots.allocate(nz(3)).unwrap().unwrap();
        let second = unsafe { first.add(16) };
        slots.release(second, nz(1)).unwrap();

        assert_eq!(
            slots.release(first, nz(3)),
            Err(Violation::DoubleRelease { index: 1 })
        );

        // Nothing changed.
        assert_eq!(slots.free_count(), 2);
        slots.integrity_check();

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn double_release_is_detected() {
        let mut slots = acquired(16, 4, IntegrityChecking::Enabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();
        slots.release(p, nz(1)).unwrap();

        assert_eq!(
            slots.release(p, nz(1)),
            Err(Violation::DoubleRelease { index: 0 })
        );
        assert_eq!(slots.free_count(), 4);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn double_release_is_detected_while_other_slots_are_live() {
        for element_size in [LINK_SIZE, 16] {
            let mut slots = acquired(element_size, 4, IntegrityChecking::Enabled);

            let a = slots.allocate(nz(1)).unwrap().unwrap();
            let _b = slots.allocate(nz(1)).unwrap().unwrap();
            slots.release(a, nz(1)).unwrap();

            assert_eq!(
                slots.release(a, nz(1)),
                Err(Violation::DoubleRelease { index: 0 })
            );

            // Nothing changed, so the slot comes back exactly once.
            assert_eq!(slots.free_count(), 3);
            assert_eq!(slots.live_count(), 1);
            slots.integrity_check();

            let first = slots.allocate(nz(1)).unwrap().unwrap();
            let second = slots.allocate(nz(1)).unwrap().unwrap();
            assert_eq!(first, a);
            assert_ne!(second, a);

            slots.teardown(&SystemBacking);
        }
    }

    #[test]
    fn live_slot_holding_freed_pattern_can_be_released() {
        let mut slots = acquired(16, 4, IntegrityChecking::Enabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();

        unsafe {
            p.write_bytes(FREED_PATTERN, 16);
        }

        slots.release(p, nz(1)).unwrap();
        slots.integrity_check();

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn double_release_of_last_live_slot_is_detected_without_integrity_checks() {
        let mut slots = acquired(16, 4, IntegrityChecking::Disabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();
        slots.release(p, nz(1)).unwrap();

        assert_eq!(
            slots.release(p, nz(1)),
            Err(Violation::DoubleRelease { index: 0 })
        );

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn write_after_free_is_detected() {
        let mut slots = acquired(16, 4, IntegrityChecking::Enabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();
        slots.release(p, nz(1)).unwrap();

        unsafe {
            p.add(LINK_SIZE + 3).write(0x42);
        }

        assert_eq!(
            slots.allocate(nz(1)),
            Err(Violation::WriteAfterFree { index: 0 })
        );

        // The slot stays where it was.
        assert_eq!(slots.free_count(), 4);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn corrupted_link_is_detected_on_reuse() {
        // Out of bounds, the slot itself, a live slot.
        for link in [1000, 0, 1] {
            let mut slots = acquired(16, 4, IntegrityChecking::Enabled);

            let p = slots.allocate(nz(1)).unwrap().unwrap();
            let _live = slots.allocate(nz(1)).unwrap().unwrap();
            slots.release(p, nz(1)).unwrap();

            unsafe {
                p.cast::<usize>().write_unaligned(link);
            }

            assert_eq!(
                slots.allocate(nz(1)),
                Err(Violation::WriteAfterFree { index: 0 })
            );
            assert_eq!(slots.free_count(), 3);

            slots.teardown(&SystemBacking);
        }
    }

    #[test]
    fn out_of_bounds_link_is_detected_without_integrity_checks() {
        let mut slots = acquired(LINK_SIZE, 4, IntegrityChecking::Disabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();
        slots.release(p, nz(1)).unwrap();

        unsafe {
            p.cast::<usize>().write_unaligned(1000);
        }

        assert_eq!(
            slots.allocate(nz(1)),
            Err(Violation::WriteAfterFree { index: 0 })
        );

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn release_of_untouched_slot_is_rejected() {
        let mut slots = acquired(16, 4, IntegrityChecking::Disabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();
        let beyond = unsafe { p.add(32) };

        assert_eq!(
            slots.release(beyond, nz(1)),
            Err(Violation::NeverAllocated { index: 2 })
        );

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn release_of_foreign_pointer_is_rejected() {
        let mut slots = acquired(16, 4, IntegrityChecking::Disabled);

        let p = slots.allocate(nz(1)).unwrap().unwrap();
        let misaligned = unsafe { p.add(3) };

        assert_eq!(
            slots.release(misaligned, nz(1)),
            Err(Violation::ForeignPointer {
                address: misaligned.as_ptr().addr()
            })
        );

        // The range would run past the end of the block.
        assert_eq!(
            slots.release(p, nz(5)),
            Err(Violation::ForeignPointer {
                address: p.as_ptr().addr()
            })
        );

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn release_before_acquisition_is_foreign() {
        let mut slots = SlotBlock::new(nz(16), nz(4), IntegrityChecking::Disabled);
        let mut local = [0_u8; 16];
        let ptr = NonNull::from(&mut local).cast::<u8>();

        assert_eq!(
            slots.release(ptr, nz(1)),
            Err(Violation::ForeignPointer {
                address: ptr.as_ptr().addr()
            })
        );
    }

    #[test]
    fn index_of_checks_bounds_and_alignment() {
        let mut slots = acquired(16, 4, IntegrityChecking::Disabled);
        let start = slots.block().unwrap().as_ptr();

        assert_eq!(slots.index_of(start), Some(0));
        assert_eq!(slots.index_of(start.wrapping_add(48)), Some(3));
        assert_eq!(slots.index_of(start.wrapping_add(64)), None);
        assert_eq!(slots.index_of(start.wrapping_add(17)), None);
        assert_eq!(slots.index_of(start.wrapping_sub(16)), None);

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut slots = acquired(16, 4, IntegrityChecking::Disabled);
        _ = slots.allocate(nz(1)).unwrap().unwrap();

        let summary = slots.teardown(&SystemBacking).unwrap();
        assert_eq!(
            summary,
            TeardownSummary {
                live_count: 1,
                total_allocations: 1,
                total_frees: 0,
                released_block: true,
            }
        );

        assert_eq!(slots.teardown(&SystemBacking), None);
        assert!(slots.is_torn_down());
        assert!(slots.block().is_none());
    }

    #[test]
    fn teardown_without_block_releases_nothing() {
        let mut slots = SlotBlock::new(nz(16), nz(4), IntegrityChecking::Disabled);

        let summary = slots.teardown(&SystemBacking).unwrap();
        assert!(!summary.released_block);
    }

    #[test]
    fn operations_after_teardown_are_violations() {
        let mut slots = acquired(16, 4, IntegrityChecking::Disabled);
        let p = slots.allocate(nz(1)).unwrap().unwrap();

        slots.teardown(&SystemBacking);

        assert!(matches!(
            slots.ensure_block(&SystemBacking),
            Err(Fault::Violation(Violation::UseAfterTeardown))
        ));
        assert_eq!(slots.allocate(nz(1)), Err(Violation::UseAfterTeardown));
        assert_eq!(slots.release(p, nz(1)), Err(Violation::UseAfterTeardown));
        assert_eq!(slots.lookup_index(p), Err(Violation::UseAfterTeardown));
    }

    #[test]
    fn element_size_not_multiple_of_link_alignment() {
        let mut slots = acquired(12, 5, IntegrityChecking::Enabled);

        let pointers = (0..5)
            .map(|_| slots.allocate(nz(1)).unwrap().unwrap())
            .collect::<Vec<_>>();

        for (index, ptr) in pointers.iter().enumerate() {
            assert_eq!(offset_of(&slots, *ptr), index * 12);
        }

        for ptr in pointers.iter().rev() {
            slots.release(*ptr, nz(1)).unwrap();
        }

        slots.integrity_check();

        // Released in reverse order, so the first slot is on top of the free list.
        assert_eq!(slots.allocate(nz(1)).unwrap(), Some(pointers[0]));

        slots.teardown(&SystemBacking);
    }

    #[test]
    fn block_layout_alignment_follows_element_size() {
        assert_eq!(block_layout(nz(16), nz(4)).align(), 16);
        assert_eq!(block_layout(nz(24), nz(4)).align(), 8);
        assert_eq!(block_layout(nz(12), nz(4)).align(), 4);
        assert_eq!(block_layout(nz(4096), nz(4)).align(), MAX_BLOCK_ALIGN);
        assert_eq!(block_layout(nz(24), nz(4)).size(), 96);
    }

    #[test]
    #[should_panic]
    fn element_size_smaller_than_link_panics() {
        _ = block_layout(nz(LINK_SIZE - 1), nz(4));
    }

    #[test]
    #[should_panic]
    fn block_size_overflow_panics() {
        _ = block_layout(nz(usize::MAX / 2), nz(3));
    }
}
