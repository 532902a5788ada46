use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::identifier::{BindOutcome, IdentifierBinding};
use crate::slots::{Fault, SlotBlock, TeardownSummary};
use crate::{
    BackingAllocator, Gid, IdentifierError, IdentifierGenerator, Instrumentation,
    IntegrityChecking, PoolStats, Result, SlotPoolBuilder, SystemBacking, Violation,
};

/// A pool of fixed-size memory slots carved out of a single backing block, where every slot
/// can also be named by a globally unique identifier.
///
/// The pool hands out raw memory. It never constructs, drops or otherwise interprets what the
/// caller stores in a slot, and it never creates references to slot memory, so callers are
/// free to access the slots they hold in whatever way suits them.
///
/// # Allocation
///
/// The capacity is fixed at construction and the pool never grows. The backing block is
/// acquired from the backing allocator on first use. Releasing a slot makes it the first
/// candidate for the next single-slot allocation, so recently used (cache-warm) memory is
/// reused before never-touched memory. Running out of slots is an expected outcome reported
/// as `Ok(None)`; deciding whether to create another pool is up to the caller.
///
/// # Identifiers
///
/// The slot at index `i` is named by identifier `base + i`. The base is bound once, either
/// explicitly via [`set_base()`][Self::set_base] or lazily on the first
/// [`identifier_for()`][Self::identifier_for] lookup, which requests a range of `capacity`
/// identifiers from the pool's [`IdentifierGenerator`]. The generator is consulted at most once
/// over the lifetime of the pool.
///
/// # Misuse
///
/// Releasing or looking up a pointer that is not a slot of this pool, releasing a slot twice,
/// writing to a released slot and using a torn down pool are precondition violations that
/// panic with a message naming the pool's label. Detection of double release and of writes
/// after release relies on [integrity checking][IntegrityChecking] and is best-effort. A
/// rejected call leaves the pool unchanged.
///
/// # Examples
///
/// ```
/// use slot_pool::SlotPool;
///
/// let pool = SlotPool::builder()
///     .label("sessions")
///     .element_size(16)
///     .capacity(4)
///     .build();
///
/// let a = pool.allocate().unwrap().unwrap();
/// let b = pool.allocate().unwrap().unwrap();
///
/// // SAFETY: The slot came from this pool and we no longer use it.
/// unsafe {
///     pool.release(a);
/// }
///
/// // The most recently released slot is handed out first.
/// let c = pool.allocate().unwrap().unwrap();
/// assert_eq!(c, a);
///
/// // Every slot has its own identifier.
/// assert_ne!(
///     pool.identifier_for(b).unwrap(),
///     pool.identifier_for(c).unwrap()
/// );
/// ```
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]). A single mutex serializes every operation
/// on the pool's bookkeeping. Diagnostics, instrumentation notifications and panics happen
/// after the mutex has been released.
pub struct SlotPool<B = SystemBacking>
where
    B: BackingAllocator,
{
    label: String,

    // Duplicated from the slot block so they can be read without taking the lock.
    element_size: NonZero<usize>,
    capacity: NonZero<usize>,
    integrity: IntegrityChecking,

    /// Informational only. Recorded for whoever decides the capacity of the next pool when
    /// this one is exhausted.
    growth_step: NonZero<usize>,

    /// Ordinal of this pool among the pools chained together by the caller.
    instances_in_chain: NonZero<usize>,

    backing: B,
    identifiers: Arc<dyn IdentifierGenerator>,
    instrumentation: Arc<dyn Instrumentation>,

    state: Mutex<PoolState>,
}

/// Everything guarded by the pool's lock.
#[derive(Debug)]
struct PoolState {
    slots: SlotBlock,
    binding: IdentifierBinding,
}

/// What a teardown did, carried out of the lock for diagnostics.
struct Teardown {
    summary: TeardownSummary,

    /// The identifier range to hand back to the generator, if the pool requested one.
    unbound: Option<Gid>,
}

impl SlotPool {
    /// Starts building a new pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use slot_pool::SlotPool;
    ///
    /// let pool = SlotPool::builder().element_size(32).capacity(8).build();
    ///
    /// assert!(pool.is_empty());
    /// assert!(pool.has_capacity());
    /// ```
    #[cfg_attr(test, mutants::skip)] // Gets mutated to alternate version of itself.
    pub fn builder() -> SlotPoolBuilder {
        SlotPoolBuilder::new()
    }
}

impl<B> SlotPool<B>
where
    B: BackingAllocator,
{
    #[allow(
        clippy::too_many_arguments,
        reason = "only called by the builder, which has already named every argument"
    )]
    #[must_use]
    pub(crate) fn new_inner(
        label: String,
        element_size: NonZero<usize>,
        capacity: NonZero<usize>,
        growth_step: NonZero<usize>,
        instances_in_chain: NonZero<usize>,
        integrity: IntegrityChecking,
        identifiers: Arc<dyn IdentifierGenerator>,
        instrumentation: Arc<dyn Instrumentation>,
        backing: B,
    ) -> Self {
        Self {
            label,
            element_size,
            capacity,
            integrity,
            growth_step,
            instances_in_chain,
            backing,
            identifiers,
            instrumentation,
            state: Mutex::new(PoolState {
                slots: SlotBlock::new(element_size, capacity, integrity),
                binding: IdentifierBinding::default(),
            }),
        }
    }

    /// Allocates one slot.
    ///
    /// Returns `Ok(None)` if the pool has no free slot left. The contents of the returned
    /// slot are unspecified.
    ///
    /// # Errors
    ///
    /// Returns an error if this is the first use of the pool and the backing allocator cannot
    /// provide the pool's memory block.
    ///
    /// # Panics
    ///
    /// Panics if the pool has been torn down, or if integrity checking detects that the slot
    /// about to be reused was written to after it was released.
    pub fn allocate(&self) -> Result<Option<NonNull<u8>>> {
        self.allocate_many(NonZero::<usize>::MIN)
    }

    /// Allocates `count` contiguous slots, returning a pointer to the first of them.
    ///
    /// A single slot is preferably taken from the most recently released slots. Multiple slots
    /// are only taken from capacity that has never been handed out before: either all `count`
    /// slots are available there or the result is `Ok(None)` and nothing is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if this is the first use of the pool and the backing allocator cannot
    /// provide the pool's memory block.
    ///
    /// # Panics
    ///
    /// Panics if the pool has been torn down, or if integrity checking detects that the slot
    /// about to be reused was written to after it was released.
    pub fn allocate_many(&self, count: NonZero<usize>) -> Result<Option<NonNull<u8>>> {
        self.instrumentation.allocate_started(&self.label, count);

        let outcome = {
            let mut state = self.state.lock();
            Self::allocate_locked(&mut state.slots, &self.backing, count)
        };

        let (acquired_block, slot) = match outcome {
            Ok(allocated) => allocated,
            Err(Fault::Violation(violation)) => violation.raise(&self.label),
            Err(Fault::Backing(error)) => {
                warn!(label = %self.label, %error, "backing allocator could not provide block");
                self.instrumentation
                    .allocate_finished(&self.label, count, None);
                return Err(error.into());
            }
        };

        if acquired_block {
            debug!(
                label = %self.label,
                size = self.element_size.get().saturating_mul(self.capacity.get()),
                capacity = self.capacity.get(),
                element_size = self.element_size.get(),
                "acquired backing block"
            );
        }

        if slot.is_none() {
            trace!(label = %self.label, requested = count.get(), "pool exhausted");
        }

        self.instrumentation
            .allocate_finished(&self.label, count, slot);

        Ok(slot)
    }

    fn allocate_locked(
        slots: &mut SlotBlock,
        backing: &B,
        count: NonZero<usize>,
    ) -> std::result::Result<(bool, Option<NonNull<u8>>), Fault> {
        let acquired_block = slots.ensure_block(backing)?;
        let slot = slots.allocate(count)?;

        Ok((acquired_block, slot))
    }

    /// Returns a slot to the pool.
    ///
    /// # Safety
    ///
    /// The slot must not be accessed after this call, by the caller or anyone the caller
    /// shared the pointer with, until it is handed out again by a future allocation.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not the start of a slot of this pool, if the slot is not currently
    /// allocated (as far as detectable) or if the pool has been torn down.
    pub unsafe fn release(&self, slot: NonNull<u8>) {
        // SAFETY: Forwarding the guarantees of the caller.
        unsafe {
            self.release_many(slot, NonZero::<usize>::MIN);
        }
    }

    /// Returns `count` contiguous slots starting at `first` to the pool.
    ///
    /// Every slot is validated before any of them is released, so a rejected call releases
    /// nothing. Each slot is released individually and may be handed out again by a
    /// single-slot allocation.
    ///
    /// # Safety
    ///
    /// None of the slots may be accessed after this call, by the caller or anyone the caller
    /// shared the pointer with, until they are handed out again by a future allocation.
    ///
    /// # Panics
    ///
    /// Panics if `first` is not the start of a slot of this pool, if the range runs past the
    /// end of the pool, if any slot in the range is not currently allocated (as far as
    /// detectable) or if the pool has been torn down.
    pub unsafe fn release_many(&self, first: NonNull<u8>, count: NonZero<usize>) {
        self.instrumentation
            .release_started(&self.label, first, count);

        let outcome = self.state.lock().slots.release(first, count);

        if let Err(violation) = outcome {
            violation.raise(&self.label);
        }

        self.instrumentation
            .release_finished(&self.label, first, count);
    }

    /// Whether `ptr` is the start of a slot of this pool.
    ///
    /// Always `false` before the backing block has been acquired and after teardown.
    ///
    /// # Examples
    ///
    /// ```
    /// use slot_pool::SlotPool;
    ///
    /// let pool = SlotPool::builder().element_size(16).capacity(4).build();
    /// let slot = pool.allocate().unwrap().unwrap();
    ///
    /// assert!(pool.owns(slot.as_ptr()));
    /// assert!(!pool.owns(slot.as_ptr().wrapping_add(1)));
    /// assert!(!pool.owns(slot.as_ptr().wrapping_add(64)));
    /// ```
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.state.lock().slots.index_of(ptr).is_some()
    }

    /// Whether no slot is currently allocated, meaning an external orchestrator may safely
    /// tear the pool down.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.live_count() == 0
    }

    /// Whether at least one more slot can be allocated.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        let state = self.state.lock();
        !state.slots.is_torn_down() && state.slots.free_count() > 0
    }

    /// Number of slots currently allocated.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().slots.live_count()
    }

    /// Number of slots currently available for allocation.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().slots.free_count()
    }

    /// Number of slots in the pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Size of every slot in bytes.
    #[must_use]
    pub fn element_size(&self) -> usize {
        self.element_size.get()
    }

    /// The growth step hint the pool was built with.
    #[must_use]
    pub fn growth_step(&self) -> usize {
        self.growth_step.get()
    }

    /// The ordinal of this pool among the pools chained together by the caller.
    #[must_use]
    pub fn instances_in_chain(&self) -> usize {
        self.instances_in_chain.get()
    }

    /// The human-readable name used in diagnostics.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether this pool stamps and verifies guard bytes.
    #[must_use]
    pub fn integrity_checking(&self) -> IntegrityChecking {
        self.integrity
    }

    /// Start of the backing block, if it has been acquired and not yet released.
    #[must_use]
    pub fn base_address(&self) -> Option<NonNull<u8>> {
        self.state.lock().slots.block()
    }

    /// The first identifier of the pool's identifier range, if one has been bound.
    #[must_use]
    pub fn base(&self) -> Option<Gid> {
        self.state.lock().binding.base()
    }

    /// Returns a consistent snapshot of the pool's bookkeeping.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();

        PoolStats {
            total_allocations: state.slots.total_allocations(),
            total_frees: state.slots.total_frees(),
            live: state.slots.live_count(),
            free: state.slots.free_count(),
            touched: state.slots.bump_cursor(),
            has_backing_block: state.slots.block().is_some(),
            base: state.binding.base(),
            torn_down: state.slots.is_torn_down(),
        }
    }

    /// Binds the pool's identifier range to start at `base`.
    ///
    /// Binding the same base again has no effect. A range bound this way is never handed back
    /// to the pool's identifier generator.
    ///
    /// # Panics
    ///
    /// Panics if a different base has already been bound, explicitly or by an identifier
    /// lookup, or if the pool has been torn down.
    pub fn set_base(&self, base: Gid) {
        let outcome = {
            let mut state = self.state.lock();

            if state.slots.is_torn_down() {
                Err(Violation::UseAfterTeardown)
            } else {
                Ok(state.binding.assign(base))
            }
        };

        match outcome {
            Ok(BindOutcome::Bound) => {
                debug!(label = %self.label, %base, count = self.capacity.get(), "bound identifier range");
            }
            Ok(BindOutcome::AlreadyBoundToSame) => {}
            Ok(BindOutcome::Conflict { existing }) => Violation::ConflictingBase {
                existing,
                requested: base,
            }
            .raise(&self.label),
            Err(violation) => violation.raise(&self.label),
        }
    }

    /// Returns the globally unique identifier of the slot starting at `slot`.
    ///
    /// If no identifier range has been bound yet, this requests one from the pool's
    /// identifier generator and binds it. Concurrent first lookups are serialized, so the
    /// generator is consulted only once.
    ///
    /// # Errors
    ///
    /// Returns the generator's error unchanged if a range had to be requested and could not
    /// be provided. A later lookup will try again.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not the start of a slot of this pool or if the pool has been torn
    /// down.
    pub fn identifier_for(&self, slot: NonNull<u8>) -> Result<Gid> {
        let outcome = {
            let mut state = self.state.lock();
            let index = state.slots.lookup_index(slot);

            index.map(|index| {
                state
                    .binding
                    .get_or_request(&*self.identifiers, self.capacity)
                    .map(|(base, newly_bound)| (base, newly_bound, index))
            })
        };

        let (base, newly_bound, index) = match outcome {
            Ok(lookup) => lookup?,
            Err(violation) => violation.raise(&self.label),
        };

        if newly_bound {
            debug!(label = %self.label, %base, count = self.capacity.get(), "bound identifier range");
        }

        let identifier = base
            .checked_offset(index)
            .ok_or(IdentifierError::RangeExhausted {
                requested: self.capacity.get(),
            })?;

        Ok(identifier)
    }

    /// Releases the backing block and hands any requested identifier range back to the
    /// generator.
    ///
    /// Only the first call has any effect. Every other operation on the pool is a
    /// precondition violation afterwards, except for queries. Dropping the pool also tears it
    /// down.
    ///
    /// Tearing down a pool that still has allocated slots is allowed but logs a warning, as
    /// the memory of those slots goes away with the backing block.
    pub fn teardown(&self) {
        let teardown = Self::teardown_locked(&mut self.state.lock(), &self.backing);

        if let Some(teardown) = teardown {
            self.finish_teardown(teardown);
        }
    }

    /// Tears the pool down if it has handed out every slot at least once and all of them have
    /// been returned, leaving nothing more it could provide.
    ///
    /// The check and the teardown happen atomically. Returns whether the pool was torn down by
    /// this call.
    pub fn try_retire(&self) -> bool {
        let teardown = {
            let mut state = self.state.lock();

            let drained = state.slots.block().is_some()
                && state.slots.live_count() == 0
                && state.slots.bump_cursor() == self.capacity.get();

            if drained {
                Self::teardown_locked(&mut state, &self.backing)
            } else {
                None
            }
        };

        match teardown {
            Some(teardown) => {
                self.finish_teardown(teardown);
                true
            }
            None => false,
        }
    }

    fn teardown_locked(state: &mut PoolState, backing: &B) -> Option<Teardown> {
        let summary = state.slots.teardown(backing)?;

        Some(Teardown {
            summary,
            unbound: state.binding.unbind(),
        })
    }

    fn finish_teardown(&self, teardown: Teardown) {
        let Teardown { summary, unbound } = teardown;

        if let Some(base) = unbound {
            self.identifiers.release_range(base, self.capacity);
        }

        if summary.live_count > 0 {
            warn!(
                label = %self.label,
                live = summary.live_count,
                instances_in_chain = self.instances_in_chain.get(),
                "pool torn down with slots still allocated"
            );
        }

        debug!(
            label = %self.label,
            total_allocations = summary.total_allocations,
            total_frees = summary.total_frees,
            released_block = summary.released_block,
            "pool torn down"
        );
    }

    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        self.state.lock().slots.integrity_check();
    }
}

impl<B> Drop for SlotPool<B>
where
    B: BackingAllocator,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<B> fmt::Debug for SlotPool<B>
where
    B: BackingAllocator + fmt::Debug,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPool")
            .field("label", &self.label)
            .field("element_size", &self.element_size)
            .field("capacity", &self.capacity)
            .field("integrity", &self.integrity)
            .field("growth_step", &self.growth_step)
            .field("instances_in_chain", &self.instances_in_chain)
            .field("backing", &self.backing)
            .field("state", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc::Layout;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::identifier::MockIdentifierGenerator;
    use crate::{ArenaBacking, BackingError, Error, LocalIdentifierGenerator};

    assert_impl_all!(SlotPool: Send, Sync, fmt::Debug);
    assert_impl_all!(SlotPool<ArenaBacking>: Send, Sync, fmt::Debug);

    /// Serves blocks from the global allocator while counting calls.
    #[derive(Debug, Default)]
    struct CountingBacking {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl BackingAllocator for CountingBacking {
        fn acquire(&self, layout: Layout) -> std::result::Result<NonNull<u8>, BackingError> {
            self.acquired.fetch_add(1, Ordering::Relaxed);
            SystemBacking.acquire(layout)
        }

        unsafe fn release(&self, block: NonNull<u8>, layout: Layout) {
            self.released.fetch_add(1, Ordering::Relaxed);
            unsafe {
                SystemBacking.release(block, layout);
            }
        }
    }

    /// Never provides a block.
    #[derive(Debug)]
    struct ExhaustedBacking;

    impl BackingAllocator for ExhaustedBacking {
        fn acquire(&self, layout: Layout) -> std::result::Result<NonNull<u8>, BackingError> {
            Err(BackingError::OutOfMemory {
                size: layout.size(),
            })
        }

        unsafe fn release(&self, _block: NonNull<u8>, _layout: Layout) {
            unreachable!("nothing was ever acquired");
        }
    }

    fn pool(capacity: usize) -> SlotPool {
        SlotPool::builder()
            .label("test")
            .element_size(16)
            .capacity(capacity)
            .integrity_checking(IntegrityChecking::Enabled)
            .build()
    }

    fn nz(value: usize) -> NonZero<usize> {
        NonZero::new(value).unwrap()
    }

    #[test]
    fn smoke_test() {
        let pool = pool(3);

        assert!(pool.is_empty());
        assert!(pool.base_address().is_none());

        let a = pool.allocate().unwrap().unwrap();
        let b = pool.allocate().unwrap().unwrap();

        assert!(!pool.is_empty());
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.base_address(), Some(a));
        assert_ne!(a, b);

        unsafe {
            pool.release(b);
            pool.release(a);
        }

        pool.integrity_check();
        assert!(pool.is_empty());
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn backing_block_acquired_lazily_once() {
        let backing = Arc::new(CountingBacking::default());

        let pool = SlotPool::builder()
            .element_size(16)
            .capacity(4)
            .backing(Arc::clone(&backing))
            .build();

        assert_eq!(backing.acquired.load(Ordering::Relaxed), 0);

        _ = pool.allocate().unwrap();
        _ = pool.allocate().unwrap();

        assert_eq!(backing.acquired.load(Ordering::Relaxed), 1);
        assert_eq!(backing.released.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn backing_failure_is_returned() {
        let pool = SlotPool::builder()
            .element_size(16)
            .capacity(4)
            .backing(ExhaustedBacking)
            .build();

        let result = pool.allocate();

        assert_eq!(
            result,
            Err(Error::Backing(BackingError::OutOfMemory { size: 64 }))
        );
        assert!(!pool.stats().has_backing_block);

        // Dropping a pool that never acquired a block releases nothing.
        drop(pool);
    }

    #[test]
    fn teardown_releases_block_once() {
        let backing = Arc::new(CountingBacking::default());

        let pool = SlotPool::builder()
            .element_size(16)
            .capacity(4)
            .backing(Arc::clone(&backing))
            .build();

        _ = pool.allocate().unwrap();

        pool.teardown();
        pool.teardown();
        drop(pool);

        assert_eq!(backing.released.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn teardown_hands_back_requested_range() {
        let mut generator = MockIdentifierGenerator::new();
        generator
            .expect_request_range()
            .times(1)
            .returning(|_| Ok(Gid::new(500)));
        generator
            .expect_release_range()
            .withf(|base, count| *base == Gid::new(500) && count.get() == 4)
            .times(1)
            .return_const(());

        let pool = SlotPool::builder()
            .element_size(16)
            .capacity(4)
            .identifier_generator(Arc::new(generator))
            .build();

        let slot = pool.allocate().unwrap().unwrap();
        assert_eq!(pool.identifier_for(slot).unwrap(), Gid::new(500));

        unsafe {
            pool.release(slot);
        }

        pool.teardown();
        pool.teardown();
    }

    #[test]
    fn teardown_keeps_assigned_range() {
        let mut generator = MockIdentifierGenerator::new();
        generator.expect_request_range().never();
        generator.expect_release_range().never();

        let pool = SlotPool::builder()
            .element_size(16)
            .capacity(4)
            .identifier_generator(Arc::new(generator))
            .build();

        pool.set_base(Gid::new(1000));

        let slot = pool.allocate().unwrap().unwrap();
        assert_eq!(pool.identifier_for(slot).unwrap(), Gid::new(1000));
    }

    #[test]
    fn identifier_is_base_plus_index() {
        let pool = SlotPool::builder()
            .element_size(16)
            .capacity(4)
            .identifier_generator(Arc::new(LocalIdentifierGenerator::starting_at(10)))
            .build();

        let first = pool.allocate_many(nz(4)).unwrap().unwrap();

        for index in 0..4 {
            let slot = unsafe { first.add(index * 16) };
            assert_eq!(
                pool.identifier_for(slot).unwrap(),
                Gid::new(10 + index as u128)
            );
        }

        assert_eq!(pool.base(), Some(Gid::new(10)));
    }

    #[test]
    fn identifier_error_is_propagated_and_retried() {
        let mut generator = MockIdentifierGenerator::new();
        let mut calls = 0;
        generator
            .expect_request_range()
            .times(2)
            .returning(move |_| {
                calls += 1;
                if calls == 1 {
                    Err(IdentifierError::Service {
                        message: "busy".to_string(),
                    })
                } else {
                    Ok(Gid::new(77))
                }
            });
        generator
            .expect_release_range()
            .times(1)
            .return_const(());

        let pool = SlotPool::builder()
            .element_size(16)
            .capacity(2)
            .identifier_generator(Arc::new(generator))
            .build();

        let slot = pool.allocate().unwrap().unwrap();

        assert_eq!(
            pool.identifier_for(slot),
            Err(Error::Identifier(IdentifierError::Service {
                message: "busy".to_string()
            }))
        );
        assert_eq!(pool.base(), None);

        assert_eq!(pool.identifier_for(slot), Ok(Gid::new(77)));
        assert_eq!(pool.base(), Some(Gid::new(77)));
    }

    #[test]
    fn identifier_overflow_is_range_exhaustion() {
        let pool = pool(4);
        pool.set_base(Gid::new(u128::MAX - 1));

        let first = pool.allocate_many(nz(4)).unwrap().unwrap();
        let last = unsafe { first.add(48) };

        assert_eq!(
            pool.identifier_for(last),
            Err(Error::Identifier(IdentifierError::RangeExhausted {
                requested: 4
            }))
        );
    }

    #[test]
    fn set_base_same_value_is_accepted() {
        let pool = pool(4);

        pool.set_base(Gid::new(5));
        pool.set_base(Gid::new(5));

        assert_eq!(pool.base(), Some(Gid::new(5)));
    }

    #[test]
    #[should_panic(expected = "conflicts with already bound base")]
    fn set_base_different_value_panics() {
        let pool = pool(4);

        pool.set_base(Gid::new(5));
        pool.set_base(Gid::new(6));
    }

    #[test]
    fn rejected_release_leaves_pool_unchanged() {
        let pool = pool(4);

        let slot = pool.allocate().unwrap().unwrap();
        unsafe {
            pool.release(slot);
        }

        let before = pool.stats();

        let result = catch_unwind(AssertUnwindSafe(|| unsafe {
            pool.release(slot);
        }));

        assert!(result.is_err());
        assert_eq!(pool.stats(), before);

        // The pool remains usable after the rejected call.
        assert_eq!(pool.allocate().unwrap(), Some(slot));
        pool.integrity_check();
    }

    #[test]
    #[should_panic(expected = "slot pool 'test'")]
    fn release_of_foreign_pointer_panics() {
        let pool = pool(4);
        _ = pool.allocate().unwrap();

        let mut local = [0_u8; 16];

        unsafe {
            pool.release(NonNull::from(&mut local).cast());
        }
    }

    #[test]
    #[should_panic(expected = "pool used after teardown")]
    fn allocate_after_teardown_panics() {
        let pool = pool(4);
        pool.teardown();

        _ = pool.allocate();
    }

    #[test]
    #[should_panic(expected = "pool used after teardown")]
    fn set_base_after_teardown_panics() {
        let pool = pool(4);
        pool.teardown();

        pool.set_base(Gid::new(1));
    }

    #[test]
    fn queries_after_teardown_do_not_panic() {
        let pool = pool(4);
        let slot = pool.allocate().unwrap().unwrap();
        pool.teardown();

        assert!(!pool.owns(slot.as_ptr()));
        assert!(!pool.has_capacity());
        assert_eq!(pool.base_address(), None);
        assert!(pool.stats().torn_down);
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn try_retire_requires_drained_pool() {
        let pool = pool(2);

        // Never used.
        assert!(!pool.try_retire());

        let a = pool.allocate().unwrap().unwrap();

        // Slot still allocated.
        assert!(!pool.try_retire());

        unsafe {
            pool.release(a);
        }

        // Never-touched capacity remains.
        assert!(!pool.try_retire());

        let first = pool.allocate().unwrap().unwrap();
        let second = pool.allocate().unwrap().unwrap();
        unsafe {
            pool.release(first);
            pool.release(second);
        }

        assert!(pool.try_retire());
        assert!(pool.stats().torn_down);

        // Already retired.
        assert!(!pool.try_retire());
    }

    #[test]
    fn stats_track_lifetime_counters() {
        let pool = pool(4);

        let first = pool.allocate_many(nz(2)).unwrap().unwrap();
        unsafe {
            pool.release_many(first, nz(2));
        }
        _ = pool.allocate().unwrap();

        let stats = pool.stats();

        assert_eq!(stats.total_allocations, 3);
        assert_eq!(stats.total_frees, 2);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.free, 3);
        assert_eq!(stats.touched, 2);
        assert!(stats.has_backing_block);
        assert!(!stats.is_balanced());
    }

    #[test]
    fn debug_output_names_pool() {
        let pool = pool(4);

        let output = format!("{pool:?}");

        assert!(output.contains("SlotPool"));
        assert!(output.contains("\"test\""));
    }
}
