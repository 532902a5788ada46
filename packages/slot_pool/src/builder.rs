use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::num::NonZero;
use std::sync::Arc;

use crate::slots::LINK_SIZE;
use crate::{
    BackingAllocator, IdentifierGenerator, Instrumentation, IntegrityChecking,
    LocalIdentifierGenerator, NoopInstrumentation, SlotPool, SystemBacking,
};

/// Label of pools that were not given one.
pub(crate) const DEFAULT_LABEL: &str = "<unknown>";

/// Builder for creating an instance of [`SlotPool`].
///
/// The element size and the capacity are mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use slot_pool::SlotPool;
///
/// let pool = SlotPool::builder()
///     .label("connections")
///     .element_size(64)
///     .capacity(128)
///     .build();
///
/// assert_eq!(pool.label(), "connections");
/// assert_eq!(pool.capacity(), 128);
/// ```
///
/// Sizing the slots after a type:
///
/// ```
/// use slot_pool::SlotPool;
///
/// struct Request {
///     id: u64,
///     payload: [u8; 56],
/// }
///
/// let pool = SlotPool::builder()
///     .element_size_of::<Request>()
///     .capacity(32)
///     .build();
///
/// assert_eq!(pool.element_size(), 64);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[must_use]
pub struct SlotPoolBuilder<B = SystemBacking> {
    label: Option<String>,
    element_size: Option<NonZero<usize>>,
    capacity: Option<NonZero<usize>>,
    growth_step: Option<NonZero<usize>>,
    instances_in_chain: NonZero<usize>,
    integrity: IntegrityChecking,
    identifiers: Option<Arc<dyn IdentifierGenerator>>,
    instrumentation: Option<Arc<dyn Instrumentation>>,
    backing: B,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl SlotPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            label: None,
            element_size: None,
            capacity: None,
            growth_step: None,
            instances_in_chain: NonZero::<usize>::MIN,
            integrity: IntegrityChecking::default(),
            identifiers: None,
            instrumentation: None,
            backing: SystemBacking,
            _not_sync: PhantomData,
        }
    }
}

impl<B> SlotPoolBuilder<B>
where
    B: BackingAllocator,
{
    /// Sets the human-readable name used in diagnostics. Defaults to `"<unknown>"`.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the size of every slot in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `element_size` is smaller than a `usize`, as every free slot must be able
    /// to hold a link to the next free slot.
    pub fn element_size(mut self, element_size: usize) -> Self {
        assert!(
            element_size >= LINK_SIZE,
            "SlotPool element size must be at least {LINK_SIZE} bytes, got {element_size}"
        );

        self.element_size = NonZero::new(element_size);
        self
    }

    /// Sets the size of every slot to the size of `T`, rounded up to the alignment of `T`.
    ///
    /// Slots are aligned to the largest power of two that divides the element size (up to 64
    /// bytes), so every slot is suitably aligned for a `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is smaller than a `usize`.
    pub fn element_size_of<T>(self) -> Self {
        // Rust type sizes are always multiples of their alignment.
        self.element_size(mem::size_of::<T>())
    }

    /// Sets the number of slots in the pool.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(NonZero::new(capacity).expect("SlotPool must have non-zero capacity"));
        self
    }

    /// Sets the growth step hint recorded for orchestrators that chain pools together.
    ///
    /// The pool itself never grows. Defaults to the capacity.
    ///
    /// # Panics
    ///
    /// Panics if `growth_step` is zero.
    pub fn growth_step(mut self, growth_step: usize) -> Self {
        self.growth_step =
            Some(NonZero::new(growth_step).expect("SlotPool growth step must be non-zero"));
        self
    }

    /// Sets the ordinal of this pool within a chain of pools, for diagnostics. Defaults to 1.
    ///
    /// # Panics
    ///
    /// Panics if `instances_in_chain` is zero.
    pub fn instances_in_chain(mut self, instances_in_chain: usize) -> Self {
        self.instances_in_chain = NonZero::new(instances_in_chain)
            .expect("SlotPool instances in chain must be non-zero");
        self
    }

    /// Sets whether guard bytes are stamped and verified to detect misuse.
    ///
    /// Defaults to enabled in builds with debug assertions and disabled otherwise.
    pub fn integrity_checking(mut self, integrity: IntegrityChecking) -> Self {
        self.integrity = integrity;
        self
    }

    /// Sets the generator from which the pool requests its identifier range.
    ///
    /// Defaults to the process-wide [`LocalIdentifierGenerator::shared()`].
    pub fn identifier_generator(mut self, generator: Arc<dyn IdentifierGenerator>) -> Self {
        self.identifiers = Some(generator);
        self
    }

    /// Sets the hook notified on entry to and exit from allocation and release.
    ///
    /// Defaults to [`NoopInstrumentation`].
    pub fn instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    /// Sets the allocator that provides the pool's memory block.
    ///
    /// Defaults to [`SystemBacking`].
    pub fn backing<B2>(self, backing: B2) -> SlotPoolBuilder<B2>
    where
        B2: BackingAllocator,
    {
        SlotPoolBuilder {
            label: self.label,
            element_size: self.element_size,
            capacity: self.capacity,
            growth_step: self.growth_step,
            instances_in_chain: self.instances_in_chain,
            integrity: self.integrity,
            identifiers: self.identifiers,
            instrumentation: self.instrumentation,
            backing,
            _not_sync: PhantomData,
        }
    }

    /// Builds the pool with the specified configuration.
    ///
    /// No memory is acquired until the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if the element size or the capacity has not been set, or if the total block
    /// size overflows.
    #[must_use]
    pub fn build(self) -> SlotPool<B> {
        let element_size = self.element_size.expect(
            "element size must be set using .element_size() or .element_size_of::<T>() before calling .build()",
        );
        let capacity = self
            .capacity
            .expect("capacity must be set using .capacity() before calling .build()");

        let identifiers: Arc<dyn IdentifierGenerator> = match self.identifiers {
            Some(identifiers) => identifiers,
            None => LocalIdentifierGenerator::shared(),
        };

        let instrumentation: Arc<dyn Instrumentation> = match self.instrumentation {
            Some(instrumentation) => instrumentation,
            None => Arc::new(NoopInstrumentation),
        };

        SlotPool::new_inner(
            self.label.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            element_size,
            capacity,
            self.growth_step.unwrap_or(capacity),
            self.instances_in_chain,
            self.integrity,
            identifiers,
            instrumentation,
            self.backing,
        )
    }
}

impl<B> fmt::Debug for SlotPoolBuilder<B>
where
    B: fmt::Debug,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPoolBuilder")
            .field("label", &self.label)
            .field("element_size", &self.element_size)
            .field("capacity", &self.capacity)
            .field("growth_step", &self.growth_step)
            .field("instances_in_chain", &self.instances_in_chain)
            .field("integrity", &self.integrity)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::ArenaBacking;

    assert_impl_all!(SlotPoolBuilder: Send, fmt::Debug);
    assert_not_impl_any!(SlotPoolBuilder: Sync);

    #[test]
    fn new_creates_default_state() {
        let builder = SlotPoolBuilder::new();

        assert!(builder.label.is_none());
        assert!(builder.element_size.is_none());
        assert!(builder.capacity.is_none());
        assert!(builder.growth_step.is_none());
        assert_eq!(builder.instances_in_chain.get(), 1);
        assert_eq!(builder.integrity, IntegrityChecking::default());
    }

    #[test]
    fn defaults_are_applied_on_build() {
        let pool = SlotPoolBuilder::new().element_size(16).capacity(10).build();

        assert_eq!(pool.label(), DEFAULT_LABEL);
        assert_eq!(pool.growth_step(), 10);
        assert_eq!(pool.instances_in_chain(), 1);
        assert_eq!(pool.integrity_checking(), IntegrityChecking::default());
    }

    #[test]
    fn settings_are_carried_into_pool() {
        let pool = SlotPoolBuilder::new()
            .label("frames")
            .element_size(24)
            .capacity(8)
            .growth_step(32)
            .instances_in_chain(3)
            .integrity_checking(IntegrityChecking::Disabled)
            .build();

        assert_eq!(pool.label(), "frames");
        assert_eq!(pool.element_size(), 24);
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.growth_step(), 32);
        assert_eq!(pool.instances_in_chain(), 3);
        assert_eq!(pool.integrity_checking(), IntegrityChecking::Disabled);
    }

    #[test]
    fn element_size_of_uses_type_size() {
        let builder = SlotPoolBuilder::new().element_size_of::<[u64; 3]>();

        assert_eq!(builder.element_size.map(NonZero::get), Some(24));
    }

    #[test]
    fn backing_keeps_other_settings() {
        let builder = SlotPoolBuilder::new()
            .label("arena-backed")
            .element_size(8)
            .capacity(4)
            .backing(ArenaBacking::with_capacity(64));

        assert_eq!(builder.label.as_deref(), Some("arena-backed"));
        assert_eq!(builder.element_size.map(NonZero::get), Some(8));
        assert_eq!(builder.capacity.map(NonZero::get), Some(4));
    }

    #[test]
    #[should_panic]
    fn element_size_smaller_than_link_panics() {
        _ = SlotPoolBuilder::new().element_size(LINK_SIZE - 1);
    }

    #[test]
    #[should_panic]
    fn element_size_of_tiny_type_panics() {
        _ = SlotPoolBuilder::new().element_size_of::<u8>();
    }

    #[test]
    #[should_panic]
    fn zero_capacity_panics() {
        _ = SlotPoolBuilder::new().capacity(0);
    }

    #[test]
    #[should_panic]
    fn zero_growth_step_panics() {
        _ = SlotPoolBuilder::new().growth_step(0);
    }

    #[test]
    #[should_panic]
    fn build_without_element_size_panics() {
        _ = SlotPoolBuilder::new().capacity(4).build();
    }

    #[test]
    #[should_panic]
    fn build_without_capacity_panics() {
        _ = SlotPoolBuilder::new().element_size(8).build();
    }

    #[test]
    #[should_panic]
    fn build_with_overflowing_block_size_panics() {
        _ = SlotPoolBuilder::new()
            .element_size(usize::MAX / 2)
            .capacity(3)
            .build();
    }
}
