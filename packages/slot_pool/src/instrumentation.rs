use std::num::NonZero;
use std::ptr::NonNull;

/// Receives notifications on entry to and exit from pool allocation and release, for
/// external profiling.
///
/// Every method has an empty default implementation, so an implementation only needs to
/// override what it is interested in. Notifications are delivered outside the pool's lock and
/// have no influence on pool behavior.
///
/// # Example
///
/// ```
/// use std::num::NonZero;
/// use std::ptr::NonNull;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use slot_pool::{Instrumentation, SlotPool};
///
/// #[derive(Debug, Default)]
/// struct CountAllocations(AtomicUsize);
///
/// impl Instrumentation for CountAllocations {
///     fn allocate_finished(
///         &self,
///         _label: &str,
///         _count: NonZero<usize>,
///         slot: Option<NonNull<u8>>,
///     ) {
///         if slot.is_some() {
///             self.0.fetch_add(1, Ordering::Relaxed);
///         }
///     }
/// }
///
/// let counter = Arc::new(CountAllocations::default());
///
/// let pool = SlotPool::builder()
///     .element_size(16)
///     .capacity(2)
///     .instrumentation(counter.clone())
///     .build();
///
/// _ = pool.allocate().unwrap();
/// _ = pool.allocate().unwrap();
/// _ = pool.allocate().unwrap(); // Exhausted.
///
/// assert_eq!(counter.0.load(Ordering::Relaxed), 2);
/// ```
pub trait Instrumentation: Send + Sync {
    /// An allocation of `count` contiguous slots is about to start.
    fn allocate_started(&self, label: &str, count: NonZero<usize>) {
        _ = (label, count);
    }

    /// An allocation of `count` contiguous slots has finished, yielding `slot` or `None` if
    /// the pool was exhausted or the backing allocator failed.
    fn allocate_finished(&self, label: &str, count: NonZero<usize>, slot: Option<NonNull<u8>>) {
        _ = (label, count, slot);
    }

    /// A release of `count` contiguous slots starting at `slot` is about to start.
    fn release_started(&self, label: &str, slot: NonNull<u8>, count: NonZero<usize>) {
        _ = (label, slot, count);
    }

    /// A release of `count` contiguous slots starting at `slot` has finished.
    fn release_finished(&self, label: &str, slot: NonNull<u8>, count: NonZero<usize>) {
        _ = (label, slot, count);
    }
}

/// Instrumentation that ignores every notification. This is the default for pools.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {}
