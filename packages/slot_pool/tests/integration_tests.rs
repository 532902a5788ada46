//! Integration tests for the slot pool, exercising the public API only.

use std::alloc::Layout;
use std::collections::HashSet;
use std::num::NonZero;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use slot_pool::{
    ArenaBacking, BackingAllocator, BackingError, Gid, IdentifierError, IdentifierGenerator,
    Instrumentation, IntegrityChecking, LocalIdentifierGenerator, SlotPool, SystemBacking,
};

const ELEMENT_SIZE: usize = 16;

fn checked_pool(capacity: usize) -> SlotPool {
    SlotPool::builder()
        .label("integration")
        .element_size(ELEMENT_SIZE)
        .capacity(capacity)
        .integrity_checking(IntegrityChecking::Enabled)
        .build()
}

fn offset(pool: &SlotPool, slot: NonNull<u8>) -> usize {
    slot.as_ptr().addr() - pool.base_address().unwrap().as_ptr().addr()
}

fn nz(value: usize) -> NonZero<usize> {
    NonZero::new(value).unwrap()
}

/// Counts how often each backing operation is used.
#[derive(Debug, Default)]
struct CountingBacking {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl BackingAllocator for CountingBacking {
    fn acquire(&self, layout: Layout) -> Result<NonNull<u8>, BackingError> {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        SystemBacking.acquire(layout)
    }

    unsafe fn release(&self, block: NonNull<u8>, layout: Layout) {
        self.released.fetch_add(1, Ordering::Relaxed);

        // SAFETY: Forwarding the guarantees of the caller.
        unsafe {
            SystemBacking.release(block, layout);
        }
    }
}

/// Counts range requests while delegating to a local generator.
#[derive(Debug, Default)]
struct CountingGenerator {
    inner: LocalIdentifierGenerator,
    requests: AtomicUsize,
    releases: AtomicUsize,
}

impl IdentifierGenerator for CountingGenerator {
    fn request_range(&self, count: NonZero<usize>) -> Result<Gid, IdentifierError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.inner.request_range(count)
    }

    fn release_range(&self, _base: Gid, _count: NonZero<usize>) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn capacity_is_exactly_honored() {
    for capacity in [1, 2, 7, 64] {
        let pool = checked_pool(capacity);

        let slots = (0..capacity)
            .map(|_| pool.allocate().unwrap().expect("pool must not be exhausted yet"))
            .collect::<Vec<_>>();

        assert_eq!(pool.allocate().unwrap(), None);
        assert!(!pool.has_capacity());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.live_count(), capacity);

        let distinct = slots.iter().copied().collect::<HashSet<_>>();
        assert_eq!(distinct.len(), capacity);
    }
}

#[test]
fn most_recently_released_slot_is_reused_first() {
    let pool = checked_pool(8);

    let a = pool.allocate().unwrap().unwrap();
    let b = pool.allocate().unwrap().unwrap();

    // SAFETY: Slot came from this pool and is not used afterwards.
    unsafe {
        pool.release(a);
    }

    let c = pool.allocate().unwrap().unwrap();

    assert_eq!(c, a);
    assert_ne!(c, b);
}

#[test]
fn reuse_order_is_last_in_first_out() {
    let pool = checked_pool(8);

    let slots = (0..4)
        .map(|_| pool.allocate().unwrap().unwrap())
        .collect::<Vec<_>>();

    for slot in &slots {
        // SAFETY: Slot came from this pool and is not used afterwards.
        unsafe {
            pool.release(*slot);
        }
    }

    for expected in slots.iter().rev() {
        assert_eq!(pool.allocate().unwrap(), Some(*expected));
    }
}

#[test]
fn scenario_from_reuse_to_exhaustion() {
    let pool = checked_pool(4);

    let p0 = pool.allocate().unwrap().unwrap();
    assert_eq!(offset(&pool, p0), 0);

    let p1 = pool.allocate().unwrap().unwrap();
    assert_eq!(offset(&pool, p1), 16);

    // SAFETY: Slot came from this pool and is not used afterwards.
    unsafe {
        pool.release(p0);
    }

    let p2 = pool.allocate().unwrap().unwrap();
    assert_eq!(p2, p0);

    let p3 = pool.allocate().unwrap().unwrap();
    assert_eq!(offset(&pool, p3), 32);

    // The last never-touched slot is still available.
    let p4 = pool.allocate().unwrap().unwrap();
    assert_eq!(offset(&pool, p4), 48);
    assert_eq!(pool.free_count(), 0);

    assert_eq!(pool.allocate().unwrap(), None);
    assert_eq!(pool.free_count(), 0);
}

#[test]
fn identifiers_are_a_bijection_from_one_request() {
    let generator = Arc::new(CountingGenerator::default());

    let pool = SlotPool::builder()
        .element_size(ELEMENT_SIZE)
        .capacity(16)
        .identifier_generator(generator.clone())
        .build();

    let slots = (0..16)
        .map(|_| pool.allocate().unwrap().unwrap())
        .collect::<Vec<_>>();

    let identifiers = slots
        .iter()
        .map(|slot| pool.identifier_for(*slot).unwrap())
        .collect::<HashSet<_>>();

    assert_eq!(identifiers.len(), 16);

    // Looking up again yields the same identifiers without asking the generator again.
    for slot in &slots {
        assert!(identifiers.contains(&pool.identifier_for(*slot).unwrap()));
    }

    assert_eq!(generator.requests.load(Ordering::Relaxed), 1);

    let base = pool.base().unwrap();
    let expected = (0..16)
        .map(|index| base.checked_offset(index).unwrap())
        .collect::<HashSet<_>>();
    assert_eq!(identifiers, expected);
}

#[test]
fn separate_pools_have_disjoint_identifier_ranges() {
    let generator: Arc<dyn IdentifierGenerator> = Arc::new(LocalIdentifierGenerator::new());

    let pools = (0..4)
        .map(|_| {
            SlotPool::builder()
                .element_size(ELEMENT_SIZE)
                .capacity(8)
                .identifier_generator(Arc::clone(&generator))
                .build()
        })
        .collect::<Vec<_>>();

    let mut seen = HashSet::new();

    for pool in &pools {
        let first = pool.allocate_many(nz(8)).unwrap().unwrap();

        for index in 0..8 {
            // SAFETY: Stays within the eight slots just allocated.
            let slot = unsafe { first.add(index * ELEMENT_SIZE) };
            assert!(seen.insert(pool.identifier_for(slot).unwrap()));
        }
    }

    assert_eq!(seen.len(), 32);
}

#[test]
fn owns_accepts_only_slot_starts() {
    let pool = checked_pool(4);

    let slot = pool.allocate().unwrap().unwrap();
    let start = pool.base_address().unwrap().as_ptr();

    assert_eq!(slot.as_ptr(), start);

    for index in 0..4 {
        assert!(pool.owns(start.wrapping_add(index * ELEMENT_SIZE)));
    }

    assert!(!pool.owns(start.wrapping_sub(ELEMENT_SIZE)));
    assert!(!pool.owns(start.wrapping_sub(1)));
    assert!(!pool.owns(start.wrapping_add(4 * ELEMENT_SIZE)));
    assert!(!pool.owns(start.wrapping_add(1)));
    assert!(!pool.owns(start.wrapping_add(ELEMENT_SIZE + 8)));
}

#[test]
fn owns_is_false_before_first_use() {
    let pool = checked_pool(4);
    let mut local = [0_u8; ELEMENT_SIZE];

    assert!(!pool.owns(local.as_mut_ptr()));
}

#[test]
fn double_release_is_fatal_and_counted_once() {
    let pool = checked_pool(4);

    let slot = pool.allocate().unwrap().unwrap();

    // SAFETY: Slot came from this pool and is not used afterwards.
    unsafe {
        pool.release(slot);
    }

    assert_eq!(pool.free_count(), 4);

    let result = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: Deliberately violating the contract; the pool must detect it.
        unsafe {
            pool.release(slot);
        }
    }));

    let message = result
        .expect_err("second release must panic")
        .downcast::<String>()
        .expect("panic message is a formatted string");

    assert!(message.contains("integration"), "{message}");
    assert!(message.contains("slot 0 released twice"), "{message}");

    assert_eq!(pool.free_count(), 4);
    assert_eq!(pool.stats().total_frees, 1);
}

#[test]
fn double_release_is_fatal_while_other_slots_are_live() {
    // The smallest element size leaves no room for guard bytes beyond the free-list link.
    for element_size in [ELEMENT_SIZE, size_of::<usize>()] {
        let pool = SlotPool::builder()
            .label("integration")
            .element_size(element_size)
            .capacity(4)
            .integrity_checking(IntegrityChecking::Enabled)
            .build();

        let a = pool.allocate().unwrap().unwrap();
        let b = pool.allocate().unwrap().unwrap();

        // SAFETY: Slot came from this pool and is not used afterwards.
        unsafe {
            pool.release(a);
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: Deliberately violating the contract; the pool must detect it.
            unsafe {
                pool.release(a);
            }
        }));

        let message = result
            .expect_err("second release must panic")
            .downcast::<String>()
            .expect("panic message is a formatted string");

        assert!(message.contains("integration"), "{message}");
        assert!(message.contains("slot 0 released twice"), "{message}");

        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.live_count(), 1);

        // The released slot is handed out once, not twice.
        let first = pool.allocate().unwrap().unwrap();
        let second = pool.allocate().unwrap().unwrap();
        assert_eq!(first, a);
        assert_ne!(second, a);
        assert_ne!(second, b);
    }
}

#[test]
fn write_into_released_link_is_fatal_and_names_the_pool() {
    let pool = checked_pool(4);

    let slot = pool.allocate().unwrap().unwrap();

    // SAFETY: Slot came from this pool and is not used afterwards.
    unsafe {
        pool.release(slot);
    }

    // SAFETY: Deliberately violating the contract; the pool must detect it. The write lands
    // inside the pool's memory, where the first field of a caller's value would live.
    unsafe {
        slot.cast::<usize>().write_unaligned(1000);
    }

    for _ in 0..2 {
        let result = catch_unwind(AssertUnwindSafe(|| pool.allocate()));

        let message = result
            .expect_err("reuse of a corrupted slot must panic")
            .downcast::<String>()
            .expect("panic message is a formatted string");

        assert!(message.contains("integration"), "{message}");
        assert!(
            message.contains("slot 0 was written to after it was released"),
            "{message}"
        );
    }

    assert_eq!(pool.free_count(), 4);
}

#[test]
#[should_panic(expected = "was written to after it was released")]
fn write_after_release_is_detected_on_reuse() {
    let pool = checked_pool(4);

    let slot = pool.allocate().unwrap().unwrap();

    // SAFETY: Slot came from this pool and is not used afterwards.
    unsafe {
        pool.release(slot);
    }

    // SAFETY: Deliberately violating the contract; the pool must detect it. The write lands
    // inside the pool's memory, so it is not undefined behavior as far as Rust is concerned.
    unsafe {
        slot.add(ELEMENT_SIZE - 1).write(0);
    }

    _ = pool.allocate();
}

#[test]
#[should_panic(expected = "is not a slot of this pool")]
fn release_of_misaligned_pointer_is_fatal() {
    let pool = checked_pool(4);

    let slot = pool.allocate().unwrap().unwrap();

    // SAFETY: Deliberately violating the contract; the pool must detect it.
    unsafe {
        pool.release(slot.add(4));
    }
}

#[test]
#[should_panic(expected = "is not a slot of this pool")]
fn lookup_of_foreign_pointer_is_fatal() {
    let pool = checked_pool(4);
    _ = pool.allocate().unwrap();

    let mut local = [0_u8; ELEMENT_SIZE];

    _ = pool.identifier_for(NonNull::from(&mut local).cast());
}

#[test]
fn unchecked_pool_behaves_identically() {
    let checked = checked_pool(4);
    let unchecked = SlotPool::builder()
        .element_size(ELEMENT_SIZE)
        .capacity(4)
        .integrity_checking(IntegrityChecking::Disabled)
        .build();

    for pool in [&checked, &unchecked] {
        let a = pool.allocate().unwrap().unwrap();
        let b = pool.allocate().unwrap().unwrap();

        // SAFETY: Slots came from this pool and are not used afterwards.
        unsafe {
            pool.release(a);
        }

        let c = pool.allocate().unwrap().unwrap();
        assert_eq!(c, a);
        assert_eq!(offset(pool, b), 16);
        assert_eq!(pool.live_count(), 2);
    }

    assert_eq!(
        checked.stats().total_allocations,
        unchecked.stats().total_allocations
    );
}

#[test]
fn multi_slot_allocation_is_contiguous_or_nothing() {
    let pool = checked_pool(4);

    let first = pool.allocate_many(nz(3)).unwrap().unwrap();
    assert_eq!(offset(&pool, first), 0);
    assert_eq!(pool.free_count(), 1);

    assert_eq!(pool.allocate_many(nz(2)).unwrap(), None);
    assert_eq!(pool.free_count(), 1);

    // A single slot is still available.
    let last = pool.allocate().unwrap().unwrap();
    assert_eq!(offset(&pool, last), 48);
}

#[test]
fn multi_slot_allocation_larger_than_capacity_reports_exhaustion() {
    let pool = checked_pool(4);

    assert_eq!(pool.allocate_many(nz(5)).unwrap(), None);
    assert_eq!(pool.free_count(), 4);
}

#[test]
fn multi_slot_release_frees_every_slot() {
    let pool = checked_pool(4);

    let first = pool.allocate_many(nz(4)).unwrap().unwrap();

    // SAFETY: The range came from this pool and is not used afterwards.
    unsafe {
        pool.release_many(first, nz(4));
    }

    assert!(pool.is_empty());
    assert_eq!(pool.free_count(), 4);

    // Released slots are only reused one at a time.
    assert_eq!(pool.allocate_many(nz(2)).unwrap(), None);
    assert!(pool.allocate().unwrap().is_some());
}

#[test]
fn teardown_is_idempotent_and_releases_once() {
    let backing = Arc::new(CountingBacking::default());
    let generator = Arc::new(CountingGenerator::default());

    let pool = SlotPool::builder()
        .element_size(ELEMENT_SIZE)
        .capacity(4)
        .backing(Arc::clone(&backing))
        .identifier_generator(generator.clone())
        .build();

    let slot = pool.allocate().unwrap().unwrap();
    _ = pool.identifier_for(slot).unwrap();

    // SAFETY: Slot came from this pool and is not used afterwards.
    unsafe {
        pool.release(slot);
    }

    pool.teardown();
    pool.teardown();

    assert_eq!(backing.acquired.load(Ordering::Relaxed), 1);
    assert_eq!(backing.released.load(Ordering::Relaxed), 1);
    assert_eq!(generator.releases.load(Ordering::Relaxed), 1);

    drop(pool);

    assert_eq!(backing.released.load(Ordering::Relaxed), 1);
    assert_eq!(generator.releases.load(Ordering::Relaxed), 1);
}

#[test]
fn dropping_pool_releases_block() {
    let backing = Arc::new(CountingBacking::default());

    {
        let pool = SlotPool::builder()
            .element_size(ELEMENT_SIZE)
            .capacity(4)
            .backing(Arc::clone(&backing))
            .build();

        // Live slots at drop time are allowed; their memory simply goes away.
        _ = pool.allocate().unwrap();
    }

    assert_eq!(backing.released.load(Ordering::Relaxed), 1);
}

#[test]
fn arena_backed_pools_share_one_region() {
    let arena = Arc::new(ArenaBacking::with_capacity(1024));

    let small = SlotPool::builder()
        .label("small")
        .element_size(16)
        .capacity(8)
        .backing(Arc::clone(&arena))
        .build();

    let large = SlotPool::builder()
        .label("large")
        .element_size(64)
        .capacity(8)
        .backing(Arc::clone(&arena))
        .build();

    let a = small.allocate().unwrap().unwrap();
    let b = large.allocate().unwrap().unwrap();

    assert!(small.owns(a.as_ptr()));
    assert!(!small.owns(b.as_ptr()));
    assert!(large.owns(b.as_ptr()));
    assert_eq!(arena.used_bytes(), 128 + 512);
}

#[test]
fn arena_exhaustion_surfaces_as_error() {
    let arena = Arc::new(ArenaBacking::with_capacity(64));

    let pool = SlotPool::builder()
        .element_size(16)
        .capacity(8)
        .backing(arena)
        .build();

    let error = pool.allocate().unwrap_err();

    assert_eq!(
        error.to_string(),
        "backing allocator could not provide a block of 128 bytes"
    );
}

#[test]
fn instrumentation_sees_every_operation() {
    #[derive(Debug, Default)]
    struct Recorder {
        allocations_started: AtomicUsize,
        allocations_finished: AtomicUsize,
        exhausted: AtomicUsize,
        releases_started: AtomicUsize,
        releases_finished: AtomicUsize,
    }

    impl Instrumentation for Recorder {
        fn allocate_started(&self, label: &str, _count: NonZero<usize>) {
            assert_eq!(label, "observed");
            self.allocations_started.fetch_add(1, Ordering::Relaxed);
        }

        fn allocate_finished(&self, _label: &str, _count: NonZero<usize>, slot: Option<NonNull<u8>>) {
            self.allocations_finished.fetch_add(1, Ordering::Relaxed);

            if slot.is_none() {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
            }
        }

        fn release_started(&self, _label: &str, _slot: NonNull<u8>, _count: NonZero<usize>) {
            self.releases_started.fetch_add(1, Ordering::Relaxed);
        }

        fn release_finished(&self, _label: &str, _slot: NonNull<u8>, _count: NonZero<usize>) {
            self.releases_finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    let recorder = Arc::new(Recorder::default());

    let pool = SlotPool::builder()
        .label("observed")
        .element_size(ELEMENT_SIZE)
        .capacity(1)
        .instrumentation(recorder.clone())
        .build();

    let slot = pool.allocate().unwrap().unwrap();
    assert_eq!(pool.allocate().unwrap(), None);

    // SAFETY: Slot came from this pool and is not used afterwards.
    unsafe {
        pool.release(slot);
    }

    assert_eq!(recorder.allocations_started.load(Ordering::Relaxed), 2);
    assert_eq!(recorder.allocations_finished.load(Ordering::Relaxed), 2);
    assert_eq!(recorder.exhausted.load(Ordering::Relaxed), 1);
    assert_eq!(recorder.releases_started.load(Ordering::Relaxed), 1);
    assert_eq!(recorder.releases_finished.load(Ordering::Relaxed), 1);
}

#[test]
fn slots_hold_caller_data() {
    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Particle {
        position: [f32; 3],
        mass: f32,
    }

    let pool = SlotPool::builder()
        .element_size_of::<Particle>()
        .capacity(32)
        .build();

    let slots = (0..32_u16)
        .map(|index| {
            let slot = pool.allocate().unwrap().unwrap().cast::<Particle>();

            // SAFETY: Slots are sized and aligned for a Particle and exclusively ours.
            unsafe {
                slot.write(Particle {
                    position: [f32::from(index), 0.0, 0.0],
                    mass: 1.0,
                });
            }

            slot
        })
        .collect::<Vec<_>>();

    for (index, slot) in (0..32_u16).zip(&slots) {
        // SAFETY: We wrote a Particle into every slot above.
        let particle = unsafe { slot.read() };
        assert_eq!(particle.position[0], f32::from(index));
    }
}
