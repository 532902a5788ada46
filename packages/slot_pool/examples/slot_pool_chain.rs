//! Demonstrates how a caller can chain `SlotPool` instances to serve more objects than one
//! pool holds, using the growth step hint to size each new pool and retiring pools that have
//! been fully drained.

use std::ptr::NonNull;
use std::sync::Arc;

use slot_pool::{IdentifierGenerator, LocalIdentifierGenerator, SlotPool};

/// Grows by appending new pools whenever every existing pool is exhausted.
struct PoolChain {
    pools: Vec<SlotPool>,
    generator: Arc<dyn IdentifierGenerator>,
    element_size: usize,
    next_capacity: usize,
}

impl PoolChain {
    fn new(element_size: usize, initial_capacity: usize) -> Self {
        Self {
            pools: Vec::new(),
            generator: Arc::new(LocalIdentifierGenerator::new()),
            element_size,
            next_capacity: initial_capacity,
        }
    }

    fn allocate(&mut self) -> NonNull<u8> {
        for pool in &self.pools {
            if let Some(slot) = pool.allocate().expect("system allocator failed") {
                return slot;
            }
        }

        let instance = self.pools.len() + 1;
        let capacity = self.next_capacity;

        let pool = SlotPool::builder()
            .label(format!("chain#{instance}"))
            .element_size(self.element_size)
            .capacity(capacity)
            .growth_step(capacity * 2)
            .instances_in_chain(instance)
            .identifier_generator(Arc::clone(&self.generator))
            .build();

        println!(
            "  created {} with capacity {capacity}, next pool will hold {}",
            pool.label(),
            pool.growth_step()
        );

        self.next_capacity = pool.growth_step();

        let slot = pool
            .allocate()
            .expect("system allocator failed")
            .expect("a fresh pool has free slots");

        self.pools.push(pool);
        slot
    }

    fn release(&mut self, slot: NonNull<u8>) {
        let pool = self
            .pools
            .iter()
            .find(|pool| pool.owns(slot.as_ptr()))
            .expect("slot belongs to one of the pools in the chain");

        // SAFETY: The slot came from this pool and the caller no longer uses it.
        unsafe {
            pool.release(slot);
        }
    }

    fn retire_drained(&mut self) {
        self.pools.retain(|pool| {
            let retired = pool.try_retire();

            if retired {
                println!("  retired {}", pool.label());
            }

            !retired
        });
    }
}

fn main() {
    println!("=== SlotPool chaining example ===");
    println!();

    let mut chain = PoolChain::new(32, 4);

    println!("Allocating 20 slots:");
    let slots = (0..20).map(|_| chain.allocate()).collect::<Vec<_>>();

    for pool in &chain.pools {
        let stats = pool.stats();
        println!(
            "  {}: {} live, {} free",
            pool.label(),
            stats.live,
            stats.free
        );
    }

    println!();
    println!("Identifiers of the first and last slot:");

    let first = slots.first().expect("we allocated slots");
    let last = slots.last().expect("we allocated slots");

    for slot in [first, last] {
        let pool = chain
            .pools
            .iter()
            .find(|pool| pool.owns(slot.as_ptr()))
            .expect("slot belongs to the chain");

        println!(
            "  {slot:?} -> {}",
            pool.identifier_for(*slot).expect("identifier range available")
        );
    }

    println!();
    println!("Releasing everything and retiring drained pools:");

    for slot in slots {
        chain.release(slot);
    }

    chain.retire_drained();

    println!();
    println!("{} pools remain in the chain", chain.pools.len());
}
