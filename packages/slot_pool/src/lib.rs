//! A fixed-size slot pool whose slots are addressable both as raw memory and as globally
//! unique identifiers.
//!
//! A [`SlotPool`] owns one contiguous block of memory, obtained lazily from a pluggable
//! [`BackingAllocator`], and subdivides it into a fixed number of equally sized slots. Slots
//! are handed out and taken back in O(1), reusing the most recently released slot first and
//! only then moving on to capacity that has never been touched. The pool never grows: when it
//! runs out of slots it says so, and creating another pool is up to the caller.
//!
//! Every slot can also be named by a globally unique identifier ([`Gid`]). The pool binds a
//! contiguous range of identifiers once, on demand, by asking an external
//! [`IdentifierGenerator`], and then maps slot index `i` to `base + i`.
//!
//! # Quick start
//!
//! ```
//! use slot_pool::SlotPool;
//!
//! let pool = SlotPool::builder()
//!     .label("actors")
//!     .element_size(64)
//!     .capacity(1024)
//!     .build();
//!
//! let slot = pool.allocate().unwrap().expect("pool has free slots");
//!
//! // SAFETY: The slot is 64 bytes and suitably aligned for a u64.
//! unsafe {
//!     slot.cast::<u64>().write(42);
//! }
//!
//! let id = pool.identifier_for(slot).unwrap();
//! println!("slot {slot:?} is known to the world as {id}");
//!
//! // SAFETY: We do not use the slot after returning it.
//! unsafe {
//!     pool.release(slot);
//! }
//! ```
//!
//! # Misuse detection
//!
//! With [integrity checking][IntegrityChecking] enabled (the default in debug builds), the pool
//! stamps guard bytes into memory it has not handed out and into the payload of every released
//! slot. Releasing a slot twice, or writing to a slot after releasing it, is then detected and
//! reported by a panic naming the pool's label. Releasing a pointer that does not belong to the
//! pool always panics.
//!
//! # Pluggable collaborators
//!
//! - [`BackingAllocator`] provides the memory block. [`SystemBacking`] (the default) uses the
//!   global Rust allocator, [`ArenaBacking`] carves blocks out of a region reserved up front.
//! - [`IdentifierGenerator`] provides identifier ranges. [`LocalIdentifierGenerator`] (the
//!   default) hands out ranges from a counter in the current process.
//! - [`Instrumentation`] is notified on entry to and exit from every allocation and release.
//!
//! # Logging
//!
//! The pool emits [`tracing`] events when it acquires its backing block, binds an identifier
//! range and is torn down (with a warning if slots were still allocated at that point).

mod backing;
mod builder;
mod error;
mod identifier;
mod instrumentation;
mod integrity;
mod pool;
mod slots;
mod stats;
mod violation;

pub use backing::*;
pub use builder::SlotPoolBuilder;
pub use error::*;
pub use identifier::{Gid, IdentifierError, IdentifierGenerator, LocalIdentifierGenerator};
pub use instrumentation::*;
pub use integrity::IntegrityChecking;
pub use pool::SlotPool;
pub use stats::*;
pub(crate) use violation::*;
