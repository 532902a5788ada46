use crate::Gid;

/// A consistent snapshot of a pool's bookkeeping, captured under the pool's lock.
///
/// Obtained via [`SlotPool::stats()`][crate::SlotPool::stats].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Number of slots handed out over the lifetime of the pool.
    pub total_allocations: u64,

    /// Number of slots returned over the lifetime of the pool.
    pub total_frees: u64,

    /// Number of slots currently handed out.
    pub live: usize,

    /// Number of slots currently available, whether previously used or never touched.
    pub free: usize,

    /// Number of slots that have ever been handed out at least once.
    pub touched: usize,

    /// Whether the pool currently holds its backing block.
    pub has_backing_block: bool,

    /// The first identifier of the pool's identifier range, if one has been bound.
    pub base: Option<Gid>,

    /// Whether the pool has been torn down.
    pub torn_down: bool,
}

impl PoolStats {
    /// Whether the counters balance, i.e. every slot ever handed out has been returned.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.total_allocations == self.total_frees
    }
}
