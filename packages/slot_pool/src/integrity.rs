use std::ptr::NonNull;
use std::slice;

/// Byte stamped over memory that no caller has been handed yet.
pub(crate) const UNTOUCHED_PATTERN: u8 = 0xCC;

/// Byte stamped over the payload of a slot when it is released.
pub(crate) const FREED_PATTERN: u8 = 0xDD;

/// Whether a pool stamps guard bytes into its memory to detect misuse.
///
/// When enabled, the pool fills never-allocated memory with one byte pattern and the payload
/// of every released slot with another, and remembers which slots are released. It then
/// detects:
///
/// * a slot being released twice (the slot is already marked as released);
/// * a slot being written to after it was released (the "freed" pattern is disturbed, or the
///   free-list link at the start of the slot no longer refers to a released slot, by the time
///   the slot is handed out again).
///
/// Write-after-free detection is best-effort: a write that stores exactly the "freed" pattern,
/// or a link value that happens to name another released slot, goes unnoticed.
///
/// Disabling integrity checking changes no functional outcome, it only removes the checks and
/// the memory stamping that supports them.
///
/// The default is [`Enabled`][Self::Enabled] in builds with debug assertions and
/// [`Disabled`][Self::Disabled] otherwise.
///
/// # Example
///
/// ```
/// use slot_pool::{IntegrityChecking, SlotPool};
///
/// let pool = SlotPool::builder()
///     .element_size(32)
///     .capacity(8)
///     .integrity_checking(IntegrityChecking::Enabled)
///     .build();
///
/// assert_eq!(pool.integrity_checking(), IntegrityChecking::Enabled);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum IntegrityChecking {
    /// Guard bytes are stamped and verified on every allocation and release.
    Enabled,

    /// No guard bytes are stamped and no misuse detection takes place.
    Disabled,
}

impl Default for IntegrityChecking {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl IntegrityChecking {
    /// Whether guard bytes are stamped and verified.
    #[must_use]
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Stamps `len` bytes starting at `start` as never handed out.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `len` writable bytes starting at `start`.
    pub(crate) unsafe fn stamp_untouched(self, start: NonNull<u8>, len: usize) {
        if self.is_enabled() {
            // SAFETY: Forwarding the guarantees of the caller.
            unsafe {
                fill(start, len, UNTOUCHED_PATTERN);
            }
        }
    }

    /// Stamps the payload of a released slot.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `payload_len` writable bytes starting
    /// at `payload`.
    pub(crate) unsafe fn stamp_freed(self, payload: NonNull<u8>, payload_len: usize) {
        if self.is_enabled() {
            // SAFETY: Forwarding the guarantees of the caller.
            unsafe {
                fill(payload, payload_len, FREED_PATTERN);
            }
        }
    }

    /// Whether a slot on the free list still carries an intact "freed" stamp, meaning nobody
    /// wrote into it since it was released.
    ///
    /// Always `true` when checking is disabled.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to `payload_len` readable bytes starting
    /// at `payload`.
    #[must_use]
    pub(crate) unsafe fn is_freed_stamp_intact(
        self,
        payload: NonNull<u8>,
        payload_len: usize,
    ) -> bool {
        if !self.is_enabled() {
            return true;
        }

        // SAFETY: Forwarding the guarantees of the caller.
        unsafe { is_filled_with(payload, payload_len, FREED_PATTERN) }
    }
}

/// # Safety
///
/// The caller must have exclusive access to `len` writable bytes starting at `start`.
unsafe fn fill(start: NonNull<u8>, len: usize, pattern: u8) {
    // SAFETY: Forwarding the guarantees of the caller.
    unsafe {
        start.write_bytes(pattern, len);
    }
}

/// # Safety
///
/// The caller must have exclusive access to `len` readable bytes starting at `start`.
unsafe fn is_filled_with(start: NonNull<u8>, len: usize, pattern: u8) -> bool {
    // SAFETY: Forwarding the guarantees of the caller. Every byte of pool memory is initialized
    // because the pool stamps the whole block before handing out anything when checking is on,
    // and checking is on whenever this function is reached.
    let bytes = unsafe { slice::from_raw_parts(start.as_ptr(), len) };

    bytes.iter().all(|&b| b == pattern)
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use super::*;

    #[test]
    fn default_follows_debug_assertions() {
        assert_eq!(
            IntegrityChecking::default().is_enabled(),
            cfg!(debug_assertions)
        );
    }

    #[test]
    fn enabled_stamps_untouched_pattern() {
        let mut buffer = [0_u8; 24];
        let start = NonNull::from(&mut buffer).cast::<u8>();

        unsafe {
            IntegrityChecking::Enabled.stamp_untouched(start, 24);
        }

        assert!(buffer.iter().all(|&b| b == UNTOUCHED_PATTERN));
    }

    #[test]
    fn disabled_leaves_memory_alone() {
        let mut buffer = [7_u8; 24];
        let start = NonNull::from(&mut buffer).cast::<u8>();

        unsafe {
            IntegrityChecking::Disabled.stamp_untouched(start, 24);
            IntegrityChecking::Disabled.stamp_freed(start, 24);
        }

        assert!(buffer.iter().all(|&b| b == 7));
    }

    #[test]
    fn freed_stamp_is_recognized() {
        let mut buffer = [0_u8; 16];
        let start = NonNull::from(&mut buffer).cast::<u8>();

        let checking = IntegrityChecking::Enabled;

        unsafe {
            assert!(!checking.is_freed_stamp_intact(start, 16));

            checking.stamp_freed(start, 16);

            assert!(checking.is_freed_stamp_intact(start, 16));
        }
    }

    #[test]
    fn single_disturbed_byte_breaks_freed_stamp() {
        let mut buffer = [0_u8; 16];
        let start = NonNull::from(&mut buffer).cast::<u8>();

        let checking = IntegrityChecking::Enabled;

        unsafe {
            checking.stamp_freed(start, 16);
        }

        buffer[9] = 0;
        let start = NonNull::from(&mut buffer).cast::<u8>();

        unsafe {
            assert!(!checking.is_freed_stamp_intact(start, 16));
        }
    }

    #[test]
    fn empty_payload_is_always_intact() {
        let mut buffer = [0_u8; 1];
        let start = NonNull::from(&mut buffer).cast::<u8>();

        unsafe {
            assert!(IntegrityChecking::Enabled.is_freed_stamp_intact(start, 0));
        }
    }

    #[test]
    fn disabled_reports_nothing() {
        let mut buffer = [0_u8; 8];
        let start = NonNull::from(&mut buffer).cast::<u8>();

        unsafe {
            assert!(IntegrityChecking::Disabled.is_freed_stamp_intact(start, 8));
        }
    }
}
