use std::fmt;
use std::num::NonZero;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use thiserror::Error;

/// A globally unique identifier naming one slot across the whole runtime.
///
/// Every pool binds a contiguous range of identifiers, one per slot, with the slot at index
/// `i` named by `base + i`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Gid(u128);

impl Gid {
    /// Creates an identifier from its raw value.
    #[must_use]
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Returns the raw value of the identifier.
    #[must_use]
    pub const fn get(self) -> u128 {
        self.0
    }

    /// Returns the identifier `offset` places after this one, or `None` on overflow.
    #[must_use]
    pub fn checked_offset(self, offset: usize) -> Option<Self> {
        let offset = u128::try_from(offset).ok()?;
        self.0.checked_add(offset).map(Self)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:016x}, {:016x}}}", self.0 >> 64, self.0 & u128::from(u64::MAX))
    }
}

impl From<u128> for Gid {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

/// Hands out ranges of globally unique identifiers.
///
/// A pool consults its generator at most once, lazily, the first time an identifier is
/// looked up, requesting one identifier per slot. How the generator guarantees that ranges
/// never overlap (e.g. by consensus with other processes) is entirely up to the generator.
#[cfg_attr(test, mockall::automock)]
pub trait IdentifierGenerator: Send + Sync {
    /// Reserves `count` identifiers and returns the first of them.
    ///
    /// The range `[base, base + count)` must never have been issued to anyone else.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be reserved. The error is handed unchanged to
    /// whoever performed the identifier lookup that triggered the request.
    fn request_range(&self, count: NonZero<usize>) -> Result<Gid, IdentifierError>;

    /// Informs the generator that a range obtained from [`request_range()`][Self::request_range]
    /// is no longer in use because the pool that owned it was torn down.
    ///
    /// The default implementation does nothing.
    fn release_range(&self, base: Gid, count: NonZero<usize>) {
        _ = (base, count);
    }
}

/// An identifier generator could not provide a range.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum IdentifierError {
    /// The identifier space has no room for a range of the requested size.
    #[error("identifier space exhausted: cannot reserve a range of {requested} identifiers")]
    RangeExhausted {
        /// The number of identifiers requested.
        requested: usize,
    },

    /// The service behind the generator reported a failure.
    #[error("identifier service failure: {message}")]
    Service {
        /// A human-readable description of the failure.
        message: String,
    },
}

/// Identifier generator that hands out ranges from a counter in the current process.
///
/// Ranges never overlap within the scope of one generator instance. The instance returned by
/// [`shared()`][Self::shared] is the default generator of every pool, so pools that do not
/// specify their own generator never share identifiers.
///
/// The first identifier handed out is `1`; the value `0` is never issued.
#[derive(Debug)]
pub struct LocalIdentifierGenerator {
    next: AtomicU64,
}

static SHARED_GENERATOR: LazyLock<Arc<LocalIdentifierGenerator>> =
    LazyLock::new(|| Arc::new(LocalIdentifierGenerator::new()));

impl LocalIdentifierGenerator {
    /// Creates a generator whose first range starts at `1`.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a generator whose first range starts at `first`.
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the process-wide generator used by pools that do not specify their own.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::clone(&SHARED_GENERATOR)
    }
}

impl Default for LocalIdentifierGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierGenerator for LocalIdentifierGenerator {
    fn request_range(&self, count: NonZero<usize>) -> Result<Gid, IdentifierError> {
        let exhausted = IdentifierError::RangeExhausted {
            requested: count.get(),
        };

        let count = u64::try_from(count.get()).map_err(|_| exhausted.clone())?;

        // Relaxed is enough because the counter does not guard any other memory.
        let base = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                next.checked_add(count)
            })
            .map_err(|_| exhausted)?;

        Ok(Gid::new(u128::from(base)))
    }
}

/// Write-once binding between a pool's slots and a range of identifiers.
#[derive(Debug, Default)]
pub(crate) struct IdentifierBinding {
    base: Option<Gid>,

    /// Whether the base came from the pool's generator (as opposed to being assigned from the
    /// outside), in which case the range is handed back to the generator on teardown.
    requested_from_generator: bool,
}

/// Outcome of attempting to assign a base to an [`IdentifierBinding`].
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum BindOutcome {
    Bound,
    AlreadyBoundToSame,
    Conflict { existing: Gid },
}

impl IdentifierBinding {
    #[must_use]
    pub(crate) fn base(&self) -> Option<Gid> {
        self.base
    }

    /// Assigns a base chosen by the caller.
    pub(crate) fn assign(&mut self, base: Gid) -> BindOutcome {
        match self.base {
            None => {
                self.base = Some(base);
                BindOutcome::Bound
            }
            Some(existing) if existing == base => BindOutcome::AlreadyBoundToSame,
            Some(existing) => BindOutcome::Conflict { existing },
        }
    }

    /// Returns the bound base, first requesting a range of `count` identifiers from
    /// `generator` if nothing is bound yet.
    ///
    /// The second element of the result is `true` if this call performed the binding.
    pub(crate) fn get_or_request(
        &mut self,
        generator: &dyn IdentifierGenerator,
        count: NonZero<usize>,
    ) -> Result<(Gid, bool), IdentifierError> {
        if let Some(base) = self.base {
            return Ok((base, false));
        }

        let base = generator.request_range(count)?;

        self.base = Some(base);
        self.requested_from_generator = true;

        Ok((base, true))
    }

    /// Forgets the binding, returning the base if it was requested from the generator and
    /// therefore needs to be handed back.
    pub(crate) fn unbind(&mut self) -> Option<Gid> {
        let base = self.base.take();
        let requested = std::mem::take(&mut self.requested_from_generator);

        base.filter(|_| requested)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Gid: Send, Sync, Copy, fmt::Debug, fmt::Display);
    assert_impl_all!(LocalIdentifierGenerator: Send, Sync, fmt::Debug);
    assert_impl_all!(IdentifierError: Send, Sync, fmt::Debug, std::error::Error);

    const FOUR: NonZero<usize> = NonZero::new(4).unwrap();

    #[test]
    fn gid_offset() {
        let base = Gid::new(100);

        assert_eq!(base.checked_offset(0), Some(base));
        assert_eq!(base.checked_offset(7), Some(Gid::new(107)));
        assert_eq!(Gid::new(u128::MAX).checked_offset(1), None);
    }

    #[test]
    fn gid_display_shows_both_halves() {
        let gid = Gid::new((1_u128 << 64) | 0x2a);

        assert_eq!(gid.to_string(), "{0000000000000001, 000000000000002a}");
    }

    #[test]
    fn local_generator_hands_out_disjoint_ranges() {
        let generator = LocalIdentifierGenerator::new();

        let a = generator.request_range(FOUR).unwrap();
        let b = generator.request_range(FOUR).unwrap();

        assert_eq!(a, Gid::new(1));
        assert_eq!(b, Gid::new(5));
    }

    #[test]
    fn local_generator_reports_exhaustion() {
        let generator = LocalIdentifierGenerator::starting_at(u64::MAX - 2);

        let result = generator.request_range(FOUR);

        assert_eq!(
            result,
            Err(IdentifierError::RangeExhausted { requested: 4 })
        );

        // The failed request does not consume anything.
        let small = generator.request_range(NonZero::new(2).unwrap());
        assert_eq!(small, Ok(Gid::new(u128::from(u64::MAX - 2))));
    }

    #[test]
    fn local_generator_is_safe_under_contention() {
        let generator = Arc::new(LocalIdentifierGenerator::new());

        let handles = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                thread::spawn(move || {
                    (0..100)
                        .map(|_| generator.request_range(FOUR).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();

        for handle in handles {
            for base in handle.join().unwrap() {
                assert!(seen.insert(base), "range base {base} handed out twice");
                assert_eq!((base.get() - 1) % 4, 0);
            }
        }

        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn shared_generator_is_one_instance() {
        let a = LocalIdentifierGenerator::shared();
        let b = LocalIdentifierGenerator::shared();

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn binding_requests_once() {
        let mut generator = MockIdentifierGenerator::new();
        generator
            .expect_request_range()
            .times(1)
            .returning(|_| Ok(Gid::new(40)));

        let mut binding = IdentifierBinding::default();

        assert_eq!(
            binding.get_or_request(&generator, FOUR),
            Ok((Gid::new(40), true))
        );
        assert_eq!(
            binding.get_or_request(&generator, FOUR),
            Ok((Gid::new(40), false))
        );
        assert_eq!(binding.unbind(), Some(Gid::new(40)));
    }

    #[test]
    fn binding_propagates_generator_failure() {
        let mut generator = MockIdentifierGenerator::new();
        generator.expect_request_range().times(1).returning(|_| {
            Err(IdentifierError::Service {
                message: "resolver unreachable".to_string(),
            })
        });

        let mut binding = IdentifierBinding::default();

        let result = binding.get_or_request(&generator, FOUR);

        assert_eq!(
            result,
            Err(IdentifierError::Service {
                message: "resolver unreachable".to_string()
            })
        );
        assert_eq!(binding.base(), None);
    }

    #[test]
    fn assign_is_write_once() {
        let mut binding = IdentifierBinding::default();

        assert_eq!(binding.assign(Gid::new(9)), BindOutcome::Bound);
        assert_eq!(binding.assign(Gid::new(9)), BindOutcome::AlreadyBoundToSame);
        assert_eq!(
            binding.assign(Gid::new(10)),
            BindOutcome::Conflict {
                existing: Gid::new(9)
            }
        );
        assert_eq!(binding.base(), Some(Gid::new(9)));
    }

    #[test]
    fn assigned_base_is_not_handed_back() {
        let mut binding = IdentifierBinding::default();
        binding.assign(Gid::new(9));

        assert_eq!(binding.unbind(), None);
        assert_eq!(binding.base(), None);
    }

    #[test]
    fn requested_base_is_handed_back() {
        let generator = LocalIdentifierGenerator::new();
        let mut binding = IdentifierBinding::default();

        let (base, _) = binding.get_or_request(&generator, FOUR).unwrap();

        assert_eq!(binding.unbind(), Some(base));
        assert_eq!(binding.unbind(), None);
    }
}
