use std::fmt;

use crate::Gid;

/// A precondition violation detected while holding a pool's lock.
///
/// Detection happens under the lock, before any state is modified. The violation is raised
/// only after the lock has been released, so the pool is left exactly as it was before the
/// offending call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Violation {
    /// The address does not point at the start of a slot of this pool.
    ForeignPointer { address: usize },

    /// The slot has never been handed out, so it cannot be live.
    NeverAllocated { index: usize },

    /// The slot already carries the "freed" stamp.
    DoubleRelease { index: usize },

    /// The "freed" stamp of a slot on the free list was disturbed before the slot was reused.
    WriteAfterFree { index: usize },

    /// The pool has already been torn down.
    UseAfterTeardown,

    /// An identifier base was assigned to a pool that already has a different one.
    ConflictingBase { existing: Gid, requested: Gid },
}

impl Violation {
    /// Terminates the current operation with a diagnostic naming the pool.
    #[cold]
    pub(crate) fn raise(self, label: &str) -> ! {
        panic!("slot pool '{label}': {self}");
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForeignPointer { address } => {
                write!(f, "address {address:#x} is not a slot of this pool")
            }
            Self::NeverAllocated { index } => {
                write!(f, "slot {index} was never allocated")
            }
            Self::DoubleRelease { index } => {
                write!(f, "slot {index} released twice")
            }
            Self::WriteAfterFree { index } => {
                write!(f, "slot {index} was written to after it was released")
            }
            Self::UseAfterTeardown => write!(f, "pool used after teardown"),
            Self::ConflictingBase {
                existing,
                requested,
            } => write!(
                f,
                "identifier base {requested} conflicts with already bound base {existing}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_culprit() {
        assert_eq!(
            Violation::ForeignPointer { address: 0x1000 }.to_string(),
            "address 0x1000 is not a slot of this pool"
        );
        assert_eq!(
            Violation::DoubleRelease { index: 3 }.to_string(),
            "slot 3 released twice"
        );
        assert_eq!(
            Violation::WriteAfterFree { index: 5 }.to_string(),
            "slot 5 was written to after it was released"
        );
    }

    #[test]
    #[should_panic(expected = "slot pool 'widgets': slot 2 released twice")]
    fn raise_includes_label() {
        Violation::DoubleRelease { index: 2 }.raise("widgets");
    }
}
