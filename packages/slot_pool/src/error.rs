use thiserror::Error;

use crate::{BackingError, IdentifierError};

/// Errors that pool operations can return to the caller.
///
/// Running out of slots is not an error: allocation reports it as `Ok(None)`. Misuse of the
/// pool (releasing foreign or already released slots, writing to released slots, using a pool
/// after teardown) is not an error either but a fatal precondition violation that panics.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The backing allocator could not provide the pool's memory block.
    #[error(transparent)]
    Backing(#[from] BackingError),

    /// The identifier generator could not provide the pool's identifier range.
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug, std::error::Error);

    #[test]
    fn wraps_sources_transparently() {
        let backing: Error = BackingError::OutOfMemory { size: 64 }.into();
        assert_eq!(
            backing.to_string(),
            "backing allocator could not provide a block of 64 bytes"
        );

        let identifier: Error = IdentifierError::RangeExhausted { requested: 8 }.into();
        assert_eq!(
            identifier.to_string(),
            "identifier space exhausted: cannot reserve a range of 8 identifiers"
        );
    }
}
