//! Allocator error taxonomy.
//!
//! CAS retries under contention are not errors; nothing here is ever produced
//! by the lock-free loops themselves. The ABI layer maps these variants onto
//! null returns and POSIX error codes.

use thiserror::Error;

/// Failure modes of the fallible allocation entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The page provider could not supply memory.
    #[error("page provider could not supply memory")]
    OutOfMemory,

    /// The requested alignment is not a power of two, or is not a multiple
    /// of the pointer size.
    #[error("invalid alignment for aligned allocation")]
    InvalidAlignment,

    /// A size computation overflowed `usize`.
    #[error("requested size overflows")]
    SizeOverflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        assert_eq!(
            AllocError::OutOfMemory.to_string(),
            "page provider could not supply memory"
        );
        assert_eq!(
            AllocError::InvalidAlignment.to_string(),
            "invalid alignment for aligned allocation"
        );
    }
}
