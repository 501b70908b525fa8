//! Error types for the allocator stack

use core::fmt;

/// Errors surfaced by providers and strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Input was malformed; the exact problem depends on the operation
    InvalidInput,
    /// Request exceeds the largest size the strategy can serve
    SizeRequestTooLarge,
    /// The configured capacity was reached and growth is disabled
    ReachedMemoryLimit,
    /// No free block could satisfy the request
    NoFreeBlock,
    /// The operating system refused to hand out more memory
    OutOfMemory,
    /// Operation is not supported by this allocator
    OperationNotSupported,
    /// Unexpected internal error; a bug if ever observed
    Internal,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput => write!(f, "invalid input"),
            Self::SizeRequestTooLarge => write!(f, "size request too large"),
            Self::ReachedMemoryLimit => write!(f, "reached configured memory limit"),
            Self::NoFreeBlock => write!(f, "no free block available"),
            Self::OutOfMemory => write!(f, "operating system is out of memory"),
            Self::OperationNotSupported => write!(f, "operation not supported"),
            Self::Internal => write!(f, "unexpected internal error"),
        }
    }
}

impl std::error::Error for Error {}

/// Failures encountered by internal operations, below the public surface
///
/// Providers translate these into the public [`Error`] set before they
/// escape the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// A required block header pointer was null
    HeaderIsNullptr,
    /// A size argument was zero or out of range
    InvalidSize,
    /// An alignment argument was not a power of two at least word-sized
    InvalidAlignment,
    /// A block was too small to carve the requested chunk out of
    BlockTooSmall,
    /// The OS page-reservation call failed
    AllocationFailed,
    /// The OS page-release call failed
    ReleaseFailed,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderIsNullptr => write!(f, "block header is null"),
            Self::InvalidSize => write!(f, "invalid size"),
            Self::InvalidAlignment => write!(f, "invalid alignment"),
            Self::BlockTooSmall => write!(f, "block too small"),
            Self::AllocationFailed => write!(f, "page reservation failed"),
            Self::ReleaseFailed => write!(f, "page release failed"),
        }
    }
}

impl std::error::Error for Failure {}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::AllocationFailed => Error::OutOfMemory,
            Failure::ReleaseFailed => Error::Internal,
            Failure::InvalidSize | Failure::InvalidAlignment => Error::InvalidInput,
            Failure::HeaderIsNullptr | Failure::BlockTooSmall => Error::Internal,
        }
    }
}

/// Result alias for fallible public operations
pub type Result<T> = core::result::Result<T, Error>;

/// Result alias for fallible internal operations
pub type Failable<T> = core::result::Result<T, Failure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_maps_to_public_error() {
        assert_eq!(Error::from(Failure::AllocationFailed), Error::OutOfMemory);
        assert_eq!(Error::from(Failure::ReleaseFailed), Error::Internal);
        assert_eq!(Error::from(Failure::InvalidSize), Error::InvalidInput);
        assert_eq!(Error::from(Failure::InvalidAlignment), Error::InvalidInput);
        assert_eq!(Error::from(Failure::HeaderIsNullptr), Error::Internal);
        assert_eq!(Error::from(Failure::BlockTooSmall), Error::Internal);
    }

    #[test]
    fn test_display_is_lowercase_prose() {
        assert_eq!(Error::NoFreeBlock.to_string(), "no free block available");
        assert_eq!(Failure::ReleaseFailed.to_string(), "page release failed");
    }
}
