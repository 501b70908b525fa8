//! Trait seams between providers and strategies
//!
//! A provider hands out fixed-size page-multiple superblocks drawn from
//! OS virtual memory. A strategy carves user-requested bytes out of
//! superblocks checked out from a provider. Strategies are parameterized
//! over any provider implementation, so coarse-grained supply and
//! fine-grained carving can be mixed freely.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::Result;

/// Coarse-grained supplier of fixed-size superblocks
///
/// Thread-safety is an implementation property: implementations that are
/// not `Sync` are single-threaded by construction.
pub trait Provider {
    /// Hand out a superblock of `count` pages
    ///
    /// The returned pointer is page-aligned and stays valid until it is
    /// passed back via [`release`](Provider::release).
    fn provide(&self, count: usize) -> Result<NonNull<u8>>;

    /// Take back a previously provided superblock
    ///
    /// `block` must match a live issuance from this provider.
    fn release(&self, block: NonNull<u8>) -> Result<()>;

    /// Fixed superblock size in bytes
    fn block_size(&self) -> usize;
}

/// Fine-grained allocator carving bytes out of provider superblocks
pub trait Strategy {
    /// Allocate `layout.size()` bytes whose base satisfies
    /// `layout.align()`
    ///
    /// The contents are uninitialized. The pointer stays valid until it
    /// is released (where supported) or the strategy is reset.
    fn find(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Allocate `size` bytes at the minimum (word) alignment
    fn find_sized(&self, size: usize) -> Result<NonNull<u8>>;

    /// Release a pointer previously returned by `find`
    ///
    /// Strategies that do not support per-object release report
    /// [`Error::OperationNotSupported`](crate::error::Error::OperationNotSupported).
    fn release(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Return every superblock to the provider
    ///
    /// Invalidates all outstanding pointers. Idempotent.
    fn reset(&self) -> Result<()>;

    /// Whether `find` honors request alignment
    fn accepts_alignment(&self) -> bool;

    /// Whether `release` is supported for individual pointers
    fn accepts_release(&self) -> bool;
}
