//! OS page facade
//!
//! The single point where the crate touches the operating system. Pages
//! are reserved as anonymous private read/write mappings and released
//! exactly as obtained. Every higher layer treats the returned ranges as
//! opaque ownership tokens.

use core::fmt;
use core::ptr;

use crate::config::PAGE_SIZE;
use crate::error::{Failable, Failure};

/// A contiguous region of page-aligned virtual memory
///
/// Packed into a single 64-bit word: the low 48 bits hold the base
/// address, the high 16 bits the page count. The total size in bytes is
/// `page_count * PAGE_SIZE`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VirtualAddressRange(u64);

impl VirtualAddressRange {
    /// Largest page count a range can carry
    pub const MAX_PAGE_COUNT: usize = (1 << 16) - 1;

    const ADDRESS_BITS: u32 = 48;
    const ADDRESS_MASK: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// Pack `address` and `count` into a range
    ///
    /// `address` must fit in 48 bits and `count` in 16 bits.
    pub fn new(address: usize, count: usize) -> Self {
        debug_assert!(count > 0 && count <= Self::MAX_PAGE_COUNT);
        debug_assert!(address as u64 <= Self::ADDRESS_MASK);
        Self((count as u64) << Self::ADDRESS_BITS | address as u64)
    }

    /// Base address of the range
    pub fn address(self) -> usize {
        (self.0 & Self::ADDRESS_MASK) as usize
    }

    /// Number of pages in the range
    pub fn page_count(self) -> usize {
        (self.0 >> Self::ADDRESS_BITS) as usize
    }

    /// Total size in bytes
    pub fn size_bytes(self) -> usize {
        self.page_count() * PAGE_SIZE
    }

    /// Base address as a byte pointer
    pub fn base(self) -> *mut u8 {
        self.address() as *mut u8
    }

    /// Whether `addr` falls inside the range
    pub fn contains(self, addr: usize) -> bool {
        addr >= self.address() && addr < self.address() + self.size_bytes()
    }
}

impl fmt::Debug for VirtualAddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualAddressRange")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("page_count", &self.page_count())
            .finish()
    }
}

/// Native page size in bytes for this build
pub const fn page_size() -> usize {
    PAGE_SIZE
}

/// Reserve `count` pages of anonymous read/write memory
///
/// The returned base is page-aligned by the OS mapping contract.
pub fn fetch_pages(count: usize) -> Failable<VirtualAddressRange> {
    if count == 0 || count > VirtualAddressRange::MAX_PAGE_COUNT {
        return Err(Failure::InvalidSize);
    }

    let size = count * PAGE_SIZE;

    // SAFETY: anonymous private mapping with no file descriptor; the OS
    // picks the placement, so no existing mapping can be clobbered.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        log::error!("mmap refused a reservation of {} pages", count);
        return Err(Failure::AllocationFailed);
    }

    Ok(VirtualAddressRange::new(addr as usize, count))
}

/// Release a range previously obtained from [`fetch_pages`]
///
/// The range must be released whole, exactly as fetched.
pub fn return_pages(range: VirtualAddressRange) -> Failable<()> {
    // SAFETY: the range came out of fetch_pages and covers exactly the
    // mapping established there.
    let rc = unsafe { libc::munmap(range.base().cast(), range.size_bytes()) };
    if rc != 0 {
        log::error!(
            "munmap refused to release {} pages at {:#x}",
            range.page_count(),
            range.address()
        );
        return Err(Failure::ReleaseFailed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_packs_address_and_count() {
        let range = VirtualAddressRange::new(0x7000_0000, 3);
        assert_eq!(range.address(), 0x7000_0000);
        assert_eq!(range.page_count(), 3);
        assert_eq!(range.size_bytes(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_range_contains() {
        let range = VirtualAddressRange::new(0x1000_0000, 2);
        assert!(range.contains(0x1000_0000));
        assert!(range.contains(0x1000_0000 + 2 * PAGE_SIZE - 1));
        assert!(!range.contains(0x1000_0000 + 2 * PAGE_SIZE));
        assert!(!range.contains(0x0fff_ffff));
    }

    #[test]
    fn test_fetch_rejects_zero_pages() {
        assert_eq!(fetch_pages(0), Err(Failure::InvalidSize));
    }

    #[test]
    fn test_fetch_rejects_oversized_request() {
        assert_eq!(
            fetch_pages(VirtualAddressRange::MAX_PAGE_COUNT + 1),
            Err(Failure::InvalidSize)
        );
    }

    #[test]
    fn test_fetch_and_return_roundtrip() {
        let range = fetch_pages(2).unwrap();
        assert_eq!(range.page_count(), 2);
        assert_eq!(range.address() % PAGE_SIZE, 0);

        // Anonymous mappings are zero-filled and writable.
        // SAFETY: the range was just mapped read/write.
        unsafe {
            assert_eq!(*range.base(), 0);
            range.base().write(0xAB);
            assert_eq!(*range.base(), 0xAB);
        }

        assert!(return_pages(range).is_ok());
    }
}
