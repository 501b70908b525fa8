//! Page-resident map of outstanding address ranges
//!
//! A `BlockMap` lives inside a single provider-owned page and tracks
//! [`VirtualAddressRange`] records by base address, using open addressing
//! with linear probing. Maps chain through a header pointer when one
//! page's worth of slots fills up.

use core::ptr;

use crate::config::PAGE_SIZE;
use crate::vmem::VirtualAddressRange;

const ENTRY_SIZE: usize = core::mem::size_of::<VirtualAddressRange>();

// Bitmap sized from an upper estimate of how many entries a page could
// hold; the real capacity accounts for the header itself.
const ESTIMATED_CAPACITY: usize = PAGE_SIZE / ENTRY_SIZE;
const BITMAP_WORDS: usize = ESTIMATED_CAPACITY.div_ceil(64);

#[repr(C)]
struct Header {
    next: *mut BlockMap,
    occupied: [u64; BITMAP_WORDS],
}

/// Number of records a single map page can hold
pub(crate) const CAPACITY: usize = (PAGE_SIZE - core::mem::size_of::<Header>()) / ENTRY_SIZE;

/// Fixed-capacity open-addressing map of address ranges, keyed by base
/// address
#[repr(C)]
pub(crate) struct BlockMap {
    header: Header,
    entries: [VirtualAddressRange; CAPACITY],
}

const _: () = assert!(core::mem::size_of::<BlockMap>() <= PAGE_SIZE);

impl BlockMap {
    /// Multiplicative hash of a page-granular address key
    fn hash(address: u64) -> usize {
        let shifted = address >> PAGE_SIZE.trailing_zeros();
        (shifted.wrapping_mul(0x9e37_79b9_7f4a_7c15) % CAPACITY as u64) as usize
    }

    fn is_occupied(&self, index: usize) -> bool {
        self.header.occupied[index / 64] >> (index % 64) & 1 == 1
    }

    fn set_occupied(&mut self, index: usize) {
        self.header.occupied[index / 64] |= 1 << (index % 64);
    }

    fn clear_occupied(&mut self, index: usize) {
        self.header.occupied[index / 64] &= !(1 << (index % 64));
    }

    /// Number of records currently stored
    pub fn len(&self) -> usize {
        self.header
            .occupied
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == CAPACITY
    }

    pub fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Next map in the chain, null at the tail
    pub fn next(&self) -> *mut BlockMap {
        self.header.next
    }

    pub fn set_next(&mut self, next: *mut BlockMap) {
        self.header.next = next;
    }

    /// Store a record; fails when every slot is occupied
    pub fn insert(&mut self, range: VirtualAddressRange) -> bool {
        let start = Self::hash(range.address() as u64);
        let mut probe = start;

        if self.is_occupied(probe) {
            loop {
                probe = (probe + 1) % CAPACITY;
                if probe == start || !self.is_occupied(probe) {
                    break;
                }
            }
            if probe == start {
                return false;
            }
        }

        self.entries[probe] = range;
        self.set_occupied(probe);
        true
    }

    /// Remove and return the record keyed by `address`
    pub fn take(&mut self, address: u64) -> Option<VirtualAddressRange> {
        let index = self.locate(address)?;
        let value = self.entries[index];
        self.clear_occupied(index);
        Some(value)
    }

    fn locate(&self, address: u64) -> Option<usize> {
        let start = Self::hash(address);
        let mut probe = start;

        loop {
            // The probe does not stop at unoccupied slots, only at the
            // first occupied slot holding a foreign key. Stopping at
            // holes would yield false negatives after a removal punches
            // a gap into a collision run.
            if self.is_occupied(probe) {
                if self.entries[probe].address() as u64 == address {
                    return Some(probe);
                }
                return None;
            }

            probe = (probe + 1) % CAPACITY;
            if probe == start {
                return None;
            }
        }
    }
}

/// Reinterpret a provider-owned page as an empty `BlockMap`
///
/// # Safety
/// `page` must point at `PAGE_SIZE` writable bytes with page alignment,
/// exclusively owned by the caller.
pub(crate) unsafe fn as_block_map(page: *mut u8) -> *mut BlockMap {
    // SAFETY: caller hands over the whole page; zeroing it produces a
    // valid empty map (no occupied bits, null chain pointer).
    unsafe {
        ptr::write_bytes(page, 0, PAGE_SIZE);
    }
    page.cast()
}
