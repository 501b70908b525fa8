//! Single-threaded page provider
//!
//! Hands out page-multiple superblocks fetched straight from the OS and
//! tracks every outstanding issuance in a chain of page-resident block
//! maps. Unlike the lock-free variant there is no up-front reservation:
//! each `provide` is its own mapping, so counts above one page are
//! supported. Not thread-safe; the raw-pointer state keeps the type
//! `!Sync` so concurrent use cannot compile.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::block_map::{self, BlockMap};
use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::traits::Provider;
use crate::vmem::{self, VirtualAddressRange};

/// Single-threaded provider of page-multiple superblocks
pub struct UnsynchronizedPage {
    /// Head of the block-map chain; maps fill head-first
    head: Cell<*mut BlockMap>,
}

impl UnsynchronizedPage {
    /// Create a provider with an empty tracking chain
    pub fn new() -> Self {
        Self {
            head: Cell::new(core::ptr::null_mut()),
        }
    }

    /// Make sure the head map has a free slot, chaining a fresh map page
    /// when it does not
    fn ensure_map_space(&self) -> Result<()> {
        let head = self.head.get();
        // SAFETY: a non-null head always points at a live map page owned
        // by this provider.
        if !head.is_null() && !unsafe { (*head).is_full() } {
            return Ok(());
        }

        let range = vmem::fetch_pages(1).map_err(Error::from)?;
        // SAFETY: the page was just mapped writable and is exclusively
        // ours.
        let map = unsafe { block_map::as_block_map(range.base()) };
        // SAFETY: as_block_map produced a valid empty map.
        unsafe {
            (*map).set_next(head);
        }
        self.head.set(map);

        log::debug!("chained a fresh block-map page at {:#x}", range.address());
        Ok(())
    }
}

impl Provider for UnsynchronizedPage {
    fn provide(&self, count: usize) -> Result<NonNull<u8>> {
        if count == 0 || count > VirtualAddressRange::MAX_PAGE_COUNT {
            return Err(Error::InvalidInput);
        }

        self.ensure_map_space()?;

        let range = vmem::fetch_pages(count).map_err(Error::from)?;

        // SAFETY: ensure_map_space left a live head with a free slot.
        let inserted = unsafe { (*self.head.get()).insert(range) };
        if !inserted {
            // A slot was just guaranteed; failing here is a bug.
            log::error!("block map rejected an insert with free capacity");
            let _ = vmem::return_pages(range);
            return Err(Error::Internal);
        }

        // SAFETY: a fetched range has a non-null base.
        Ok(unsafe { NonNull::new_unchecked(range.base()) })
    }

    fn release(&self, block: NonNull<u8>) -> Result<()> {
        let address = block.as_ptr() as u64;

        let mut map = self.head.get();
        while !map.is_null() {
            // SAFETY: chain nodes are live map pages owned by this
            // provider.
            unsafe {
                if let Some(range) = (*map).take(address) {
                    vmem::return_pages(range).map_err(|_| Error::Internal)?;
                    return Ok(());
                }
                map = (*map).next();
            }
        }

        Err(Error::InvalidInput)
    }

    fn block_size(&self) -> usize {
        PAGE_SIZE
    }
}

impl Default for UnsynchronizedPage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UnsynchronizedPage {
    fn drop(&mut self) {
        let mut outstanding = 0;
        let mut map = self.head.get();
        while !map.is_null() {
            // SAFETY: chain nodes are live map pages; next is read
            // before the node's own page is unmapped.
            unsafe {
                outstanding += (*map).len();
                let next = (*map).next();
                let _ = vmem::return_pages(VirtualAddressRange::new(map as usize, 1));
                map = next;
            }
        }

        if outstanding > 0 {
            // Superblocks the caller never returned stay mapped; only
            // the tracking pages go away.
            log::debug!("leaking {} superblocks still outstanding", outstanding);
        }
    }
}
