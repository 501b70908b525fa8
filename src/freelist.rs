//! Free-list strategy
//!
//! Carves variable-size chunks out of one provider superblock, tracking
//! the free ones on an intrusive, address-ordered singly-linked list.
//! Allocation splits the chunk the configured fit policy selects;
//! release splices the chunk back in address order and eagerly merges
//! physical neighbors, so the list never holds two adjacent free
//! chunks. A fully reassembled block goes straight back to the
//! provider. Single-threaded; the raw-pointer state keeps the type
//! `!Sync` so concurrent use cannot compile.

use core::alloc::Layout;
use core::cell::Cell;
use core::ptr::NonNull;

use crate::block::{self, BlockHeader, HEADER_SIZE};
use crate::config::{FitPolicy, FreeListConfig, SizePolicy, MIN_ALIGNMENT};
use crate::error::{Error, Result};
use crate::traits::{Provider, Strategy};
use crate::util::{align_down, align_up, is_valid_alignment, is_valid_layout, pages_for};

/// Free-list allocator over a single provider superblock
///
/// `P` supplies the block; the strategy only borrows the provider, so
/// several strategies can share one.
pub struct FreeList<'p, P: Provider> {
    provider: &'p P,
    fit: FitPolicy,
    /// Block size after reconciling the configured size with header
    /// overhead and alignment
    aligned_size: usize,
    /// First (and only) superblock, null until the first find
    block: Cell<*mut BlockHeader>,
    /// Head of the address-ordered free list
    free_list: Cell<*mut BlockHeader>,
}

impl<'p, P: Provider> FreeList<'p, P> {
    /// Create a free-list strategy with the default configuration
    pub fn new(provider: &'p P) -> Self {
        Self::with_config(provider, FreeListConfig::default())
    }

    /// Create a free-list strategy with an explicit configuration
    ///
    /// `config.alignment` must be a power of two no smaller than the
    /// word size; it is normalized up to the word size otherwise.
    pub fn with_config(provider: &'p P, config: FreeListConfig) -> Self {
        let alignment = if is_valid_alignment(config.alignment) {
            config.alignment
        } else {
            MIN_ALIGNMENT
        };

        let aligned_size = match config.size_policy {
            SizePolicy::HaveAtLeastSizeBytes => {
                align_up(config.size + HEADER_SIZE, alignment)
            }
            SizePolicy::NoMoreThanSizeBytes => align_down(config.size, alignment),
        };

        Self {
            provider,
            fit: config.fit,
            aligned_size,
            block: Cell::new(core::ptr::null_mut()),
            free_list: Cell::new(core::ptr::null_mut()),
        }
    }

    /// Block size after header and alignment adjustments
    pub fn block_capacity(&self) -> usize {
        self.aligned_size
    }

    /// Largest request the strategy can ever serve
    fn max_request_size(&self) -> usize {
        self.aligned_size
    }

    /// Check out the superblock and seed the free list with one header
    /// spanning the whole block
    fn init_block_if_unset(&self) -> Result<()> {
        if !self.block.get().is_null() {
            return Ok(());
        }

        let base = self.provider.provide(pages_for(self.aligned_size))?;
        // SAFETY: the provider handed over at least aligned_size
        // writable bytes with page alignment.
        let header = unsafe { block::init_header(base.as_ptr(), self.aligned_size) };

        self.block.set(header);
        self.free_list.set(header);
        Ok(())
    }

    /// Run the configured fit search over the free list
    ///
    /// The list is known non-null here, so a search failure is a bug.
    fn search(&self, request_size: usize) -> Result<Option<block::HeaderPair>> {
        let head = self.free_list.get();
        // SAFETY: head is a live, well-formed free list.
        let found = unsafe {
            match self.fit {
                FitPolicy::FirstFit => block::find_first_fit(head, request_size),
                FitPolicy::BestFit => block::find_best_fit(head, request_size),
                FitPolicy::WorstFit => block::find_worst_fit(head, request_size),
            }
        };

        found.map_err(|failure| {
            log::error!("fit search failed on a live free list: {}", failure);
            Error::Internal
        })
    }

    /// Hand every superblock back to the provider and clear the list
    fn release_all_blocks(&self) -> Result<()> {
        let block = self.block.get();
        if block.is_null() {
            return Ok(());
        }

        self.provider
            .release(NonNull::new(block.cast()).ok_or(Error::Internal)?)?;
        self.block.set(core::ptr::null_mut());
        self.free_list.set(core::ptr::null_mut());
        Ok(())
    }
}

impl<P: Provider> Strategy for FreeList<'_, P> {
    fn find(&self, layout: Layout) -> Result<NonNull<u8>> {
        if !is_valid_layout(layout) {
            return Err(Error::InvalidInput);
        }

        // Chunk boundaries are word multiples, nothing stricter: a
        // request alignment past the word size cannot be honored and is
        // bad alignment for this strategy.
        if layout.align() > MIN_ALIGNMENT {
            return Err(Error::InvalidInput);
        }

        let request_size = align_up(layout.size() + HEADER_SIZE, layout.align());
        if request_size > self.max_request_size() {
            return Err(Error::SizeRequestTooLarge);
        }

        self.init_block_if_unset()?;

        if self.free_list.get().is_null() {
            return Err(Error::NoFreeBlock);
        }

        let Some(fit) = self.search(request_size)? else {
            return Err(Error::NoFreeBlock);
        };

        // SAFETY: the pair came off the live free list and the chunk is
        // exclusively ours once unlinked below.
        unsafe {
            let successor_if_unsplit = (*fit.header).next;
            let tail = block::split_block(fit.header, request_size, layout.align())
                .map_err(|failure| {
                    log::error!("split failed on a fitting chunk: {}", failure);
                    Error::Internal
                })?;
            let successor = tail.unwrap_or(successor_if_unsplit);

            if fit.prev.is_null() {
                self.free_list.set(successor);
            } else {
                (*fit.prev).next = successor;
            }
            (*fit.header).next = core::ptr::null_mut();

            // SAFETY: user bytes start right past the header.
            Ok(NonNull::new_unchecked(block::user_ptr(fit.header)))
        }
    }

    fn find_sized(&self, size: usize) -> Result<NonNull<u8>> {
        match Layout::from_size_align(size, MIN_ALIGNMENT) {
            Ok(layout) => self.find(layout),
            Err(_) => Err(Error::InvalidInput),
        }
    }

    fn release(&self, ptr: NonNull<u8>) -> Result<()> {
        let block_head = self.block.get();
        if block_head.is_null() {
            return Err(Error::InvalidInput);
        }

        let low = block_head as usize;
        let high = low + self.aligned_size;
        let addr = ptr.as_ptr() as usize;
        if addr < low + HEADER_SIZE || addr > high {
            return Err(Error::InvalidInput);
        }

        // SAFETY: the pointer was vetted to sit inside our block past
        // the first header, so the chunk header is in bounds.
        unsafe {
            let header = block::header_of(ptr.as_ptr());

            let head = self.free_list.get();
            if head.is_null() {
                (*header).next = core::ptr::null_mut();
                self.free_list.set(header);
            } else {
                let prior = block::find_prior_block(head, header).map_err(|failure| {
                    log::error!("predecessor search failed on a live free list: {}", failure);
                    Error::Internal
                })?;

                // Merge forward from the freed chunk first, then fold
                // it into an adjacent predecessor; the list never holds
                // two physical neighbors.
                let merged = if prior.is_null() {
                    (*header).next = head;
                    self.free_list.set(header);
                    block::coalesce_block(header)
                } else {
                    (*header).next = (*prior).next;
                    (*prior).next = header;
                    block::coalesce_block(header).and_then(|()| block::coalesce_block(prior))
                };
                merged.map_err(|failure| {
                    log::error!("coalesce failed after splicing a chunk: {}", failure);
                    Error::Internal
                })?;
            }

            // The whole block reassembled; give it back to the provider.
            let head = self.free_list.get();
            if !head.is_null() && (*head).size == self.aligned_size {
                self.release_all_blocks()?;
            }
        }

        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.release_all_blocks()
    }

    fn accepts_alignment(&self) -> bool {
        true
    }

    fn accepts_release(&self) -> bool {
        true
    }
}

impl<P: Provider> Drop for FreeList<'_, P> {
    fn drop(&mut self) {
        // Nothing meaningful to do about a failing provider here.
        let _ = self.reset();
    }
}
