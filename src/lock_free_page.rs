//! Lock-free page provider
//!
//! Hands out page-aligned, page-sized superblocks, tracked by a LIFO of
//! free-page descriptors. All shared state folds into a single packed
//! anchor word updated by CAS, so concurrent `provide`/`release` calls
//! never block each other. The backing heap (descriptor table plus the
//! superblock-of-pages it indexes) is reserved lazily on the first
//! successful call.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::config::{ProviderConfig, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::traits::Provider;
use crate::util::pages_for;
use crate::vmem::{self, VirtualAddressRange};

const STATUS_BITS: u32 = 2;
const INDEX_BITS: u32 = 18;
const TAG_BITS: u32 = 26;

const STATUS_MASK: u64 = (1 << STATUS_BITS) - 1;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const TAG_SHIFT: u32 = STATUS_BITS + 2 * INDEX_BITS;

/// Largest page limit the anchor's index fields can express
pub const MAX_LIMIT: usize = (1 << INDEX_BITS) - 1;

/// Heap initialization state held in the anchor's status bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Initial,
    Allocating,
    Allocated,
}

impl Status {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Self::Initial,
            1 => Self::Allocating,
            _ => Self::Allocated,
        }
    }

    fn to_bits(self) -> u64 {
        match self {
            Self::Initial => 0,
            Self::Allocating => 1,
            Self::Allocated => 2,
        }
    }
}

/// Unpacked view of the provider's 64-bit anchor word
///
/// Bit layout, low to high: `status:2 | head:18 | available:18 |
/// tag:26`. `head` indexes the LIFO of free-page descriptors, with the
/// configured limit acting as the end-of-list sentinel. `available`
/// counts pages not currently handed out. `tag` is a wrapping push
/// counter that keeps a pop from succeeding against a recycled head
/// whose chain has been rewritten in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    status: Status,
    head: usize,
    available: usize,
    tag: u64,
}

impl Anchor {
    fn unpack(bits: u64) -> Self {
        Self {
            status: Status::from_bits(bits & STATUS_MASK),
            head: (bits >> STATUS_BITS & INDEX_MASK) as usize,
            available: (bits >> (STATUS_BITS + INDEX_BITS) & INDEX_MASK) as usize,
            tag: bits >> TAG_SHIFT & TAG_MASK,
        }
    }

    fn pack(self) -> u64 {
        self.status.to_bits()
            | (self.head as u64) << STATUS_BITS
            | (self.available as u64) << (STATUS_BITS + INDEX_BITS)
            | self.tag << TAG_SHIFT
    }
}

/// Per-page entry in the heap's descriptor table
///
/// Free descriptors chain through `next` to form the LIFO; the
/// configured limit is the end-of-list sentinel index.
#[repr(C)]
struct Descriptor {
    next: AtomicU32,
    occupied: AtomicBool,
}

/// Header at the base of the lazily mapped heap region
///
/// The descriptor table follows immediately after, one entry per page of
/// the superblock region.
#[repr(C)]
struct HeapHeader {
    /// The heap region itself, kept for the drop-time unmap
    heap_range: VirtualAddressRange,
    /// The superblock-of-pages region the descriptors index into
    super_block: VirtualAddressRange,
}

/// Thread-safe provider of single-page superblocks
///
/// See the module docs for the scheme. `provide` currently accepts only
/// single-page requests.
pub struct LockFreePage {
    anchor: AtomicU64,
    heap: AtomicPtr<HeapHeader>,
    limit: usize,
}

impl LockFreePage {
    /// Create a provider with the default page limit
    pub fn new() -> Self {
        Self::with_config(ProviderConfig::default())
    }

    /// Create a provider handing out at most `config.limit` pages
    ///
    /// The limit is clamped to what the anchor encoding can express.
    pub fn with_config(config: ProviderConfig) -> Self {
        Self {
            anchor: AtomicU64::new(0),
            heap: AtomicPtr::new(core::ptr::null_mut()),
            limit: config.limit.clamp(1, MAX_LIMIT),
        }
    }

    /// Configured maximum number of pages
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of pages not currently handed out
    ///
    /// Equals the limit before the first successful `provide`.
    pub fn available(&self) -> usize {
        let anchor = Anchor::unpack(self.anchor.load(Ordering::Acquire));
        match anchor.status {
            Status::Allocated => anchor.available,
            _ => self.limit,
        }
    }

    fn header(&self) -> *mut HeapHeader {
        self.heap.load(Ordering::Acquire)
    }

    /// Descriptor table entry `index`
    ///
    /// # Safety
    /// The heap must be initialized and `index < self.limit`.
    unsafe fn descriptor(&self, index: usize) -> &Descriptor {
        debug_assert!(index < self.limit);
        // SAFETY: the table of limit descriptors starts right after the
        // header and lives as long as the mapped heap region.
        unsafe {
            let table = self.header().add(1).cast::<Descriptor>();
            &*table.add(index)
        }
    }

    /// Reserve the heap and superblock regions, seed the descriptor
    /// LIFO, and open the anchor
    ///
    /// Exactly one thread wins the `Initial -> Allocating` transition
    /// and performs the OS calls; losers retry in `provide` and yield
    /// while the winner works. A winner whose OS calls fail puts the
    /// anchor back to `Initial` so the pool stays retryable.
    fn initialize_heap(&self) -> Result<()> {
        let old_bits = self.anchor.load(Ordering::Acquire);
        let old_anchor = Anchor::unpack(old_bits);
        if old_anchor.status != Status::Initial {
            return Ok(());
        }

        let claim = Anchor {
            status: Status::Allocating,
            ..old_anchor
        };
        if self
            .anchor
            .compare_exchange(old_bits, claim.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread claimed the initialization.
            return Ok(());
        }

        let heap_bytes = core::mem::size_of::<HeapHeader>()
            + self.limit * core::mem::size_of::<Descriptor>();

        let heap_range = match vmem::fetch_pages(pages_for(heap_bytes)) {
            Ok(range) => range,
            Err(_) => {
                self.anchor.store(old_bits, Ordering::Release);
                return Err(Error::OutOfMemory);
            }
        };

        let super_block = match vmem::fetch_pages(self.limit) {
            Ok(range) => range,
            Err(_) => {
                let _ = vmem::return_pages(heap_range);
                self.anchor.store(old_bits, Ordering::Release);
                return Err(Error::OutOfMemory);
            }
        };

        let header = heap_range.base().cast::<HeapHeader>();
        // SAFETY: the region was just mapped writable and is exclusively
        // ours until the anchor below publishes it.
        unsafe {
            header.write(HeapHeader {
                heap_range,
                super_block,
            });
            let table = header.add(1).cast::<Descriptor>();
            for i in 0..self.limit {
                table.add(i).write(Descriptor {
                    next: AtomicU32::new(i as u32 + 1),
                    occupied: AtomicBool::new(false),
                });
            }
        }

        self.heap.store(header, Ordering::Release);

        let open = Anchor {
            status: Status::Allocated,
            head: 0,
            available: self.limit,
            tag: 0,
        };
        self.anchor.store(open.pack(), Ordering::Release);

        log::debug!(
            "page pool initialized: {} pages at {:#x}",
            self.limit,
            super_block.address()
        );
        Ok(())
    }
}

impl Provider for LockFreePage {
    fn provide(&self, count: usize) -> Result<NonNull<u8>> {
        if count == 0 || count > self.limit {
            return Err(Error::InvalidInput);
        }

        // Multi-page superblocks are not supported by the LIFO scheme.
        if count != 1 {
            return Err(Error::OperationNotSupported);
        }

        loop {
            let old_bits = self.anchor.load(Ordering::Acquire);
            let old_anchor = Anchor::unpack(old_bits);

            match old_anchor.status {
                Status::Initial => {
                    self.initialize_heap()?;
                    continue;
                }
                Status::Allocating => {
                    // Let the initializing thread finish its OS calls.
                    std::thread::yield_now();
                    continue;
                }
                Status::Allocated => {}
            }

            if old_anchor.available == 0 || old_anchor.head == self.limit {
                return Err(Error::NoFreeBlock);
            }

            // SAFETY: status is Allocated, so the heap is published and
            // head indexes the table.
            let next = unsafe { self.descriptor(old_anchor.head).next.load(Ordering::Acquire) };

            let new_anchor = Anchor {
                status: Status::Allocated,
                head: next as usize,
                available: old_anchor.available - 1,
                tag: old_anchor.tag,
            };

            if self
                .anchor
                .compare_exchange_weak(
                    old_bits,
                    new_anchor.pack(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: winning the CAS hands this thread exclusive
                // ownership of the descriptor and its page.
                let (descriptor, base) = unsafe {
                    (self.descriptor(old_anchor.head), (*self.header()).super_block)
                };
                descriptor.occupied.store(true, Ordering::Relaxed);
                descriptor.next.store(0, Ordering::Relaxed);

                let addr = base.address() + old_anchor.head * PAGE_SIZE;
                // SAFETY: addr points into the mapped superblock region.
                return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
            }
        }
    }

    fn release(&self, block: NonNull<u8>) -> Result<()> {
        let header = self.header();
        if header.is_null() {
            return Err(Error::InvalidInput);
        }

        // SAFETY: a non-null heap pointer is published only after the
        // header was written.
        let super_block = unsafe { (*header).super_block };

        let addr = block.as_ptr() as usize;
        if !super_block.contains(addr) || (addr - super_block.address()) % PAGE_SIZE != 0 {
            return Err(Error::InvalidInput);
        }

        let index = (addr - super_block.address()) / PAGE_SIZE;

        // SAFETY: index was derived from a pointer inside the superblock.
        let descriptor = unsafe { self.descriptor(index) };
        if !descriptor.occupied.swap(false, Ordering::AcqRel) {
            // Not a live issuance.
            return Err(Error::InvalidInput);
        }

        loop {
            let old_bits = self.anchor.load(Ordering::Acquire);
            let old_anchor = Anchor::unpack(old_bits);

            // Chain the descriptor before publishing it as the new head,
            // so a racing taker always observes a consistent list.
            descriptor
                .next
                .store(old_anchor.head as u32, Ordering::Release);

            let new_anchor = Anchor {
                status: old_anchor.status,
                head: index,
                available: old_anchor.available + 1,
                tag: old_anchor.tag.wrapping_add(1) & TAG_MASK,
            };

            if self
                .anchor
                .compare_exchange_weak(
                    old_bits,
                    new_anchor.pack(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn block_size(&self) -> usize {
        PAGE_SIZE
    }
}

impl Default for LockFreePage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockFreePage {
    fn drop(&mut self) {
        let header = self.header();
        if header.is_null() {
            return;
        }

        let anchor = Anchor::unpack(self.anchor.load(Ordering::Acquire));
        if anchor.status != Status::Allocated || anchor.available != self.limit {
            // Outstanding pages keep the whole pool alive; the caller
            // still holds pointers into it.
            log::debug!(
                "leaking page pool with {} pages outstanding",
                self.limit - anchor.available
            );
            return;
        }

        // SAFETY: the header stays valid until its own region is
        // unmapped below, and no superblock pointer is outstanding.
        let (heap_range, super_block) = unsafe { ((*header).heap_range, (*header).super_block) };
        let _ = vmem::return_pages(super_block);
        let _ = vmem::return_pages(heap_range);
    }
}

// SAFETY: all shared state is atomic; the heap regions are plain memory
// coordinated through the anchor protocol.
unsafe impl Send for LockFreePage {}
unsafe impl Sync for LockFreePage {}
