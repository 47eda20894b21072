//! A physical page allocator with one freelist per processor core.
//!
//! The usable memory range is split into `NCPU` equal partitions at
//! construction and every partition's pages are pushed onto that core's
//! freelist. Each freelist has its own spin lock, so cores allocate and
//! free without contending in the common case. When a core's own list
//! runs dry, [PageAllocator::alloc] steals: it probes the other cores'
//! lists round-robin, one lock at a time, and takes the first free page
//! it finds. Only when every list is empty does allocation fail, and
//! that is an ordinary [Error::OutOfMemory] the caller must handle, not
//! a halt.
//!
//! Freed pages are filled with [FREED_JUNK] and freshly allocated pages
//! with [ALLOC_JUNK], so a lingering reference into the wrong lifecycle
//! stage reads recognizable garbage instead of plausible data.
//!
//! # Example
//!
//! ```rust
//! use osmium_kalloc::{PageAllocator, ALLOC_JUNK, PAGE_SIZE};
//!
//! // Four pages split across two cores.
//! let allocator: PageAllocator<2> = PageAllocator::new(4);
//!
//! let page = allocator.alloc(0).unwrap();
//! assert_eq!(allocator.read_page(page), [ALLOC_JUNK; PAGE_SIZE]);
//! allocator.free(0, page);
//! ```

mod region;

use region::Region;
use spin::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

/// Size of one physical page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Byte pattern filling a page while it sits on a freelist.
pub const FREED_JUNK: u8 = 0x01;

/// Byte pattern filling a page when it is handed to a caller, before the
/// caller initializes it.
pub const ALLOC_JUNK: u8 = 0x05;

/// Errors that can occur when allocating pages.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Every core's freelist is empty. Expected under load; callers
    /// apply backpressure, reclaim, or fail the request.
    #[error("out of memory")]
    OutOfMemory,
}

/// Address of one page inside the allocator's physical range.
///
/// Addresses are plain numbers, not capability handles: callers are
/// trusted kernel code, and [PageAllocator::free] treats a misaligned or
/// out-of-range address as unrecoverable corruption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Wraps a raw address.
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// The raw address.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// A fixed pool of physical pages partitioned across `NCPU` cores.
///
/// Pages cycle between "free" (on exactly one core's list) and
/// "allocated" (owned by exactly one caller) for the allocator's whole
/// life. Stealing moves a page between lists but never rebalances the
/// boot-time partitions; a page freed on core `c` lands on `c`'s list
/// regardless of which partition it came from.
pub struct PageAllocator<const NCPU: usize = 8> {
    region: Region,
    freelists: [Mutex<Vec<PhysAddr>>; NCPU],
    /// Pages currently handed out, across all cores.
    allocated: AtomicUsize,
}

impl<const NCPU: usize> PageAllocator<NCPU> {
    /// Builds an allocator over a fresh range of `pages` pages, giving
    /// each core `pages / NCPU` of them. The remainder tail of an uneven
    /// split is never enrolled.
    ///
    /// Every page is enrolled through [PageAllocator::free], which both
    /// validates its address and applies the freed-junk fill.
    ///
    /// # Panics
    ///
    /// Panics if `NCPU` or `pages` is zero or the backing allocation
    /// fails.
    pub fn new(pages: usize) -> Self {
        assert!(NCPU > 0, "allocator needs at least one core");
        let this = Self {
            region: Region::new(pages),
            freelists: std::array::from_fn(|_| Mutex::new(Vec::new())),
            allocated: AtomicUsize::new(0),
        };
        let per_core = pages / NCPU;
        for core in 0..NCPU {
            let partition = this.region.base() + core * per_core * PAGE_SIZE;
            for page in 0..per_core {
                this.free(core, PhysAddr(partition + page * PAGE_SIZE));
            }
        }
        debug!(pages, per_core, cores = NCPU, "page allocator initialized");
        this
    }

    /// Allocates one page for `core`, preferring its own freelist and
    /// stealing from the other cores round-robin when it is empty. The
    /// returned page is filled with [ALLOC_JUNK].
    ///
    /// # Panics
    ///
    /// Panics if `core` is out of range.
    pub fn alloc(&self, core: usize) -> Result<PhysAddr, Error> {
        assert!(core < NCPU, "no such core: {core}");
        let page = match self.freelists[core].lock().pop() {
            Some(page) => Some(page),
            None => self.steal(core),
        };
        let Some(page) = page else {
            debug!(core, "out of memory");
            return Err(Error::OutOfMemory);
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.region.fill(page.get(), ALLOC_JUNK);
        trace!(core, addr = page.get(), "allocated page");
        Ok(page)
    }

    /// Returns a page to `core`'s freelist (not necessarily the core it
    /// was allocated on), filling it with [FREED_JUNK] first.
    ///
    /// # Panics
    ///
    /// Panics if `core` is out of range, or if `addr` is misaligned or
    /// outside the physical range: callers are trusted kernel code, so
    /// an invalid address means corruption that cannot be continued
    /// past.
    pub fn free(&self, core: usize, addr: PhysAddr) {
        assert!(core < NCPU, "no such core: {core}");
        self.check(addr);
        self.region.fill(addr.get(), FREED_JUNK);
        self.freelists[core].lock().push(addr);
        // The boot-time enrollment in `new` also goes through here, and
        // those pages were never counted as allocated.
        let _ = self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
    }

    /// Number of pages currently on `core`'s freelist.
    ///
    /// # Panics
    ///
    /// Panics if `core` is out of range.
    pub fn free_pages(&self, core: usize) -> usize {
        assert!(core < NCPU, "no such core: {core}");
        self.freelists[core].lock().len()
    }

    /// Number of free pages across all cores.
    pub fn total_free(&self) -> usize {
        (0..NCPU).map(|core| self.free_pages(core)).sum()
    }

    /// Number of pages currently handed out.
    pub fn total_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Copies the page at `addr` out of the range. The caller must own
    /// the page (or be inspecting a freed page for debugging).
    ///
    /// # Panics
    ///
    /// Panics if `addr` is misaligned or outside the physical range.
    pub fn read_page(&self, addr: PhysAddr) -> [u8; PAGE_SIZE] {
        self.check(addr);
        self.region.read(addr.get())
    }

    /// Copies `data` into the page at `addr`. The caller must own the
    /// page.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is misaligned or outside the physical range.
    pub fn write_page(&self, addr: PhysAddr, data: &[u8; PAGE_SIZE]) {
        self.check(addr);
        self.region.write(addr.get(), data);
    }

    /// Probes the other cores' freelists round-robin starting after
    /// `core`, holding one lock at a time, and takes the first free page
    /// found.
    fn steal(&self, core: usize) -> Option<PhysAddr> {
        for offset in 1..NCPU {
            let victim = (core + offset) % NCPU;
            if let Some(page) = self.freelists[victim].lock().pop() {
                trace!(core, victim, addr = page.get(), "stole page");
                return Some(page);
            }
        }
        None
    }

    /// Fatal address validation shared by every page-addressed
    /// operation.
    fn check(&self, addr: PhysAddr) {
        let addr = addr.get();
        if addr % PAGE_SIZE != 0 || addr < self.region.base() || addr >= self.region.top() {
            panic!("kalloc: bad physical address {addr:#x}");
        }
    }
}
