//! Ownership of the contiguous memory range the allocator carves into
//! pages.

use crate::PAGE_SIZE;
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ptr::{self, NonNull},
};

/// The backing "physical memory" range: one page-aligned allocation made
/// at construction and deallocated on drop using the stored layout.
///
/// The region itself never interprets its contents. Page-granular access
/// goes through [Region::fill], [Region::read] and [Region::write], whose
/// callers must hold a page exclusively: a page is reachable from exactly
/// one core's freelist or owned by exactly one allocation holder at a
/// time, and that discipline is what makes the raw pointer accesses
/// race-free.
pub(crate) struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: Region owns its allocation; concurrent page access is
// disciplined by the allocator's freelists as described above.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocates a range of `pages` pages aligned to [PAGE_SIZE].
    ///
    /// # Panics
    ///
    /// Panics if `pages` is zero or the allocation fails.
    pub(crate) fn new(pages: usize) -> Self {
        assert!(pages > 0, "empty physical range");
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).expect("invalid layout");

        // SAFETY: the layout has non-zero size and power-of-two alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).expect("allocation failed");

        Self { ptr, layout }
    }

    /// First address of the range.
    pub(crate) fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last address of the range.
    pub(crate) fn top(&self) -> usize {
        self.base() + self.layout.size()
    }

    /// Fills the page at `addr` with `byte`.
    pub(crate) fn fill(&self, addr: usize, byte: u8) {
        debug_assert!(addr % PAGE_SIZE == 0 && addr >= self.base() && addr < self.top());
        // SAFETY: addr is a page inside this region, held exclusively by
        // the caller.
        unsafe { ptr::write_bytes(addr as *mut u8, byte, PAGE_SIZE) };
    }

    /// Copies the page at `addr` out of the region.
    pub(crate) fn read(&self, addr: usize) -> [u8; PAGE_SIZE] {
        debug_assert!(addr % PAGE_SIZE == 0 && addr >= self.base() && addr < self.top());
        let mut page = [0; PAGE_SIZE];
        // SAFETY: addr is a page inside this region, held exclusively by
        // the caller.
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, page.as_mut_ptr(), PAGE_SIZE) };
        page
    }

    /// Copies `data` into the page at `addr`.
    pub(crate) fn write(&self, addr: usize, data: &[u8; PAGE_SIZE]) {
        debug_assert!(addr % PAGE_SIZE == 0 && addr >= self.base() && addr < self.top());
        // SAFETY: addr is a page inside this region, held exclusively by
        // the caller.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, PAGE_SIZE) };
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
