//! Fixed page pool over a preallocated slab
//!
//! The pool allocates one contiguous block of `num_pages * elements_per_page`
//! scalars at construction and never allocates again. Pages are handed out
//! by id from a LIFO free stack: releasing id `k` and then acquiring yields
//! `k` again, so the most recently touched memory stays warm.
//!
//! Page bytes are not cleared when a page crosses the release/acquire
//! boundary; whatever the previous holder wrote is still there.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::Scalar;

use super::page::PageId;

/// Preallocated pool of equal-sized scratch pages
pub struct PagePool {
    num_pages: usize,
    elements_per_page: usize,
    /// Raw slab of `num_pages * elements_per_page` scalars
    slab: NonNull<Scalar>,
    /// Layout kept for deallocation
    layout: Layout,
    /// Free page ids; the stack top is the vector's tail
    free: Mutex<Vec<u32>>,
}

// Safety: the slab pointer is only dereferenced through the accessors below,
// whose exclusivity contract is carried by page ownership (one acquirer per
// id between acquire and release). The free stack is mutex-guarded.
unsafe impl Send for PagePool {}
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Create a pool of `num_pages` pages of `elements_per_page` scalars each.
    ///
    /// All pages start free; the first acquisitions hand out ids
    /// `num_pages - 1` down to `0`.
    pub fn new(num_pages: usize, elements_per_page: usize) -> Result<Self> {
        if num_pages == 0 {
            return Err(CoreError::InvalidConfig(
                "pool must have at least one page".to_string(),
            ));
        }
        if elements_per_page == 0 {
            return Err(CoreError::InvalidConfig(
                "page size must be at least one element".to_string(),
            ));
        }

        let total_elements = num_pages
            .checked_mul(elements_per_page)
            .ok_or_else(|| CoreError::InvalidConfig("pool size overflows".to_string()))?;

        let layout = Layout::array::<Scalar>(total_elements)
            .map_err(|e| CoreError::InvalidConfig(format!("invalid slab layout: {}", e)))?;

        let slab = unsafe { alloc_zeroed(layout) } as *mut Scalar;
        let slab = NonNull::new(slab).ok_or_else(|| {
            CoreError::InvalidConfig(format!(
                "failed to allocate {} byte slab",
                layout.size()
            ))
        })?;

        // Stack [0, 1, ..., N-1]; popping from the tail yields N-1 first.
        let free: Vec<u32> = (0..num_pages as u32).collect();

        Ok(Self {
            num_pages,
            elements_per_page,
            slab,
            layout,
            free: Mutex::new(free),
        })
    }

    /// Acquire a free page.
    ///
    /// Returns the page id; the caller owns the page's region exclusively
    /// until [`release`](Self::release). Fails with `CapacityExhausted` when
    /// no page is free; the pool never blocks.
    pub fn acquire(&self) -> Result<PageId> {
        let mut free = self.free.lock();
        match free.pop() {
            Some(id) => Ok(PageId::new(id)),
            None => Err(CoreError::CapacityExhausted(format!(
                "all {} pages in use",
                self.num_pages
            ))),
        }
    }

    /// Return a page to the pool.
    ///
    /// Detects two misuse cases, both reported and left uncorrected: an id
    /// outside `[0, num_pages)`, and a release when every page is already
    /// free (a double release).
    pub fn release(&self, page: PageId) -> Result<()> {
        if page.raw() as usize >= self.num_pages {
            warn!(page = %page, num_pages = self.num_pages, "release of invalid page id");
            return Err(CoreError::InvalidArgument(format!(
                "page id {} out of range (pool has {} pages)",
                page.raw(),
                self.num_pages
            )));
        }

        let mut free = self.free.lock();
        if free.len() == self.num_pages {
            warn!(page = %page, "release while all pages are free (double release?)");
            return Err(CoreError::InvalidArgument(format!(
                "double release of page id {}",
                page.raw()
            )));
        }

        free.push(page.raw());
        Ok(())
    }

    /// Get the address of a page's region without acquiring it.
    ///
    /// Bounds-checked peek/debug path; obtaining the pointer is safe,
    /// dereferencing it is subject to the ownership contract of
    /// [`acquire`](Self::acquire).
    pub fn page_ptr(&self, page: PageId) -> Result<*mut Scalar> {
        if page.raw() as usize >= self.num_pages {
            return Err(CoreError::InvalidArgument(format!(
                "page id {} out of range (pool has {} pages)",
                page.raw(),
                self.num_pages
            )));
        }
        Ok(unsafe { self.slab.as_ptr().add(page.element_offset(self.elements_per_page)) })
    }

    /// Get a page's region as a slice.
    ///
    /// # Safety
    /// The caller must hold the page (acquired and not yet released) and must
    /// not hold a mutable slice of the same page.
    pub unsafe fn page_slice(&self, page: PageId) -> Result<&[Scalar]> {
        let ptr = self.page_ptr(page)?;
        Ok(std::slice::from_raw_parts(ptr, self.elements_per_page))
    }

    /// Get a page's region as a mutable slice.
    ///
    /// # Safety
    /// The caller must hold the page (acquired and not yet released) and must
    /// be the only holder of any slice of it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_slice_mut(&self, page: PageId) -> Result<&mut [Scalar]> {
        let ptr = self.page_ptr(page)?;
        Ok(std::slice::from_raw_parts_mut(ptr, self.elements_per_page))
    }

    /// Exact number of currently free pages
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Total number of pages
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Scalars per page
    #[inline]
    pub fn elements_per_page(&self) -> usize {
        self.elements_per_page
    }

    /// Total slab size in bytes
    #[inline]
    pub fn slab_bytes(&self) -> usize {
        self.num_pages * self.elements_per_page * std::mem::size_of::<Scalar>()
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let free = self.free.get_mut().len();
        if free != self.num_pages {
            warn!(
                leaked = self.num_pages - free,
                num_pages = self.num_pages,
                "pool destroyed with pages still acquired"
            );
        }
        unsafe {
            dealloc(self.slab.as_ptr() as *mut u8, self.layout);
        }
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("num_pages", &self.num_pages)
            .field("elements_per_page", &self.elements_per_page)
            .field("free_count", &self.free_count())
            .finish()
    }
}
