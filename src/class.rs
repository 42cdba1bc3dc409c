//! Slab class descriptors and the intrusive chunk freelist.
//!
//! A class owns an ordered list of pages and a doubly-linked freelist of
//! chunks threaded through the chunk headers themselves. Every field is
//! guarded by the pool's allocator lock; nothing here synchronizes on its
//! own.

use std::ptr;
use std::ptr::NonNull;

use crate::item::ItemHeader;

/// Descriptor of one slab class.
pub(crate) struct SlabClass {
    /// Chunk size in bytes.
    pub(crate) size: usize,
    /// Chunks per page.
    pub(crate) perslab: usize,
    /// Owned pages, in allocation order.
    pub(crate) pages: Vec<*mut u8>,
    /// Head of the freelist, null when empty.
    pub(crate) free_head: *mut ItemHeader,
    /// Number of chunks on the freelist.
    pub(crate) free_count: usize,
    /// 0 when idle, else 1 + index of the page being migrated away.
    pub(crate) killing: usize,
    /// Net bytes requested through alloc/free, for accounting.
    pub(crate) requested: u64,
}

impl SlabClass {
    pub(crate) fn new(size: usize, perslab: usize) -> Self {
        Self {
            size,
            perslab,
            pages: Vec::new(),
            free_head: ptr::null_mut(),
            free_count: 0,
            killing: 0,
            requested: 0,
        }
    }

    /// An empty placeholder for the reserved class 0.
    pub(crate) fn unused() -> Self {
        Self::new(0, 0)
    }

    /// Link a chunk at the head of the freelist and mark it `SLABBED`.
    pub(crate) fn push_free(&mut self, it: &ItemHeader) {
        it.set_slabbed(true);
        it.set_prev(ptr::null_mut());
        it.set_next(self.free_head);
        if let Some(head) = NonNull::new(self.free_head) {
            // SAFETY: freelist members are valid chunk headers
            unsafe { head.as_ref().set_prev(it.as_ptr()) };
        }
        self.free_head = it.as_ptr();
        self.free_count += 1;
    }

    /// Pop the head chunk off the freelist.
    pub(crate) fn pop_free(&mut self) -> Option<NonNull<ItemHeader>> {
        let head = NonNull::new(self.free_head)?;
        // SAFETY: freelist members are valid chunk headers
        let next = unsafe { head.as_ref().next() };
        if let Some(next) = NonNull::new(next) {
            // SAFETY: as above
            unsafe { next.as_ref().set_prev(ptr::null_mut()) };
        }
        self.free_head = next;
        self.free_count -= 1;
        Some(head)
    }

    /// Unlink a specific chunk from the middle of the freelist.
    ///
    /// Used by the rebalancer when it reclaims a free chunk on the page
    /// being migrated.
    pub(crate) fn unlink_free(&mut self, it: &ItemHeader) {
        if self.free_head == it.as_ptr() {
            self.free_head = it.next();
        }
        if let Some(next) = NonNull::new(it.next()) {
            // SAFETY: freelist members are valid chunk headers
            unsafe { next.as_ref().set_prev(it.prev()) };
        }
        if let Some(prev) = NonNull::new(it.prev()) {
            // SAFETY: as above
            unsafe { prev.as_ref().set_next(it.next()) };
        }
        self.free_count -= 1;
    }

    /// Split a zeroed page into `perslab` chunks pushed on the freelist.
    ///
    /// # Safety
    ///
    /// `page` must point to at least `size * perslab` zeroed, writable
    /// bytes owned by this class.
    pub(crate) unsafe fn split_page(&mut self, page: *mut u8) {
        for x in 0..self.perslab {
            // SAFETY: chunk x starts within the page per the contract
            let it = unsafe { ItemHeader::from_ptr(page.add(x * self.size)) };
            self.push_free(it);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::HEADER_SIZE;

    /// A page-sized, header-aligned buffer.
    fn page_buffer(bytes: usize) -> Vec<u64> {
        vec![0u64; bytes / 8]
    }

    #[test]
    fn test_split_and_pop_all() {
        let mut class = SlabClass::new(64, 16);
        let mut page = page_buffer(64 * 16);
        unsafe { class.split_page(page.as_mut_ptr() as *mut u8) };

        assert_eq!(class.free_count, 16);

        let mut popped = 0;
        while let Some(it) = class.pop_free() {
            popped += 1;
            // SAFETY: chunk headers live inside the page buffer
            assert!(unsafe { it.as_ref().is_slabbed() });
        }
        assert_eq!(popped, 16);
        assert_eq!(class.free_count, 0);
        assert!(class.pop_free().is_none());
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut class = SlabClass::new(64, 4);
        let mut page = page_buffer(64 * 4);
        let base = page.as_mut_ptr() as *mut u8;
        unsafe { class.split_page(base) };

        // The last chunk split is the head.
        let head = class.pop_free().unwrap();
        assert_eq!(head.as_ptr() as *mut u8, unsafe { base.add(64 * 3) });
    }

    #[test]
    fn test_unlink_middle() {
        let mut class = SlabClass::new(64, 4);
        let mut page = page_buffer(64 * 4);
        let base = page.as_mut_ptr() as *mut u8;
        unsafe { class.split_page(base) };

        // Chunk 2 sits in the middle of the list (order: 3, 2, 1, 0).
        let mid = unsafe { ItemHeader::from_ptr(base.add(64 * 2)) };
        class.unlink_free(mid);
        assert_eq!(class.free_count, 3);

        // The remaining chunks come off in order, skipping the unlinked one.
        let order: Vec<*mut u8> = std::iter::from_fn(|| class.pop_free())
            .map(|p| p.as_ptr() as *mut u8)
            .collect();
        let expected: Vec<*mut u8> =
            unsafe { vec![base.add(64 * 3), base.add(64), base] };
        assert_eq!(order, expected);
    }

    #[test]
    fn test_unlink_head() {
        let mut class = SlabClass::new(128, 2);
        let mut page = page_buffer(128 * 2);
        let base = page.as_mut_ptr() as *mut u8;
        unsafe { class.split_page(base) };

        let head = unsafe { ItemHeader::from_ptr(base.add(128)) };
        class.unlink_free(head);
        assert_eq!(class.free_count, 1);
        assert_eq!(class.free_head, base as *mut ItemHeader);
    }

    #[test]
    fn test_chunk_fits_header() {
        // The smallest usable chunk must hold the fixed header.
        assert!(64 >= HEADER_SIZE);
    }
}
