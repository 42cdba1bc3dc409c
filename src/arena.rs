//! Backing arena for slab pages.
//!
//! Two modes, chosen at init: a single up-front allocation of the whole
//! memory limit sub-allocated by bump pointer, or per-page allocations
//! from the system allocator. Releasing a page is only possible in the
//! second mode; a preallocated arena keeps ownership of every byte it
//! ever handed out.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use tracing::warn;

/// Round `n` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Owner of the raw memory behind all slab pages.
pub(crate) struct Arena {
    /// Base of the preallocated region, null in per-page mode.
    base: *mut u8,
    /// Size of the preallocated region.
    base_size: usize,
    /// Bump offset into the preallocated region.
    cursor: usize,
    /// Bytes remaining in the preallocated region.
    avail: usize,
    /// Alignment applied to every reservation.
    chunk_align: usize,
}

// The arena is only touched under the allocator lock.
unsafe impl Send for Arena {}

impl Arena {
    /// Create an arena.
    ///
    /// When `prealloc` is set, attempts a single allocation of `limit`
    /// bytes; on failure logs a warning and falls back to per-page
    /// allocation.
    pub(crate) fn new(limit: usize, prealloc: bool, chunk_align: usize) -> Self {
        let mut arena = Self {
            base: std::ptr::null_mut(),
            base_size: 0,
            cursor: 0,
            avail: 0,
            chunk_align,
        };

        if prealloc && limit > 0 {
            let layout = Layout::from_size_align(limit, chunk_align)
                .expect("invalid arena layout");
            // SAFETY: layout has non-zero size
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                warn!(
                    limit,
                    "failed to allocate memory in one large chunk, \
                     falling back to per-page allocation"
                );
            } else {
                arena.base = ptr;
                arena.base_size = limit;
                arena.avail = limit;
            }
        }

        arena
    }

    /// Whether the arena owns a single preallocated region.
    #[inline]
    pub(crate) fn is_preallocated(&self) -> bool {
        !self.base.is_null()
    }

    /// Hand out `len` bytes, or `None` when exhausted.
    pub(crate) fn reserve(&mut self, len: usize) -> Option<NonNull<u8>> {
        if self.base.is_null() {
            let layout = Layout::from_size_align(len, self.chunk_align).ok()?;
            // SAFETY: layout has non-zero size
            let ptr = unsafe { alloc::alloc(layout) };
            return NonNull::new(ptr);
        }

        if len > self.avail {
            return None;
        }

        // The cursor must stay aligned for the next reservation.
        let advance = align_up(len, self.chunk_align);
        // SAFETY: cursor + len <= base_size, checked above
        let ptr = unsafe { self.base.add(self.cursor) };
        self.cursor += advance;
        self.avail = self.avail.saturating_sub(advance);
        NonNull::new(ptr)
    }

    /// Return a region to the system allocator.
    ///
    /// Only valid in per-page mode; on a preallocated arena the region
    /// simply becomes unreachable and the arena keeps the bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `reserve(len)` on this arena and must
    /// not be used afterwards.
    pub(crate) unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) {
        if self.is_preallocated() {
            return;
        }
        let layout = Layout::from_size_align(len, self.chunk_align)
            .expect("invalid release layout");
        // SAFETY: caller guarantees ptr came from reserve(len)
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.base.is_null() {
            let layout = Layout::from_size_align(self.base_size, self.chunk_align)
                .expect("invalid arena layout");
            // SAFETY: base was allocated with this layout in new()
            unsafe { alloc::dealloc(self.base, layout) };
        }
    }
}
