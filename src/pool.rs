//! The slab pool: class table, allocator API, and memory-limit control.
//!
//! A [`SlabPool`] owns a bounded region of memory and hands out
//! fixed-size chunks grouped into geometric size classes. One global
//! allocator lock guards every mutable field of every class and of the
//! arena; counters that are read outside the lock (`limit`,
//! `mem_malloced`, move/shrink totals) are atomics.

use std::mem;
use std::ptr;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace};

use crate::arena::{Arena, align_up};
use crate::class::SlabClass;
use crate::config::{
    MAX_SLAB_CLASSES, SMALLEST, SlabConfig, bulk_check_from_env, initial_malloc_from_env,
};
use crate::error::{AllocError, ResizeError};
use crate::hooks::ItemStore;
use crate::item::{HEADER_SIZE, ItemHeader};
use crate::rebalance::{REBALANCE_IDLE, RebalanceJob};
use crate::stats::{ClassStats, StatSink, class_stat};

/// Initial capacity of a class's page list.
const MIN_PAGE_LIST: usize = 16;

/// Integer ceiling division.
pub(crate) fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// State guarded by the allocator lock.
pub(crate) struct PoolState {
    /// Class descriptors; index 0 is reserved and unused.
    pub(crate) classes: Vec<SlabClass>,
    /// Backing memory.
    pub(crate) arena: Arena,
}

// Raw page/chunk pointers are only dereferenced under the allocator lock.
unsafe impl Send for PoolState {}

/// Slab allocator with on-line page rebalancing.
///
/// Create one per cache instance; every operation takes `&self`, so the
/// pool is normally wrapped in an [`Arc`] and shared with the item
/// subsystem and the maintenance workers.
pub struct SlabPool {
    pub(crate) state: Mutex<PoolState>,
    /// Coarse lock the item subsystem holds during structural item
    /// mutations. The rebalancer acquires it before the allocator lock.
    cache_lock: Mutex<()>,
    pub(crate) hooks: Arc<dyn ItemStore>,
    /// Chunk size per class, immutable after init. Index 0 is 0.
    chunk_sizes: Box<[usize]>,
    pub(crate) largest: usize,
    pub(crate) page_bytes: usize,
    pub(crate) reassign_enabled: bool,
    pub(crate) automove: u8,
    pub(crate) bulk_check: usize,
    /// Memory limit in bytes, 0 = unlimited.
    pub(crate) limit: AtomicUsize,
    /// Bytes obtained from the system allocator for pages.
    pub(crate) mem_malloced: AtomicUsize,
    /// Bytes held by the page-list arrays, counted against the limit.
    slablist_bytes: AtomicUsize,

    // Rebalancer coordination. The worker holds `rebalance` for its whole
    // life and parks on `rebalance_cond`; `reassign()` admission is a
    // try-lock.
    pub(crate) rebalance: Mutex<RebalanceJob>,
    pub(crate) rebalance_cond: Condvar,
    pub(crate) rebalance_signal: AtomicU8,
    pub(crate) pick_cursor: AtomicUsize,

    // Automover coordination.
    pub(crate) maintenance_lock: Mutex<()>,
    pub(crate) maintenance_cond: Condvar,
    pub(crate) stop_automover: AtomicBool,
    pub(crate) stop_rebalancer: AtomicBool,

    pub(crate) slabs_moved: AtomicU64,
    pub(crate) slabs_shrunk: AtomicU64,
    pub(crate) reassign_running: AtomicBool,
}

impl SlabPool {
    /// Create a pool from a configuration.
    ///
    /// Determines the chunk-size geometry, sets up the arena, and, when
    /// `prealloc` is requested, allocates one page per class up front.
    ///
    /// # Panics
    ///
    /// Panics on an invalid configuration, or when a requested
    /// preallocation cannot be satisfied.
    pub fn new(config: SlabConfig, hooks: Arc<dyn ItemStore>) -> Self {
        assert!(config.growth_factor > 1.0, "growth factor must exceed 1.0");
        assert!(
            config.chunk_align.is_power_of_two()
                && config.chunk_align >= mem::align_of::<ItemHeader>(),
            "chunk alignment must be a power of two >= {}",
            mem::align_of::<ItemHeader>()
        );
        assert!(
            config.page_bytes >= align_up(HEADER_SIZE + config.initial_chunk_size, config.chunk_align),
            "page size too small for the smallest chunk"
        );

        let mut classes: Vec<SlabClass> = Vec::with_capacity(MAX_SLAB_CLASSES);
        classes.push(SlabClass::unused());

        let mut size = HEADER_SIZE + config.initial_chunk_size;
        let mut i = SMALLEST;
        while i < MAX_SLAB_CLASSES - 1
            && (size as f64) <= config.page_bytes as f64 / config.growth_factor
        {
            size = align_up(size, config.chunk_align);
            let perslab = config.page_bytes / size;
            debug!(class = i, chunk_size = size, perslab, "slab class");
            classes.push(SlabClass::new(size, perslab));
            size = (size as f64 * config.growth_factor) as usize;
            i += 1;
        }
        let largest = i;
        debug!(
            class = largest,
            chunk_size = config.page_bytes,
            perslab = 1usize,
            "slab class"
        );
        classes.push(SlabClass::new(config.page_bytes, 1));

        let chunk_sizes: Box<[usize]> = classes.iter().map(|c| c.size).collect();

        let arena = Arena::new(config.limit_bytes, config.prealloc, config.chunk_align);

        let bulk_check = bulk_check_from_env().unwrap_or(config.bulk_check).max(1);
        let seeded_malloc = initial_malloc_from_env().unwrap_or(0);

        let pool = Self {
            state: Mutex::new(PoolState { classes, arena }),
            cache_lock: Mutex::new(()),
            hooks,
            chunk_sizes,
            largest,
            page_bytes: config.page_bytes,
            reassign_enabled: config.slab_reassign,
            automove: config.slab_automove.min(2),
            bulk_check,
            limit: AtomicUsize::new(config.limit_bytes),
            mem_malloced: AtomicUsize::new(seeded_malloc),
            slablist_bytes: AtomicUsize::new(0),
            rebalance: Mutex::new(RebalanceJob::empty()),
            rebalance_cond: Condvar::new(),
            rebalance_signal: AtomicU8::new(REBALANCE_IDLE),
            pick_cursor: AtomicUsize::new(SMALLEST - 1),
            maintenance_lock: Mutex::new(()),
            maintenance_cond: Condvar::new(),
            stop_automover: AtomicBool::new(false),
            stop_rebalancer: AtomicBool::new(false),
            slabs_moved: AtomicU64::new(0),
            slabs_shrunk: AtomicU64::new(0),
            reassign_running: AtomicBool::new(false),
        };

        if config.prealloc {
            pool.preallocate();
        }

        pool
    }

    /// Allocate one page per class so early stores never see spurious
    /// out-of-memory errors.
    fn preallocate(&self) {
        let mut st = self.state.lock();
        for id in SMALLEST..=self.largest {
            if !self.newpage(&mut st, id) {
                panic!(
                    "failed to preallocate slab pages; with prealloc the memory \
                     limit must cover at least {} pages",
                    self.largest
                );
            }
        }
    }

    /// Index of the highest populated class.
    #[inline]
    pub fn largest(&self) -> usize {
        self.largest
    }

    /// Chunk size of a class, or `None` for an invalid index.
    #[inline]
    pub fn chunk_size(&self, id: usize) -> Option<usize> {
        if (SMALLEST..=self.largest).contains(&id) {
            Some(self.chunk_sizes[id])
        } else {
            None
        }
    }

    /// Page size in bytes (also the maximum item size).
    #[inline]
    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    /// Current memory limit in bytes, 0 = unlimited.
    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Bytes obtained from the system allocator for pages.
    #[inline]
    pub fn mem_malloced(&self) -> usize {
        self.mem_malloced.load(Ordering::Relaxed)
    }

    /// Pages moved between classes since startup.
    #[inline]
    pub fn slabs_moved(&self) -> u64 {
        self.slabs_moved.load(Ordering::Relaxed)
    }

    /// Pages released back to the arena since startup.
    #[inline]
    pub fn slabs_shrunk(&self) -> u64 {
        self.slabs_shrunk.load(Ordering::Relaxed)
    }

    /// Whether a rebalance is currently running.
    #[inline]
    pub fn reassign_running(&self) -> bool {
        self.reassign_running.load(Ordering::Relaxed)
    }

    /// Total bytes counted against the limit: page memory, page-list
    /// arrays, and the external hash table.
    pub fn total_malloced(&self) -> usize {
        self.mem_malloced.load(Ordering::Relaxed)
            + self.slablist_bytes.load(Ordering::Relaxed)
            + self.hooks.hash_bytes()
    }

    /// Acquire the cache lock on behalf of the item subsystem.
    ///
    /// Hold this guard across structural item mutations (link/unlink);
    /// the rebalancer takes the same lock before touching live items.
    pub fn lock_cache(&self) -> MutexGuard<'_, ()> {
        self.cache_lock.lock()
    }

    /// Find the smallest class whose chunks fit `size` bytes.
    ///
    /// Returns 0 when `size` is 0 or larger than the biggest chunk.
    pub fn classify(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        let mut res = SMALLEST;
        while size > self.chunk_sizes[res] {
            res += 1;
            if res > self.largest {
                return 0;
            }
        }
        res
    }

    /// Allocate a chunk of class `id`, accounting `size` requested bytes.
    ///
    /// The returned chunk has `SLABBED` cleared and a zero class byte;
    /// the caller takes ownership of everything past the header.
    pub fn alloc(&self, size: usize, id: usize) -> Result<NonNull<ItemHeader>, AllocError> {
        let mut st = self.state.lock();

        if !(SMALLEST..=self.largest).contains(&id) {
            return Err(AllocError::OutOfMemory);
        }

        if let Some(head) = NonNull::new(st.classes[id].free_head) {
            // SAFETY: freelist members are valid chunk headers
            let head_class = unsafe { head.as_ref().class_id() };
            assert_eq!(head_class, 0, "freelist head carries class {head_class}");
        }

        if st.classes[id].free_count == 0 && !self.newpage(&mut st, id) {
            return Err(AllocError::OutOfMemory);
        }

        let class = &mut st.classes[id];
        let it = class.pop_free().expect("fresh page contributes free chunks");
        // SAFETY: the chunk came off this class's freelist
        unsafe { it.as_ref().set_slabbed(false) };
        class.requested += size as u64;
        trace!(class = id, size, "alloc");
        Ok(it)
    }

    /// Return a chunk to its class freelist, releasing `size` requested
    /// bytes.
    ///
    /// # Panics
    ///
    /// Panics when `id` is out of range, or when the chunk header still
    /// carries a class byte (the caller must clear it before freeing).
    ///
    /// # Safety
    ///
    /// `ptr` must be a chunk of class `id` previously returned by
    /// [`alloc`](Self::alloc) on this pool and not freed since.
    pub unsafe fn free(&self, ptr: NonNull<ItemHeader>, size: usize, id: usize) {
        let mut st = self.state.lock();

        assert!(
            (SMALLEST..=self.largest).contains(&id),
            "invalid slab class {id}"
        );
        // SAFETY: caller guarantees ptr is a live chunk of this pool
        let header = unsafe { ptr.as_ref() };
        assert_eq!(header.class_id(), 0, "freed chunk still carries a class");

        let class = &mut st.classes[id];
        class.push_free(header);
        class.requested = class.requested.saturating_sub(size as u64);
        trace!(class = id, size, "free");
    }

    /// Adjust a class's requested-bytes accounting when an item is
    /// resized in place.
    ///
    /// # Panics
    ///
    /// Panics when `id` is out of range.
    pub fn adjust_requested(&self, id: usize, old: usize, new: usize) {
        let mut st = self.state.lock();
        assert!(
            (SMALLEST..=self.largest).contains(&id),
            "invalid slab class {id}"
        );
        let class = &mut st.classes[id];
        class.requested = class.requested.saturating_sub(old as u64) + new as u64;
    }

    /// Change the memory limit.
    ///
    /// Returns the advisory number of pages the automover will have to
    /// reclaim: 0 for a pure expansion, positive when the pool currently
    /// exceeds the new limit. The shrinking itself happens asynchronously
    /// in the maintenance workers.
    pub fn shrink_expand(&self, new_limit: usize) -> Result<u64, ResizeError> {
        {
            let st = self.state.lock();
            if st.arena.is_preallocated() {
                return Err(ResizeError::Inflexible);
            }
            if new_limit < self.page_bytes {
                return Err(ResizeError::TooSmall);
            }
            self.limit.store(new_limit, Ordering::Relaxed);
        }

        let total = self.total_malloced();
        if total <= new_limit {
            return Ok(0);
        }

        let gap = (total - new_limit) as u64;
        let pages = ceil_div(gap, self.page_bytes as u64);
        info!(
            gap_bytes = gap,
            gap_pages = pages,
            new_limit,
            total,
            "memory limit lowered; automover will shrink"
        );
        Ok(pages)
    }

    /// Emit the stats surface into `sink`.
    pub fn stats(&self, sink: &mut dyn StatSink) {
        let st = self.state.lock();

        self.hooks.global_counters(sink);

        let mut active = 0usize;
        for id in SMALLEST..=self.largest {
            let class = &st.classes[id];
            if class.pages.is_empty() {
                continue;
            }
            let total_chunks = class.pages.len() * class.perslab;
            class_stat(sink, id, "chunk_size", &class.size);
            class_stat(sink, id, "chunks_per_page", &class.perslab);
            class_stat(sink, id, "total_pages", &class.pages.len());
            class_stat(sink, id, "total_chunks", &total_chunks);
            class_stat(sink, id, "used_chunks", &(total_chunks - class.free_count));
            class_stat(sink, id, "free_chunks", &class.free_count);
            class_stat(sink, id, "mem_requested", &class.requested);
            self.hooks.command_counters(id, sink);
            active += 1;
        }

        sink.stat("active_slabs", &active);
        sink.stat("total_malloced", &self.mem_malloced.load(Ordering::Relaxed));
        sink.stat("slabs_moved", &self.slabs_moved.load(Ordering::Relaxed));
        sink.stat("slabs_shrunk", &self.slabs_shrunk.load(Ordering::Relaxed));
        sink.stat(
            "slab_reassign_running",
            &(self.reassign_running.load(Ordering::Relaxed) as u8),
        );
    }

    /// Typed snapshot of one class, or `None` for an invalid index.
    pub fn class_stats(&self, id: usize) -> Option<ClassStats> {
        if !(SMALLEST..=self.largest).contains(&id) {
            return None;
        }
        let st = self.state.lock();
        let class = &st.classes[id];
        let total_chunks = class.pages.len() * class.perslab;
        Some(ClassStats {
            class: id,
            chunk_size: class.size,
            chunks_per_page: class.perslab,
            total_pages: class.pages.len(),
            total_chunks,
            used_chunks: total_chunks - class.free_count,
            free_chunks: class.free_count,
            mem_requested: class.requested,
        })
    }

    /// Page length for a class: uniform when reassignment is enabled so
    /// pages can move between classes.
    pub(crate) fn page_len(&self, class: &SlabClass) -> usize {
        if self.reassign_enabled {
            self.page_bytes
        } else {
            class.size * class.perslab
        }
    }

    /// Allocate, zero, and split a new page for class `id`.
    ///
    /// A class with zero pages is always allowed its first page, even
    /// when that temporarily exceeds the limit; the automover shrinks
    /// afterwards.
    pub(crate) fn newpage(&self, st: &mut PoolState, id: usize) -> bool {
        let len = self.page_len(&st.classes[id]);
        let limit = self.limit.load(Ordering::Relaxed);

        let mut not_enough = limit > 0
            && self.total_malloced() + len > limit
            && !st.classes[id].pages.is_empty();

        // The check is tentative: growing the page list charges more
        // bytes against the limit, so re-evaluate afterwards.
        let grow_failed = if not_enough {
            true
        } else {
            !self.grow_page_list(st, id, true)
        };
        if !grow_failed {
            not_enough = limit > 0
                && self.total_malloced() + len > limit
                && !st.classes[id].pages.is_empty();
        }

        if not_enough || grow_failed {
            trace!(class = id, len, "page refused by memory limit");
            return false;
        }

        let Some(page) = st.arena.reserve(len) else {
            debug!(class = id, len, "arena exhausted");
            return false;
        };
        if !st.arena.is_preallocated() {
            self.mem_malloced.fetch_add(len, Ordering::Relaxed);
        }

        // SAFETY: the arena handed out len writable bytes
        unsafe {
            ptr::write_bytes(page.as_ptr(), 0, len);
            let class = &mut st.classes[id];
            class.pages.push(page.as_ptr());
            class.split_page(page.as_ptr());
        }
        true
    }

    /// Ensure the class's page list has room for one more page.
    ///
    /// Doubles the capacity (minimum 16), charging the byte delta against
    /// the limit. With `enforce_limit` unset the growth always succeeds;
    /// the rebalancer uses that when re-homing a page that already exists.
    pub(crate) fn grow_page_list(&self, st: &mut PoolState, id: usize, enforce_limit: bool) -> bool {
        let class = &st.classes[id];
        if class.pages.len() < class.pages.capacity() {
            return true;
        }

        let cap = class.pages.capacity();
        let new_cap = if cap == 0 { MIN_PAGE_LIST } else { cap * 2 };
        let delta = (new_cap - cap) * mem::size_of::<*mut u8>();

        let limit = self.limit.load(Ordering::Relaxed);
        if enforce_limit
            && limit > 0
            && self.total_malloced() + delta > limit
            && !class.pages.is_empty()
        {
            return false;
        }

        let class = &mut st.classes[id];
        let additional = new_cap - class.pages.len();
        class.pages.reserve_exact(additional);
        self.slablist_bytes.fetch_add(delta, Ordering::Relaxed);
        true
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        let PoolState { classes, arena } = self.state.get_mut();
        if arena.is_preallocated() {
            return;
        }
        for class in classes.iter_mut().skip(SMALLEST) {
            let len = if self.reassign_enabled {
                self.page_bytes
            } else {
                class.size * class.perslab
            };
            for page in mem::take(&mut class.pages) {
                // SAFETY: every page came from arena.reserve(len)
                unsafe { arena.release(NonNull::new_unchecked(page), len) };
            }
        }
    }
}
