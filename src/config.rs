//! Configuration for the slab pool.

use serde::Deserialize;

/// Highest number of slab classes, including the unused class 0.
///
/// With the default 1.25 growth factor and 1 MiB pages, roughly 43
/// classes are populated; 64 leaves headroom for small factors.
pub const MAX_SLAB_CLASSES: usize = 64;

/// Index of the smallest slab class. Class 0 is reserved: a chunk header
/// carrying class 0 is free (or vacated by the rebalancer).
pub const SMALLEST: usize = 1;

/// Default page size and maximum item size (1 MiB).
pub const DEFAULT_PAGE_BYTES: usize = 1024 * 1024;

/// Default memory limit (64 MiB).
pub const DEFAULT_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Default growth factor between adjacent chunk sizes.
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.25;

/// Default chunk alignment.
pub const DEFAULT_CHUNK_ALIGN: usize = 8;

/// Default extra bytes reserved in the smallest chunk beyond the header.
pub const DEFAULT_INITIAL_CHUNK_SIZE: usize = 48;

/// Default number of chunks inspected per rebalance critical section.
pub const DEFAULT_BULK_CHECK: usize = 1;

/// Configuration for [`SlabPool`](crate::SlabPool).
///
/// All fields have defaults matching the common cache-server setup:
/// 64 MiB limit, 1 MiB pages, 1.25 growth factor, reassignment on,
/// automover off.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlabConfig {
    /// Total memory limit in bytes. 0 means unlimited.
    pub limit_bytes: usize,
    /// Growth factor between adjacent slab classes. Must be > 1.0.
    pub growth_factor: f64,
    /// Page size in bytes. This is also the maximum item size.
    pub page_bytes: usize,
    /// Alignment of chunk starts within a page.
    pub chunk_align: usize,
    /// Extra bytes beyond the chunk header reserved in the smallest class.
    pub initial_chunk_size: usize,
    /// Allocate the whole limit up front and sub-allocate pages from it.
    pub prealloc: bool,
    /// Size every page to `page_bytes` so pages are uniform and movable.
    /// When false, pages are sized to `chunk_size * perslab` and
    /// rebalancing is effectively disabled.
    pub slab_reassign: bool,
    /// Automover aggressiveness: 0 = off, 1 = gentle, 2 = aggressive.
    pub slab_automove: u8,
    /// Chunks inspected per rebalance critical section.
    pub bulk_check: usize,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            limit_bytes: DEFAULT_LIMIT_BYTES,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            page_bytes: DEFAULT_PAGE_BYTES,
            chunk_align: DEFAULT_CHUNK_ALIGN,
            initial_chunk_size: DEFAULT_INITIAL_CHUNK_SIZE,
            prealloc: false,
            slab_reassign: true,
            slab_automove: 0,
            bulk_check: DEFAULT_BULK_CHECK,
        }
    }
}

impl SlabConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total memory limit in bytes. 0 means unlimited.
    pub fn limit_bytes(mut self, bytes: usize) -> Self {
        self.limit_bytes = bytes;
        self
    }

    /// Set the growth factor between slab classes.
    ///
    /// Default is 1.25 (~20% worst-case fragmentation). Must be > 1.0.
    pub fn growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    /// Set the page size in bytes.
    ///
    /// This also determines the maximum item size: the largest class has
    /// exactly one chunk per page.
    pub fn page_bytes(mut self, bytes: usize) -> Self {
        self.page_bytes = bytes;
        self
    }

    /// Set the chunk alignment.
    pub fn chunk_align(mut self, align: usize) -> Self {
        self.chunk_align = align;
        self
    }

    /// Preallocate the whole limit as a single region.
    pub fn prealloc(mut self, prealloc: bool) -> Self {
        self.prealloc = prealloc;
        self
    }

    /// Enable or disable uniform page sizing (and thus rebalancing).
    pub fn slab_reassign(mut self, enabled: bool) -> Self {
        self.slab_reassign = enabled;
        self
    }

    /// Set the automover mode: 0 = off, 1 = gentle, 2 = aggressive.
    pub fn slab_automove(mut self, mode: u8) -> Self {
        self.slab_automove = mode.min(2);
        self
    }

    /// Set the number of chunks inspected per rebalance critical section.
    pub fn bulk_check(mut self, chunks: usize) -> Self {
        self.bulk_check = chunks.max(1);
        self
    }
}

/// `MEMCACHED_SLAB_BULK_CHECK` override for [`SlabConfig::bulk_check`].
///
/// Unparseable or zero values are ignored.
pub(crate) fn bulk_check_from_env() -> Option<usize> {
    std::env::var("MEMCACHED_SLAB_BULK_CHECK")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
}

/// `T_MEMD_INITIAL_MALLOC` seeds the malloced-bytes counter at init.
/// Used by test harnesses to fake prior allocation.
pub(crate) fn initial_malloc_from_env() -> Option<usize> {
    std::env::var("T_MEMD_INITIAL_MALLOC")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}
