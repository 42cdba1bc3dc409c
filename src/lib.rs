//! Slab allocator with on-line page rebalancing for in-memory caches.
//!
//! This crate owns a bounded region of memory and hands out fixed-size
//! chunks grouped into geometric size classes, the way a memcached-style
//! cache server allocates its items. On top of the allocator sit two
//! background workers that move whole pages between classes as the
//! workload shifts, and release pages entirely when the memory limit is
//! lowered at runtime.
//!
//! # Architecture
//!
//! ```text
//! +----------------------------------------------------------+
//! |                        SlabPool                          |
//! |                                                          |
//! |  +-------------------+     +--------------------------+  |
//! |  | SlabClass 1..=N   |     | Arena                    |  |
//! |  | - chunk freelist  |<----| - prealloc bump region   |  |
//! |  | - page list       |     |   or per-page alloc      |  |
//! |  | - accounting      |     +--------------------------+  |
//! |  +-------------------+                                   |
//! |        ^          ^                                      |
//! |        |          |                                      |
//! |  +-----------+ +--------------+                          |
//! |  | Automover | | Rebalancer   |---> ItemStore hooks      |
//! |  | (policy)  | | (mechanism)  |     (unlink, evictions)  |
//! |  +-----------+ +--------------+                          |
//! +----------------------------------------------------------+
//! ```
//!
//! The automover is policy: it watches per-class eviction deltas and
//! decides which class should give up a page and which should receive
//! one. The rebalancer is mechanism: it drains one page at a time,
//! waiting out or unlinking the live items on it, then grafts the page
//! onto the destination class or returns it to the arena.
//!
//! # Example
//!
//! ```ignore
//! use slabpool::{SlabConfig, SlabPool};
//! use std::sync::Arc;
//!
//! let config = SlabConfig::new()
//!     .limit_bytes(64 * 1024 * 1024)
//!     .slab_automove(1);
//! let pool = Arc::new(SlabPool::new(config, item_store));
//! let maintenance = pool.start_maintenance();
//!
//! let class = pool.classify(item_size);
//! let chunk = pool.alloc(item_size, class)?;
//! // ... hand the chunk to the item subsystem ...
//!
//! maintenance.stop();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod arena;
mod automove;
mod class;
mod config;
mod error;
mod hooks;
mod item;
mod maintenance;
mod pool;
mod rebalance;
mod stats;

pub use config::{
    DEFAULT_BULK_CHECK, DEFAULT_CHUNK_ALIGN, DEFAULT_GROWTH_FACTOR, DEFAULT_LIMIT_BYTES,
    DEFAULT_PAGE_BYTES, MAX_SLAB_CLASSES, SMALLEST, SlabConfig,
};
pub use error::{AllocError, ReassignError, ResizeError};
pub use hooks::{ItemStore, key_hash};
pub use item::{DEAD_CLASS_ID, FLAG_LINKED, FLAG_SLABBED, HEADER_SIZE, ItemHeader};
pub use maintenance::MaintenanceHandle;
pub use pool::SlabPool;
pub use stats::{ClassStats, StatSink, TextSink};
