//! Seam between the pool and the item subsystem (hash table + LRU).
//!
//! The pool never walks the hash table itself. It needs exactly two
//! things from the item subsystem: the ability to unlink a live item
//! while migrating its page, and a snapshot of per-class eviction
//! counters to drive the automover.

use std::ptr::NonNull;

use ahash::RandomState;

use crate::item::ItemHeader;
use crate::stats::StatSink;

/// Hash a key the way the pool hashes it before calling
/// [`ItemStore::unlink_item`].
///
/// Fixed seeds so the pool and the item subsystem agree on key hashes
/// across instances and restarts.
#[inline]
pub fn key_hash(key: &[u8]) -> u64 {
    RandomState::with_seeds(
        0x6c62_272e_07bb_0142,
        0x62b8_2175_6295_c58d,
        0x2001_0842_4220_1015,
        0x1778_0841_4002_0127,
    )
    .hash_one(key)
}

/// Hooks the pool calls into the item subsystem.
///
/// Implementations must not call back into the pool from these methods;
/// the allocator lock is held.
pub trait ItemStore: Send + Sync {
    /// Remove a linked item from the hash table and LRU.
    ///
    /// Called by the rebalancer with the cache lock held. The item still
    /// carries the rebalancer's reference; the implementation must drop
    /// only its own link reference and must not free the chunk.
    ///
    /// # Safety
    ///
    /// `item` points into a slab page that remains valid for the duration
    /// of the call, and only for it.
    unsafe fn unlink_item(&self, item: NonNull<ItemHeader>, key_hash: u64);

    /// Fill `out[class]` with the cumulative eviction count per class.
    ///
    /// Entries past the populated classes are left untouched.
    fn evictions_snapshot(&self, out: &mut [u64]);

    /// Bytes owned by the external hash table, counted against the
    /// memory limit.
    fn hash_bytes(&self) -> usize {
        0
    }

    /// Forward per-class command counters into a stats sink.
    fn command_counters(&self, _class: usize, _sink: &mut dyn StatSink) {}

    /// Forward item-subsystem global counters into a stats sink.
    fn global_counters(&self, _sink: &mut dyn StatSink) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_deterministic() {
        assert_eq!(key_hash(b"key"), key_hash(b"key"));
        assert_ne!(key_hash(b"key"), key_hash(b"other"));
    }
}
