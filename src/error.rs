//! Error types returned at the pool API boundary.
//!
//! Contract violations (freeing a chunk whose header still carries a
//! class, passing an invalid class to `adjust_requested`) are not errors;
//! they panic, because they mean the caller broke the chunk protocol.

use thiserror::Error;

/// Errors returned by [`SlabPool::alloc`](crate::SlabPool::alloc).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The request cannot be satisfied without exceeding the memory
    /// limit, or the backing arena is exhausted.
    #[error("out of memory")]
    OutOfMemory,
}

/// Errors returned by [`SlabPool::reassign`](crate::SlabPool::reassign).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReassignError {
    /// A rebalance is already in progress.
    #[error("rebalance already running")]
    Running,
    /// A class index is outside the populated range.
    #[error("invalid slab class")]
    BadClass,
    /// The source class has too few pages to give one up.
    #[error("source class has no spare pages")]
    NoSpare,
    /// Source and destination are the same class.
    #[error("source and destination are the same class")]
    SrcDstSame,
    /// The requested page count is zero.
    #[error("requested page count is zero")]
    KillFew,
}

/// Errors returned by
/// [`SlabPool::shrink_expand`](crate::SlabPool::shrink_expand).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResizeError {
    /// The arena was preallocated as a single region and cannot change
    /// size.
    #[error("memory was preallocated and cannot be resized")]
    Inflexible,
    /// The requested limit is smaller than one page.
    #[error("requested limit is smaller than one page")]
    TooSmall,
}
