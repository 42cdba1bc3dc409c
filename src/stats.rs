//! Statistics surface of the pool.
//!
//! Stats are pushed through a [`StatSink`] so the transport (text
//! protocol, admin endpoint, tests) stays out of the pool. [`TextSink`]
//! renders the classic `STAT key value` line format.

use std::fmt;
use std::fmt::Write as _;

/// Receiver for stat key/value pairs.
pub trait StatSink {
    /// Emit one stat.
    fn stat(&mut self, key: &str, value: &dyn fmt::Display);
}

/// Emit a per-class stat, keyed `class:name`.
pub(crate) fn class_stat(sink: &mut dyn StatSink, class: usize, key: &str, value: &dyn fmt::Display) {
    sink.stat(&format!("{class}:{key}"), value);
}

/// A [`StatSink`] that renders `STAT key value` lines into a string.
#[derive(Debug, Default)]
pub struct TextSink {
    out: String,
}

impl TextSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The rendered lines.
    pub fn as_str(&self) -> &str {
        &self.out
    }

    /// Consume the sink, returning the rendered lines.
    pub fn into_string(self) -> String {
        self.out
    }
}

impl StatSink for TextSink {
    fn stat(&mut self, key: &str, value: &dyn fmt::Display) {
        let _ = writeln!(self.out, "STAT {key} {value}");
    }
}

/// Snapshot of one slab class, for embedders that want typed stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    /// Class index.
    pub class: usize,
    /// Chunk size in bytes.
    pub chunk_size: usize,
    /// Chunks per page.
    pub chunks_per_page: usize,
    /// Pages owned by the class.
    pub total_pages: usize,
    /// Total chunks across all pages.
    pub total_chunks: usize,
    /// Chunks currently handed out.
    pub used_chunks: usize,
    /// Chunks on the freelist.
    pub free_chunks: usize,
    /// Net bytes requested through alloc/free.
    pub mem_requested: u64,
}
