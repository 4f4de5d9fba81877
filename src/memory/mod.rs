//! # Memory Module
//!
//! Pre-allocated buffer management. Node compaction rebuilds a page into a
//! scratch buffer and hands the old buffer back; the [`buffer_pool`] keeps
//! a fixed set of page-sized buffers circulating so the hot path never
//! allocates.

mod buffer_pool;

pub use buffer_pool::BufferPool;
