//! # Configuration Constants
//!
//! All tunable values for the storage core, grouped by the structures they
//! feed. Several of these depend on each other:
//!
//! ```text
//! page size (512..=65536, power of two)
//!       │
//!       ├─> NODE_HEADER_SIZE (12 bytes, fixed by the node format)
//!       ├─> max_key_len (page_size / 4, capped by the leaf key encoding)
//!       ├─> max_leaf_entry (roughly half the usable page; larger values
//!       │     spill into overflow chains)
//!       └─> undo buffer promotion point (half a page)
//!
//! MAX_INLINE_VALUE (32640)
//!       └─> the two-byte value header tops out at 32640 once the
//!           0xff marker byte is reserved for fragmented values
//!
//! DEFAULT_MIN_CACHED_NODES <= DEFAULT_MAX_CACHED_NODES
//! DEFAULT_MAX_CACHED_NODES >= 2 (eviction assumes at least two frames)
//! TXN_STRIPE_COUNT (power of two, indexes by hashed transaction id)
//! ```

/// Smallest supported page size. The node header plus a couple of entries
/// must fit with room to spare.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size. Node offsets are encoded as u16.
pub const MAX_PAGE_SIZE: usize = 65536;

/// Default page size when the builder does not override it.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Fixed size of the tree node header (type, reserved, garbage, segment
/// tails, search vector bounds).
pub const NODE_HEADER_SIZE: usize = 12;

/// Version tag written into the 12-byte commit header.
pub const ENCODING_VERSION: u32 = 20110514;

/// Largest value stored inline in a leaf entry. Longer values (and entries
/// that would not leave a leaf enough room) move into overflow chains.
pub const MAX_INLINE_VALUE: usize = 32640;

/// Default bounds for the node cache population.
pub const DEFAULT_MIN_CACHED_NODES: usize = 32;
pub const DEFAULT_MAX_CACHED_NODES: usize = 256;

/// Spare page-sized buffers shared by compaction operations.
pub const DEFAULT_SPARE_BUFFER_COUNT: usize = 4;

/// Number of striped transaction-registry latches. Must be a power of two.
pub const TXN_STRIPE_COUNT: usize = 16;

/// Initial capacity of an undo log's heap buffer. Must be a power of two;
/// the buffer doubles until it would exceed half a page, then the log is
/// promoted to chained pages.
pub const UNDO_INITIAL_BUFFER_SIZE: usize = 128;

/// Rounds of the eviction scan before allocation reports cache exhaustion.
/// The first round uses non-blocking latch attempts; later rounds wait up
/// to [`CACHE_EVICT_LATCH_TIMEOUT_MICROS`] per candidate.
pub const CACHE_ALLOC_RETRIES: usize = 3;
pub const CACHE_EVICT_LATCH_TIMEOUT_MICROS: u64 = 200;

const _: () = assert!(DEFAULT_MIN_CACHED_NODES <= DEFAULT_MAX_CACHED_NODES);
const _: () = assert!(DEFAULT_MAX_CACHED_NODES >= 2);
const _: () = assert!(TXN_STRIPE_COUNT.is_power_of_two());
const _: () = assert!(UNDO_INITIAL_BUFFER_SIZE.is_power_of_two());
const _: () = assert!(MIN_PAGE_SIZE.is_power_of_two() && MAX_PAGE_SIZE.is_power_of_two());

/// Longest key the store accepts for a given page size. The hard ceiling is
/// the leaf key encoding (16383); the page-relative bound keeps several
/// keys per node so splits always succeed.
pub fn max_key_len(page_size: usize) -> usize {
    (page_size / 4).min(16383)
}

/// Longest encoded leaf entry allowed to live inline. Entries above this
/// carry their value out of line so a split can always place them.
pub fn max_leaf_entry(page_size: usize) -> usize {
    (page_size - NODE_HEADER_SIZE) / 2 - 22
}
