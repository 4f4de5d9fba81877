//! # Encoding Module
//!
//! Byte-level codecs shared by the tree and the undo log:
//!
//! - [`entry`]: the slotted-node leaf and internal entry formats. These are
//!   wire formats; other implementations read the same pages, so the bit
//!   layout is fixed.
//! - [`varint`]: variable-length unsigned integers used for undo-log
//!   payload lengths.

pub mod entry;
pub mod varint;
