//! # tarndb - an embedded key/value store
//!
//! tarndb is the storage core of an embedded database: a durable,
//! concurrent B+tree over a fixed-size paged file, with a bounded node
//! cache, an atomic commit protocol, and reversible transactions.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tarndb::Database;
//!
//! let db = Database::builder()
//!     .page_size(4096)
//!     .max_cached_nodes(256)
//!     .create("/path/to/store.db")?;
//!
//! db.store(b"hello", b"world")?;
//! assert_eq!(db.load(b"hello")?, Some(b"world".to_vec()));
//! db.commit()?;
//!
//! let txn = db.begin();
//! txn.store(b"hello", b"goodbye")?;
//! txn.rollback()?; // back to "world"
//! ```
//!
//! ## Architecture
//!
//! The core is organized in four layers, leaves first:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Database (store/load, txns, commit)     │
//! ├──────────────────────────────────────────┤
//! │  Tree (latched descent, splits)          │
//! ├───────────────────┬──────────────────────┤
//! │  NodeCache (LRU,  │  UndoLog (reverse    │
//! │  dirty tracking)  │  ops, page chains)   │
//! ├───────────────────┴──────────────────────┤
//! │  PageStore (allocator, dual-header       │
//! │  commit, free list)                      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Nodes are slotted pages: a sorted search vector of two-byte offsets in
//! the middle, variable-length entries growing inward from both ends, and
//! a garbage counter that compaction resets. Mutations are copy-on-write
//! at page granularity: dirtying a node moves it to a freshly reserved
//! page id, so the previous commit stays intact on disk until the next
//! header swap, and a crash at any instant falls back to it.
//!
//! The commit coordinator cuts a consistent snapshot without stopping
//! writers: it flips the dirty-generation tag under the exclusive commit
//! lock, then walks and writes the previous generation while new mutations
//! proceed under the new one.
//!
//! Values too large to inline spill into chained overflow pages; keys are
//! bounded by the page size. Transactions record reverse operations in
//! per-transaction undo logs which spill from a small buffer into chained
//! pages, survive crashes via a master undo log named by the commit
//! header, and are replayed by recovery on open.

pub mod config;
pub mod encoding;
pub mod memory;
pub mod store;

mod database;
mod tree;
mod undo;

pub use database::{CustomUndoHandler, Database, DatabaseConfig, Transaction};
pub use undo::{NoopLockHolder, RecoveryLockHolder, RecoveryLockMode};
