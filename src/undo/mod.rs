//! # Undo Module
//!
//! Per-transaction reverse-operation stacks and their recovery path.
//!
//! - [`log`]: the append-only stack itself, buffered in memory until it
//!   outgrows half a page, then spilled into chained unevictable pages.
//! - [`recovery`]: the master undo log written at commit and the
//!   reconstruction of per-transaction logs after a crash.
//!
//! Applying a popped record is delegated through [`UndoTarget`], which the
//! database implements over its tree; the log itself never touches tree
//! pages except its own.

pub(crate) mod log;
pub(crate) mod recovery;

use eyre::Result;

use crate::encoding::entry::{LeafValue, FRAGMENT_DESC_LEN};

pub use recovery::{NoopLockHolder, RecoveryLockHolder, RecoveryLockMode};

/// Receiver for reverse operations during rollback and recovery. Callers
/// hold the shared commit lock across an application run; implementations
/// must not re-acquire it.
pub(crate) trait UndoTarget {
    /// UNINSERT: delete the key.
    fn undo_delete(&self, txn_id: u64, index_id: u64, key: &[u8]) -> Result<()>;

    /// UNUPDATE / UNDELETE: store the saved entry.
    fn undo_store(
        &self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: &LeafValue<'_>,
    ) -> Result<()>;

    /// UNDELETE_FRAGMENTED: restore a parked fragmented value.
    fn undo_restore_fragmented(
        &self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        descriptor: &[u8; FRAGMENT_DESC_LEN],
    ) -> Result<()>;

    /// CUSTOM: dispatch to an installed handler.
    fn undo_custom(&self, payload: &[u8]) -> Result<()>;
}
