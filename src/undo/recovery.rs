//! # Undo Recovery
//!
//! At commit time every registered transaction's undo log is emitted into
//! a master undo log, whose location lands in the commit header together
//! with its explicit length. On open, a non-empty master reference means
//! transactions were alive at the last commit: each is reconstructed from
//! its LOG_COPY or LOG_REF record, scanned for a commit marker and for the
//! locks it held, and then either discarded (committed) or rolled back.
//!
//! Lock re-acquisition happens through [`RecoveryLockHolder`], an abstract
//! seam to whatever lock manager sits above the core. Locks are acquired
//! in their original order, which is the reverse of pop order.

use std::time::Duration;

use eyre::{bail, ensure, Result};

use crate::encoding::entry::leaf_entry_at;
use crate::store::MasterUndoRef;
use crate::tree::cache::NodeCache;

use super::log::{
    UndoLog, OP_COMMIT, OP_COMMIT_TRUNCATE, OP_CUSTOM, OP_INDEX, OP_LOG_COPY, OP_LOG_REF,
    OP_SCOPE_ENTER, OP_SCOPE_COMMIT, OP_UNDELETE, OP_UNDELETE_FRAGMENTED, OP_UNINSERT,
    OP_UNUPDATE,
};

/// How recovery re-acquires the locks of an in-flight transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryLockMode {
    Exclusive,
    Upgradable,
    /// Skip lock re-acquisition entirely.
    Unsafe,
}

/// Abstract lock holder consulted while transactions are recovered. The
/// lock manager itself lives outside the storage core.
pub trait RecoveryLockHolder: Send + Sync {
    fn lock(
        &self,
        mode: RecoveryLockMode,
        index_id: u64,
        key: &[u8],
        timeout: Duration,
    ) -> Result<()>;
}

/// Default holder for callers without a lock manager.
pub struct NoopLockHolder;

impl RecoveryLockHolder for NoopLockHolder {
    fn lock(
        &self,
        _mode: RecoveryLockMode,
        _index_id: u64,
        _key: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        Ok(())
    }
}

/// One transaction reconstructed from the master log.
pub(crate) struct RecoveredTransaction {
    pub txn_id: u64,
    pub committed: bool,
    /// `(index id, key)` pairs, oldest acquisition first.
    pub locks: Vec<(u64, Vec<u8>)>,
    entry: MasterEntry,
}

enum MasterEntry {
    Copy {
        active_index_id: u64,
        buffer: Vec<u8>,
    },
    Ref {
        active_index_id: u64,
        length: u64,
        node_id: u64,
        top_offset: u16,
    },
}

impl RecoveredTransaction {
    /// Rebuilds the transaction's undo log for consumption: rollback for
    /// uncommitted transactions, ghost cleanup for committed ones.
    pub fn reopen_log(&self, cache: &NodeCache) -> Result<UndoLog> {
        match &self.entry {
            MasterEntry::Copy {
                active_index_id,
                buffer,
            } => Ok(UndoLog::from_buffer(
                self.txn_id,
                buffer.clone(),
                *active_index_id,
            )),
            MasterEntry::Ref {
                active_index_id,
                length,
                node_id,
                top_offset,
            } => UndoLog::open_chain(
                cache,
                self.txn_id,
                *node_id,
                *length,
                *top_offset,
                *active_index_id,
            ),
        }
    }
}

/// Replays the master log, reconstructing the transactions it recorded and
/// re-acquiring their locks. The master log is consumed (and its pages
/// scheduled for reuse) as a side effect.
pub(crate) fn recover_transactions(
    cache: &NodeCache,
    master: &MasterUndoRef,
    lock_mode: RecoveryLockMode,
    holder: &dyn RecoveryLockHolder,
    timeout: Duration,
) -> Result<Vec<RecoveredTransaction>> {
    let mut master_log = UndoLog::open_chain(
        cache,
        0,
        master.node_id,
        master.length,
        master.top_offset,
        0,
    )?;

    let mut transactions = Vec::new();
    while let Some((op, entry)) = master_log.pop(cache, true)? {
        let recovered = match op {
            OP_LOG_COPY => parse_log_copy(&entry)?,
            OP_LOG_REF => parse_log_ref(&entry)?,
            _ => bail!("unknown undo log entry type: {}", op),
        };
        transactions.push(recovered);
    }

    for txn in &mut transactions {
        let (committed, locks) = scan_transaction(cache, txn, lock_mode)?;
        txn.committed = committed;
        txn.locks = locks;
        if !txn.committed && lock_mode != RecoveryLockMode::Unsafe {
            // Original acquisition order is the reverse of pop order.
            for (index_id, key) in txn.locks.iter().rev() {
                holder.lock(lock_mode, *index_id, key, timeout)?;
            }
        }
    }

    Ok(transactions)
}

fn parse_log_copy(entry: &[u8]) -> Result<RecoveredTransaction> {
    ensure!(entry.len() >= 8 + 8 + 2, "corrupt LOG_COPY record");
    let txn_id = u64::from_le_bytes(entry[0..8].try_into().unwrap());
    let active_index_id = u64::from_le_bytes(entry[8..16].try_into().unwrap());
    let size = u16::from_le_bytes(entry[16..18].try_into().unwrap()) as usize;
    ensure!(
        entry.len() == 18 + size,
        "corrupt LOG_COPY record: {} != {}",
        entry.len(),
        18 + size
    );
    Ok(RecoveredTransaction {
        txn_id,
        committed: false,
        locks: Vec::new(),
        entry: MasterEntry::Copy {
            active_index_id,
            buffer: entry[18..].to_vec(),
        },
    })
}

fn parse_log_ref(entry: &[u8]) -> Result<RecoveredTransaction> {
    ensure!(entry.len() == 8 + 8 + 8 + 8 + 2, "corrupt LOG_REF record");
    let txn_id = u64::from_le_bytes(entry[0..8].try_into().unwrap());
    let active_index_id = u64::from_le_bytes(entry[8..16].try_into().unwrap());
    let length = u64::from_le_bytes(entry[16..24].try_into().unwrap());
    let node_id = u64::from_le_bytes(entry[24..32].try_into().unwrap());
    let top_offset = u16::from_le_bytes(entry[32..34].try_into().unwrap());
    Ok(RecoveredTransaction {
        txn_id,
        committed: false,
        locks: Vec::new(),
        entry: MasterEntry::Ref {
            active_index_id,
            length,
            node_id,
            top_offset,
        },
    })
}

/// Scans a reconstructed log without consuming the on-disk chain,
/// detecting the commit marker and collecting held locks.
fn scan_transaction(
    cache: &NodeCache,
    txn: &RecoveredTransaction,
    lock_mode: RecoveryLockMode,
) -> Result<(bool, Vec<(u64, Vec<u8>)>)> {
    let mut log = txn.reopen_log(cache)?;
    let mut committed = false;
    let mut locks = Vec::new();
    let mut active_index_id = log.active_index_id();

    while let Some((op, entry)) = log.pop(cache, false)? {
        match op {
            OP_COMMIT | OP_COMMIT_TRUNCATE => committed = true,
            OP_SCOPE_ENTER | OP_SCOPE_COMMIT | OP_CUSTOM => {}
            OP_INDEX => {
                ensure!(entry.len() == 8, "corrupt INDEX record");
                active_index_id = u64::from_le_bytes(entry.try_into().unwrap());
            }
            OP_UNINSERT => {
                if lock_mode != RecoveryLockMode::Unsafe {
                    locks.push((active_index_id, entry));
                }
            }
            OP_UNUPDATE | OP_UNDELETE | OP_UNDELETE_FRAGMENTED => {
                if lock_mode != RecoveryLockMode::Unsafe {
                    let (key, _) = leaf_entry_at(&entry, 0);
                    locks.push((active_index_id, key.to_vec()));
                }
            }
            _ => bail!("unknown undo log entry type: {}", op),
        }
    }

    Ok((committed, locks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_copy_record_round_trip() {
        let mut entry = Vec::new();
        entry.extend_from_slice(&42u64.to_le_bytes());
        entry.extend_from_slice(&7u64.to_le_bytes());
        entry.extend_from_slice(&3u16.to_le_bytes());
        entry.extend_from_slice(&[1, 2, 3]);

        let txn = parse_log_copy(&entry).unwrap();
        assert_eq!(txn.txn_id, 42);
        match &txn.entry {
            MasterEntry::Copy {
                active_index_id,
                buffer,
            } => {
                assert_eq!(*active_index_id, 7);
                assert_eq!(buffer, &[1, 2, 3]);
            }
            _ => panic!("expected copy entry"),
        }
    }

    #[test]
    fn log_ref_record_round_trip() {
        let mut entry = Vec::new();
        entry.extend_from_slice(&9u64.to_le_bytes());
        entry.extend_from_slice(&1u64.to_le_bytes());
        entry.extend_from_slice(&1000u64.to_le_bytes());
        entry.extend_from_slice(&55u64.to_le_bytes());
        entry.extend_from_slice(&300u16.to_le_bytes());

        let txn = parse_log_ref(&entry).unwrap();
        assert_eq!(txn.txn_id, 9);
        match &txn.entry {
            MasterEntry::Ref {
                active_index_id,
                length,
                node_id,
                top_offset,
            } => {
                assert_eq!(*active_index_id, 1);
                assert_eq!(*length, 1000);
                assert_eq!(*node_id, 55);
                assert_eq!(*top_offset, 300);
            }
            _ => panic!("expected ref entry"),
        }
    }

    #[test]
    fn truncated_records_rejected() {
        assert!(parse_log_copy(&[0u8; 10]).is_err());
        assert!(parse_log_ref(&[0u8; 10]).is_err());
    }
}
