//! # Undo Log
//!
//! A per-transaction stack of reverse operations. Small logs live in a
//! heap buffer that doubles until it would exceed half a page; beyond that
//! the log is promoted into chained unevictable pages:
//!
//! ```text
//! +----------------------------------------+
//! | byte:   node type (undo log)           |  header
//! | byte:   reserved (must be 0)           |
//! | ushort: pointer to top entry           |
//! | ulong:  lower node id                  |
//! +----------------------------------------+
//! | free space                             |
//! +----------------------------------------+
//! | log stack entries                      |
//! +----------------------------------------+
//! ```
//!
//! Multibyte fields are little endian. Entries are encoded from the tail
//! of the page toward the header. Opcodes below 16 carry no payload; all
//! others are `opcode, varint(len), payload`. Payloads that do not fit the
//! top page spill across the chain; popping walks forward and follows the
//! lower-node links.
//!
//! The in-memory log keeps a handle on every page of its chain, so chain
//! pages can be neither recycled behind its back nor loaded twice. The
//! pages themselves are ordinary dirty nodes and ride along with the
//! commit flush.

use eyre::{bail, ensure, Result};

use crate::config::UNDO_INITIAL_BUFFER_SIZE;
use crate::encoding::entry::{leaf_entry_at, LeafValue};
use crate::encoding::varint;
use crate::store::MasterUndoRef;
use crate::tree::cache::NodeCache;
use crate::tree::node::{Node, NodeWriteGuard, UNDO_HEADER_SIZE};

use super::UndoTarget;

pub(crate) const OP_SCOPE_ENTER: u8 = 1;
pub(crate) const OP_SCOPE_COMMIT: u8 = 2;

// Indicates that the transaction has been committed.
pub(crate) const OP_COMMIT: u8 = 4;

// Committed, and the log is partially truncated. A crash mid-truncate
// leaves a log that recovery treats as already committed.
pub(crate) const OP_COMMIT_TRUNCATE: u8 = 5;

// All ops below 16 have no payload.
const PAYLOAD_OP: u8 = 16;

// Master log record: a buffered log copied whole. Payload is transaction
// id, active index id, buffer size (ushort), and the buffer.
pub(crate) const OP_LOG_COPY: u8 = 16;

// Master log record: a reference to a spilled log. Payload is transaction
// id, active index id, length, top node id, and top entry offset.
pub(crate) const OP_LOG_REF: u8 = 17;

// Payload is the active index id.
pub(crate) const OP_INDEX: u8 = 18;

// Payload is the key to delete, undoing an insert.
pub(crate) const OP_UNINSERT: u8 = 19;

// Payload is an entry-encoded key/value pair to store back.
pub(crate) const OP_UNUPDATE: u8 = 20;
pub(crate) const OP_UNDELETE: u8 = 21;

// Payload is an entry-encoded key plus fragment descriptor; restores a
// parked fragmented value.
pub(crate) const OP_UNDELETE_FRAGMENTED: u8 = 22;

// Payload is an opaque message for the installed handler.
pub(crate) const OP_CUSTOM: u8 = 24;

pub(crate) struct UndoLog {
    txn_id: u64,

    /// Bytes currently pushed. Everything else is modified only while the
    /// shared commit lock is held; see `write_to_master`.
    length: u64,

    buffer: Option<Vec<u8>>,
    buffer_pos: usize,

    /// Page chain, oldest first; the last element is the top. Empty until
    /// the buffered form overflows.
    nodes: Vec<Node>,

    active_index_id: u64,
}

impl UndoLog {
    pub fn new(txn_id: u64) -> UndoLog {
        UndoLog {
            txn_id,
            length: 0,
            buffer: None,
            buffer_pos: 0,
            nodes: Vec::new(),
            active_index_id: 0,
        }
    }

    /// Rebuilds a buffered log from a master LOG_COPY record.
    pub fn from_buffer(txn_id: u64, buffer: Vec<u8>, active_index_id: u64) -> UndoLog {
        UndoLog {
            txn_id,
            length: buffer.len() as u64,
            buffer: Some(buffer),
            buffer_pos: 0,
            nodes: Vec::new(),
            active_index_id,
        }
    }

    /// Rebuilds a spilled log from a master LOG_REF record, loading the
    /// whole chain into unevictable frames.
    pub fn open_chain(
        cache: &NodeCache,
        txn_id: u64,
        top_node_id: u64,
        length: u64,
        top_offset: u16,
        active_index_id: u64,
    ) -> Result<UndoLog> {
        let mut chain = Vec::new(); // newest first while loading
        let mut next = top_node_id;
        while next != 0 {
            ensure!(
                chain.len() < 1 << 20,
                "corrupt undo log: chain from node {} does not terminate",
                top_node_id
            );
            let (node, mut guard) = cache.alloc_latched_node()?;
            guard.read_undo_from(cache.store(), next)?;
            guard.unevictable = true;
            if chain.is_empty() {
                guard.set_undo_top(top_offset as usize);
            }
            let lower = guard.undo_lower_id();
            drop(guard);
            chain.push(node);
            next = lower;
        }
        chain.reverse();
        Ok(UndoLog {
            txn_id,
            length,
            buffer: None,
            buffer_pos: 0,
            nodes: chain,
            active_index_id,
        })
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn active_index_id(&self) -> u64 {
        self.active_index_id
    }

    /// Handles on the page chain, for the commit flush sweep.
    pub fn chain_nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    /// Page ids of the chain, oldest first.
    pub fn chain_page_ids(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.read().id).collect()
    }

    /// Pushes a reverse operation, preceded by an INDEX marker whenever
    /// the index id differs from the active one. Caller holds the shared
    /// commit lock.
    pub fn push(&mut self, cache: &NodeCache, index_id: u64, op: u8, payload: &[u8]) -> Result<()> {
        if index_id != self.active_index_id {
            if self.active_index_id != 0 {
                let prev = self.active_index_id.to_le_bytes();
                self.do_push(cache, OP_INDEX, &prev)?;
            }
            self.active_index_id = index_id;
        }
        self.do_push(cache, op, payload)
    }

    /// Caller holds the shared commit lock.
    pub fn do_push(&mut self, cache: &NodeCache, op: u8, payload: &[u8]) -> Result<()> {
        let varint_len = if op >= PAYLOAD_OP {
            varint::varint_len(payload.len() as u64)
        } else {
            0
        };
        let encoded_len = 1 + varint_len + payload.len();
        let page_size = cache.page_size();

        if self.nodes.is_empty() {
            // Try the local buffer before allocating a node.
            let mut promoted_tail: Option<(Vec<u8>, usize)> = None;
            match &mut self.buffer {
                None => {
                    let new_cap = UNDO_INITIAL_BUFFER_SIZE.max(encoded_len.next_power_of_two());
                    if new_cap <= page_size >> 1 {
                        let mut buffer = vec![0u8; new_cap];
                        let pos = new_cap - encoded_len;
                        write_entry(&mut buffer, pos, op, payload);
                        self.buffer = Some(buffer);
                        self.buffer_pos = pos;
                        self.length += encoded_len as u64;
                        return Ok(());
                    }
                    // Required capacity is large, so just use a node.
                }
                Some(buffer) => {
                    if self.buffer_pos >= encoded_len {
                        let pos = self.buffer_pos - encoded_len;
                        write_entry(buffer, pos, op, payload);
                        self.buffer_pos = pos;
                        self.length += encoded_len as u64;
                        return Ok(());
                    }
                    let size = buffer.len() - self.buffer_pos;
                    let new_cap =
                        (buffer.len() << 1).max((encoded_len + size).next_power_of_two());
                    if new_cap <= page_size >> 1 {
                        let mut grown = vec![0u8; new_cap];
                        let new_pos = new_cap - size;
                        grown[new_pos..].copy_from_slice(&buffer[self.buffer_pos..]);
                        let pos = new_pos - encoded_len;
                        write_entry(&mut grown, pos, op, payload);
                        self.buffer = Some(grown);
                        self.buffer_pos = pos;
                        self.length += encoded_len as u64;
                        return Ok(());
                    }
                    promoted_tail = Some((std::mem::take(buffer), self.buffer_pos));
                }
            }

            // Promote the log into an unevictable page.
            let (node, mut guard) = self.alloc_unevictable_node(cache, 0)?;
            if let Some((buffer, pos)) = promoted_tail {
                let size = buffer.len() - pos;
                let new_pos = page_size - size;
                guard.page[new_pos..].copy_from_slice(&buffer[pos..]);
                guard.set_undo_top(new_pos);
                self.buffer = None;
                self.buffer_pos = 0;
            }
            drop(guard);
            self.nodes.push(node);
        }

        // Push into the top page, marked dirty for the current generation.
        let top = self.nodes.last().expect("undo log lost its top").clone();
        let mut guard = top.write();
        cache.mark_dirty(&mut guard)?;

        let mut pos = guard.undo_top_or_end();
        let mut available = pos - UNDO_HEADER_SIZE;
        if available >= encoded_len {
            let start = pos - encoded_len;
            write_entry(&mut guard.page, start, op, payload);
            guard.set_undo_top(start);
            self.length += encoded_len as u64;
            return Ok(());
        }

        // The payload does not fit; break it up across new pages, tail
        // bytes landing lowest.
        let original_pos = pos;
        let mut remaining = payload.len();
        let mut grown = 0usize;

        loop {
            let amount = available.min(remaining);
            pos -= amount;
            available -= amount;
            remaining -= amount;
            guard.page[pos..pos + amount]
                .copy_from_slice(&payload[remaining..remaining + amount]);
            guard.set_undo_top(pos);

            if remaining == 0 && available >= 1 + varint_len {
                if varint_len > 0 {
                    pos -= varint_len;
                    varint::encode_varint(payload.len() as u64, &mut guard.page[pos..]);
                }
                pos -= 1;
                guard.page[pos] = op;
                guard.set_undo_top(pos);
                break;
            }

            let lower_id = guard.id;
            match self.alloc_unevictable_node(cache, lower_id) {
                Ok((node, new_guard)) => {
                    drop(guard);
                    self.nodes.push(node);
                    grown += 1;
                    guard = new_guard;
                    pos = page_size;
                    available = pos - UNDO_HEADER_SIZE;
                }
                Err(e) => {
                    // Undo the damage: drop the partially built chain and
                    // restore the original top pointer.
                    drop(guard);
                    for _ in 0..grown {
                        let node = self.nodes.pop().expect("chain shorter than grown");
                        let mut g = node.write();
                        cache.store().delete_page(g.id);
                        cache.recycle_frame(&mut g);
                    }
                    let top = self.nodes.last().expect("undo log lost its top").clone();
                    top.write().set_undo_top(original_pos);
                    return Err(e);
                }
            }
        }

        self.length += encoded_len as u64;
        Ok(())
    }

    fn alloc_unevictable_node(
        &self,
        cache: &NodeCache,
        lower_id: u64,
    ) -> Result<(Node, NodeWriteGuard)> {
        let (node, mut guard) = cache.alloc_latched_node()?;
        guard.id = cache.store().reserve_page();
        guard.cached_state = cache.commit_state();
        guard.init_undo_page(lower_id);
        Ok((node, guard))
    }

    /// Pops the newest entry. `delete` releases exhausted pages back to
    /// the store; recovery scans pass false so a chain can be re-read.
    pub fn pop(&mut self, cache: &NodeCache, delete: bool) -> Result<Option<(u8, Vec<u8>)>> {
        if self.nodes.is_empty() {
            let Some(buffer) = &self.buffer else {
                self.length = 0;
                return Ok(None);
            };
            let mut pos = self.buffer_pos;
            if pos >= buffer.len() {
                self.length = 0;
                return Ok(None);
            }
            let op = buffer[pos];
            pos += 1;
            if op < PAYLOAD_OP {
                self.buffer_pos = pos;
                self.length -= 1;
                return Ok(Some((op, Vec::new())));
            }
            let (payload_len, varint_len) = varint::decode_varint(&buffer[pos..])?;
            let payload_len = payload_len as usize;
            pos += varint_len;
            let entry = buffer[pos..pos + payload_len].to_vec();
            self.buffer_pos = pos + payload_len;
            self.length -= (1 + varint_len + payload_len) as u64;
            return Ok(Some((op, entry)));
        }

        let page_size = cache.page_size();

        // Find the newest page that still has entries.
        let mut guard = loop {
            let top = match self.nodes.last() {
                Some(node) => node.clone(),
                None => {
                    self.length = 0;
                    return Ok(None);
                }
            };
            let guard = top.write();
            if guard.undo_top_or_end() < page_size {
                break guard;
            }
            drop(guard);
            self.pop_node(cache, delete);
        };

        let mut pos = guard.undo_top_or_end();
        let op = guard.page[pos];
        pos += 1;

        if op < PAYLOAD_OP {
            self.length -= 1;
            guard.set_undo_top(pos);
            let exhausted = pos >= page_size;
            drop(guard);
            if exhausted {
                self.pop_node(cache, delete);
            }
            return Ok(Some((op, Vec::new())));
        }

        let (payload_len, varint_len) = varint::decode_varint(&guard.page[pos..])?;
        let payload_len = payload_len as usize;
        pos += varint_len;
        self.length -= (1 + varint_len + payload_len) as u64;

        let mut entry = vec![0u8; payload_len];
        let mut entry_pos = 0usize;
        let mut remaining = payload_len;

        loop {
            let available = remaining.min(page_size - pos);
            entry[entry_pos..entry_pos + available]
                .copy_from_slice(&guard.page[pos..pos + available]);
            remaining -= available;
            pos += available;
            guard.set_undo_top(pos);

            let exhausted = pos >= page_size;
            drop(guard);
            if exhausted {
                self.pop_node(cache, delete);
            }
            if remaining == 0 {
                return Ok(Some((op, entry)));
            }
            ensure!(
                !self.nodes.is_empty(),
                "corrupt undo log: remainder of entry is missing"
            );
            let top = self.nodes.last().unwrap().clone();
            guard = top.write();
            pos = guard.undo_top_or_end();
            entry_pos += available;
        }
    }

    /// Retires the top page of the chain. The page id is scheduled for
    /// reuse unless this is a recovery scan over a clean chain.
    fn pop_node(&mut self, cache: &NodeCache, delete: bool) {
        if let Some(node) = self.nodes.pop() {
            let mut guard = node.write();
            if delete {
                cache.store().delete_page(guard.id);
            }
            cache.recycle_frame(&mut guard);
        }
    }

    /// Opens a nested scope, returning the savepoint to roll back to.
    /// Caller holds the shared commit lock.
    pub fn scope_enter(&mut self, cache: &NodeCache) -> Result<u64> {
        let savepoint = self.length;
        self.do_push(cache, OP_SCOPE_ENTER, &[])?;
        Ok(savepoint)
    }

    /// Commits the current scope, returning the new savepoint. Caller
    /// holds the shared commit lock.
    pub fn scope_commit(&mut self, cache: &NodeCache) -> Result<u64> {
        self.do_push(cache, OP_SCOPE_COMMIT, &[])?;
        Ok(self.length)
    }

    /// Pops and applies reverse operations until the log shrinks to the
    /// savepoint. Pass zero to roll back everything. Caller holds the
    /// shared commit lock.
    pub fn scope_rollback(
        &mut self,
        cache: &NodeCache,
        target: &dyn UndoTarget,
        savepoint: u64,
    ) -> Result<()> {
        if savepoint < self.length {
            self.do_rollback(cache, target, savepoint)?;
        }
        Ok(())
    }

    /// Rolls back the whole log. A second call is a no-op. Caller holds
    /// the shared commit lock.
    pub fn rollback(&mut self, cache: &NodeCache, target: &dyn UndoTarget) -> Result<()> {
        if self.length == 0 {
            // Nothing to roll back; return quickly.
            return Ok(());
        }
        self.do_rollback(cache, target, 0)
    }

    fn do_rollback(
        &mut self,
        cache: &NodeCache,
        target: &dyn UndoTarget,
        savepoint: u64,
    ) -> Result<()> {
        while self.length > savepoint {
            let Some((op, entry)) = self.pop(cache, true)? else {
                break;
            };
            self.apply(target, op, &entry)?;
        }
        Ok(())
    }

    fn apply(&mut self, target: &dyn UndoTarget, op: u8, entry: &[u8]) -> Result<()> {
        match op {
            OP_SCOPE_ENTER | OP_SCOPE_COMMIT | OP_COMMIT | OP_COMMIT_TRUNCATE => {
                // Control markers; only recovery reads them.
                Ok(())
            }
            OP_INDEX => {
                ensure!(entry.len() == 8, "corrupt INDEX record: {} bytes", entry.len());
                self.active_index_id = u64::from_le_bytes(entry.try_into().unwrap());
                Ok(())
            }
            OP_UNINSERT => target.undo_delete(self.txn_id, self.active_index_id, entry),
            OP_UNUPDATE | OP_UNDELETE => {
                let (key, value) = leaf_entry_at(entry, 0);
                target.undo_store(self.txn_id, self.active_index_id, key, &value)
            }
            OP_UNDELETE_FRAGMENTED => {
                let (key, value) = leaf_entry_at(entry, 0);
                match value {
                    LeafValue::Fragment(desc) => target.undo_restore_fragmented(
                        self.txn_id,
                        self.active_index_id,
                        key,
                        desc,
                    ),
                    LeafValue::Inline(_) => {
                        bail!("corrupt UNDELETE_FRAGMENTED record: inline value")
                    }
                }
            }
            OP_CUSTOM => target.undo_custom(entry),
            _ => bail!("unknown undo log entry type: {}", op),
        }
    }

    /// Drops all entries. With `commit` set, each page still in the chain
    /// is re-dirtied with a single COMMIT_TRUNCATE on top, so a crash
    /// mid-truncate leaves a log that recovery treats as committed. Caller
    /// holds the shared commit lock.
    pub fn truncate(&mut self, cache: &NodeCache, commit: bool) -> Result<()> {
        self.do_truncate(cache, commit)
    }

    fn do_truncate(&mut self, cache: &NodeCache, commit: bool) -> Result<()> {
        if self.length == 0 {
            self.active_index_id = 0;
            return Ok(());
        }
        if self.nodes.is_empty() {
            if let Some(buffer) = &self.buffer {
                self.buffer_pos = buffer.len();
            }
        } else {
            while !self.nodes.is_empty() {
                self.pop_node(cache, true);
                if commit {
                    if let Some(next) = self.nodes.last() {
                        let next = next.clone();
                        let mut guard = next.write();
                        cache.mark_dirty(&mut guard)?;
                        let end = cache.page_size() - 1;
                        guard.page[end] = OP_COMMIT_TRUNCATE;
                        guard.set_undo_top(end);
                    }
                }
            }
        }
        self.length = 0;
        self.active_index_id = 0;
        Ok(())
    }

    /// Ensures the log is stored in persistable pages. Used on the master
    /// log before its location goes into the commit header. Caller holds
    /// the commit lock.
    pub fn persist_ready(&mut self, cache: &NodeCache) -> Result<()> {
        if !self.nodes.is_empty() || self.length == 0 {
            return Ok(());
        }
        let page_size = cache.page_size();
        let (node, mut guard) = self.alloc_unevictable_node(cache, 0)?;
        if let Some(buffer) = self.buffer.take() {
            let pos = self.buffer_pos;
            let size = buffer.len() - pos;
            let new_pos = page_size - size;
            guard.page[new_pos..].copy_from_slice(&buffer[pos..]);
            guard.set_undo_top(new_pos);
            self.buffer_pos = 0;
        }
        drop(guard);
        self.nodes.push(node);
        Ok(())
    }

    /// Location of this log for the commit header. None while empty.
    pub fn master_ref(&self) -> Option<MasterUndoRef> {
        let top = self.nodes.last()?;
        let guard = top.read();
        Some(MasterUndoRef {
            node_id: guard.id,
            length: self.length,
            top_offset: guard.undo_top() as u16,
        })
    }

    /// Emits this log into the master log: a LOG_COPY of the buffer, or a
    /// LOG_REF naming the spilled chain. Caller holds the exclusive commit
    /// lock.
    pub fn write_to_master(&self, cache: &NodeCache, master: &mut UndoLog) -> Result<()> {
        if let Some(top) = self.nodes.last() {
            let guard = top.read();
            let mut payload = Vec::with_capacity(8 + 8 + 8 + 8 + 2);
            payload.extend_from_slice(&self.txn_id.to_le_bytes());
            payload.extend_from_slice(&self.active_index_id.to_le_bytes());
            payload.extend_from_slice(&self.length.to_le_bytes());
            payload.extend_from_slice(&guard.id.to_le_bytes());
            payload.extend_from_slice(&(guard.undo_top() as u16).to_le_bytes());
            drop(guard);
            master.do_push(cache, OP_LOG_REF, &payload)
        } else if let Some(buffer) = &self.buffer {
            let size = buffer.len() - self.buffer_pos;
            if size == 0 {
                return Ok(());
            }
            let mut payload = Vec::with_capacity(8 + 8 + 2 + size);
            payload.extend_from_slice(&self.txn_id.to_le_bytes());
            payload.extend_from_slice(&self.active_index_id.to_le_bytes());
            payload.extend_from_slice(&(size as u16).to_le_bytes());
            payload.extend_from_slice(&buffer[self.buffer_pos..]);
            master.do_push(cache, OP_LOG_COPY, &payload)
        } else {
            Ok(())
        }
    }

    /// Unpins the chain frames. Used once the master log is durable; the
    /// pages stay valid on disk and the frames recycle naturally.
    pub fn release_frames(&mut self, _cache: &NodeCache) {
        for node in self.nodes.drain(..) {
            node.write().unevictable = false;
        }
        self.buffer = None;
        self.buffer_pos = 0;
        self.length = 0;
    }
}

fn write_entry(dest: &mut [u8], pos: usize, op: u8, payload: &[u8]) {
    dest[pos] = op;
    if op >= PAYLOAD_OP {
        let n = varint::encode_varint(payload.len() as u64, &mut dest[pos + 1..]);
        dest[pos + 1 + n..pos + 1 + n + payload.len()].copy_from_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PageStore;
    use std::sync::Arc;

    const PAGE_SIZE: usize = 512;

    fn new_cache() -> (tempfile::TempDir, NodeCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(PageStore::create(&dir.path().join("undo.db"), PAGE_SIZE).unwrap());
        let cache = NodeCache::new(store, 0, 32, 2).unwrap();
        (dir, cache)
    }

    fn push(log: &mut UndoLog, cache: &NodeCache, op: u8, payload: &[u8]) {
        let _commit = cache.store().shared_commit_lock();
        log.push(cache, 1, op, payload).unwrap();
    }

    #[test]
    fn push_pop_is_lifo_in_buffer() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(7);

        push(&mut log, &cache, OP_UNINSERT, b"first");
        push(&mut log, &cache, OP_UNINSERT, b"second");
        push(&mut log, &cache, OP_UNINSERT, b"third");
        assert!(log.nodes.is_empty(), "small log should stay buffered");

        assert_eq!(
            log.pop(&cache, true).unwrap(),
            Some((OP_UNINSERT, b"third".to_vec()))
        );
        assert_eq!(
            log.pop(&cache, true).unwrap(),
            Some((OP_UNINSERT, b"second".to_vec()))
        );
        assert_eq!(
            log.pop(&cache, true).unwrap(),
            Some((OP_UNINSERT, b"first".to_vec()))
        );
        assert_eq!(log.pop(&cache, true).unwrap(), None);
        assert_eq!(log.length(), 0);
    }

    #[test]
    fn payloadless_ops_cost_one_byte() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(1);
        push(&mut log, &cache, OP_SCOPE_ENTER, &[]);
        assert_eq!(log.length(), 1);
        assert_eq!(log.pop(&cache, true).unwrap(), Some((OP_SCOPE_ENTER, Vec::new())));
    }

    #[test]
    fn buffer_grows_by_doubling() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(1);
        push(&mut log, &cache, OP_UNINSERT, &[0u8; 100]);
        push(&mut log, &cache, OP_UNINSERT, &[1u8; 100]);
        assert!(log.nodes.is_empty());
        assert!(log.buffer.as_ref().unwrap().len() <= PAGE_SIZE / 2);
    }

    #[test]
    fn log_promotes_to_pages_and_stays_lifo() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(3);

        let payloads: Vec<Vec<u8>> = (0..12u8).map(|i| vec![i; 120]).collect();
        for p in &payloads {
            push(&mut log, &cache, OP_UNDELETE, p);
        }
        assert!(!log.nodes.is_empty(), "log should have spilled into pages");

        for p in payloads.iter().rev() {
            let (op, entry) = log.pop(&cache, true).unwrap().unwrap();
            assert_eq!(op, OP_UNDELETE);
            assert_eq!(&entry, p);
        }
        assert_eq!(log.pop(&cache, true).unwrap(), None);
    }

    #[test]
    fn large_payload_spills_across_chained_pages() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(4);

        let big: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        push(&mut log, &cache, OP_UNDELETE, &big);
        assert!(log.nodes.len() > 1, "payload should span pages");

        let (op, entry) = log.pop(&cache, true).unwrap().unwrap();
        assert_eq!(op, OP_UNDELETE);
        assert_eq!(entry, big);
        assert!(log.nodes.is_empty());
    }

    #[test]
    fn index_markers_emitted_on_index_change() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(5);
        {
            let _commit = cache.store().shared_commit_lock();
            log.push(&cache, 1, OP_UNINSERT, b"a").unwrap();
            log.push(&cache, 2, OP_UNINSERT, b"b").unwrap();
        }

        let (op, _) = log.pop(&cache, true).unwrap().unwrap();
        assert_eq!(op, OP_UNINSERT);
        let (op, entry) = log.pop(&cache, true).unwrap().unwrap();
        assert_eq!(op, OP_INDEX);
        assert_eq!(u64::from_le_bytes(entry.try_into().unwrap()), 1);
        let (op, _) = log.pop(&cache, true).unwrap().unwrap();
        assert_eq!(op, OP_UNINSERT);
    }

    #[test]
    fn truncate_empties_buffered_log() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(6);
        push(&mut log, &cache, OP_UNINSERT, b"entry");
        log.truncate(&cache, false).unwrap();
        assert_eq!(log.length(), 0);
        assert_eq!(log.pop(&cache, true).unwrap(), None);
    }

    #[test]
    fn truncate_with_commit_stamps_remaining_pages() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(8);
        for i in 0..12u8 {
            push(&mut log, &cache, OP_UNDELETE, &vec![i; 120]);
        }
        let chain_before = log.nodes.len();
        assert!(chain_before > 1);

        log.truncate(&cache, true).unwrap();
        assert_eq!(log.length(), 0);
        assert!(log.nodes.is_empty());
    }

    #[test]
    fn scope_rollback_stops_at_savepoint() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(9);
        push(&mut log, &cache, OP_UNINSERT, b"outer");
        let savepoint = log.scope_enter(&cache).unwrap();
        push(&mut log, &cache, OP_UNINSERT, b"inner");

        struct Collect(std::cell::RefCell<Vec<Vec<u8>>>);
        impl UndoTarget for Collect {
            fn undo_delete(&self, _t: u64, _i: u64, key: &[u8]) -> Result<()> {
                self.0.borrow_mut().push(key.to_vec());
                Ok(())
            }
            fn undo_store(
                &self,
                _t: u64,
                _i: u64,
                _k: &[u8],
                _v: &LeafValue<'_>,
            ) -> Result<()> {
                Ok(())
            }
            fn undo_restore_fragmented(
                &self,
                _t: u64,
                _i: u64,
                _k: &[u8],
                _d: &[u8; 16],
            ) -> Result<()> {
                Ok(())
            }
            fn undo_custom(&self, _p: &[u8]) -> Result<()> {
                Ok(())
            }
        }

        let target = Collect(std::cell::RefCell::new(Vec::new()));
        log.scope_rollback(&cache, &target, savepoint).unwrap();
        assert_eq!(log.length(), savepoint);
        assert_eq!(&*target.0.borrow(), &vec![b"inner".to_vec()]);

        // Rolling back to the same savepoint again is a no-op.
        log.scope_rollback(&cache, &target, savepoint).unwrap();
        assert_eq!(target.0.borrow().len(), 1);
    }

    #[test]
    fn master_ref_round_trip_through_chain() {
        let (_dir, cache) = new_cache();
        let mut log = UndoLog::new(11);
        for i in 0..10u8 {
            push(&mut log, &cache, OP_UNDELETE, &vec![i; 150]);
        }
        let reference = log.master_ref().expect("spilled log has a top node");

        // Persist the chain the way a commit flush would.
        for node in log.chain_nodes() {
            let mut guard = node.write();
            guard.prepare_write().unwrap();
            cache.write_reserved_page(guard.id, &guard.page).unwrap();
        }

        let mut reopened = UndoLog::open_chain(
            &cache,
            11,
            reference.node_id,
            reference.length,
            reference.top_offset,
            1,
        )
        .unwrap();
        for i in (0..10u8).rev() {
            let (op, entry) = reopened.pop(&cache, false).unwrap().unwrap();
            assert_eq!(op, OP_UNDELETE);
            assert_eq!(entry, vec![i; 150]);
        }
    }
}
