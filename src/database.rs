//! # Database
//!
//! Ties the storage core together: one page store, one node cache, one
//! tree, a striped transaction registry, and the commit driver. There is
//! no ambient global; every `Database` is fully independent, and tests
//! instantiate as many as they like.
//!
//! ## Commit
//!
//! `commit()` is the single coordinator. It takes the quick clean check on
//! the root, then the exclusive commit lock and the root write latch,
//! emits the master undo log for every live transaction, and hands the
//! flush routine to the page store's two-phase commit. Only one commit
//! runs at a time; concurrent callers queue on the coordinator mutex so
//! none of them returns before the work it observed is durable.
//!
//! ## Transactions
//!
//! `begin()` registers an undo log under a striped latch (power-of-two
//! stripe count, indexed by hashed transaction id). Mutations route
//! through the tree and push reverse records; `rollback()` replays them,
//! and `commit()` truncates the log with commit markers so a crash
//! mid-truncate still reads as committed. Fragmented values displaced by a
//! transaction are parked in a trash registry until the transaction
//! resolves.
//!
//! ## Recovery
//!
//! Opening a store whose header references a master undo log means the
//! process died with transactions alive. Each is reconstructed, its locks
//! re-acquired through the configured [`RecoveryLockHolder`], committed
//! ones have their parked fragment chains released, uncommitted ones are
//! rolled back, and a fresh commit clears the master reference before the
//! database is handed out.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::config::{
    DEFAULT_MAX_CACHED_NODES, DEFAULT_MIN_CACHED_NODES, DEFAULT_PAGE_SIZE,
    DEFAULT_SPARE_BUFFER_COUNT, TXN_STRIPE_COUNT,
};
use crate::encoding::entry::{encode_leaf_pair, leaf_entry_at, LeafValue, FRAGMENT_DESC_LEN};
use crate::store::{MasterUndoRef, PageStore};
use crate::tree::cache::NodeCache;
use crate::tree::commit;
use crate::tree::node::{CachedState, Node};
use crate::tree::overflow::{self, FragmentDescriptor};
use crate::tree::tree::{OldValue, StoreValue, Tree};
use crate::undo::log::{
    UndoLog, OP_COMMIT, OP_CUSTOM, OP_UNDELETE, OP_UNDELETE_FRAGMENTED, OP_UNINSERT, OP_UNUPDATE,
};
use crate::undo::recovery::{self, NoopLockHolder, RecoveryLockHolder, RecoveryLockMode};
use crate::undo::UndoTarget;

/// Index id of the primary tree in undo records.
const TREE_INDEX_ID: u64 = 1;

/// Handler for CUSTOM undo records.
pub trait CustomUndoHandler: Send + Sync {
    fn undo(&self, payload: &[u8]) -> Result<()>;
}

/// Builder-style configuration for creating or opening a database.
#[derive(Clone)]
pub struct DatabaseConfig {
    page_size: usize,
    min_cached_nodes: usize,
    max_cached_nodes: usize,
    spare_buffer_count: usize,
    recovery_lock_mode: RecoveryLockMode,
    recovery_lock_timeout: Duration,
    recovery_lock_holder: Option<Arc<dyn RecoveryLockHolder>>,
    custom_undo_handler: Option<Arc<dyn CustomUndoHandler>>,
    background_commit_interval: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            page_size: DEFAULT_PAGE_SIZE,
            min_cached_nodes: DEFAULT_MIN_CACHED_NODES,
            max_cached_nodes: DEFAULT_MAX_CACHED_NODES,
            spare_buffer_count: DEFAULT_SPARE_BUFFER_COUNT,
            recovery_lock_mode: RecoveryLockMode::Exclusive,
            recovery_lock_timeout: Duration::from_secs(10),
            recovery_lock_holder: None,
            custom_undo_handler: None,
            background_commit_interval: None,
        }
    }
}

impl DatabaseConfig {
    pub fn new() -> DatabaseConfig {
        DatabaseConfig::default()
    }

    /// Page size for a newly created store. Ignored on open; the store's
    /// own page size wins.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn min_cached_nodes(mut self, count: usize) -> Self {
        self.min_cached_nodes = count;
        self
    }

    pub fn max_cached_nodes(mut self, count: usize) -> Self {
        self.max_cached_nodes = count;
        self
    }

    pub fn spare_buffer_count(mut self, count: usize) -> Self {
        self.spare_buffer_count = count;
        self
    }

    pub fn recovery_lock_mode(mut self, mode: RecoveryLockMode) -> Self {
        self.recovery_lock_mode = mode;
        self
    }

    pub fn recovery_lock_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_lock_timeout = timeout;
        self
    }

    pub fn recovery_lock_holder(mut self, holder: Arc<dyn RecoveryLockHolder>) -> Self {
        self.recovery_lock_holder = Some(holder);
        self
    }

    pub fn custom_undo_handler(mut self, handler: Arc<dyn CustomUndoHandler>) -> Self {
        self.custom_undo_handler = Some(handler);
        self
    }

    /// Runs a background commit on the given interval. Without this, data
    /// becomes durable only when [`Database::commit`] is called.
    pub fn background_commit_interval(mut self, interval: Duration) -> Self {
        self.background_commit_interval = Some(interval);
        self
    }

    pub fn create(self, path: impl AsRef<Path>) -> Result<Database> {
        let store = Arc::new(PageStore::create(path.as_ref(), self.page_size)?);
        Database::assemble(store, self)
    }

    pub fn open(self, path: impl AsRef<Path>) -> Result<Database> {
        let store = Arc::new(PageStore::open(path.as_ref())?);
        Database::assemble(store, self)
    }
}

struct TxnState {
    undo: Mutex<UndoLog>,
}

struct DbInner {
    store: Arc<PageStore>,
    cache: Arc<NodeCache>,
    tree: Tree,
    /// Striped transaction registry, indexed by hashed transaction id.
    txns: Vec<Mutex<HashMap<u64, Arc<TxnState>>>>,
    /// Fragment chains displaced by live transactions, freed at their
    /// commit or restored by their rollback.
    trash: Mutex<HashMap<u64, Vec<FragmentDescriptor>>>,
    next_txn_id: AtomicU64,
    /// Master undo log pages referenced by the current committed header;
    /// superseded (and deleted) by the next commit.
    last_master_pages: Mutex<Vec<u64>>,
    /// Serializes commit coordinators.
    commit_mutex: Mutex<()>,
    custom_undo_handler: Option<Arc<dyn CustomUndoHandler>>,
}

/// An embedded key/value store backed by a copy-on-write B+tree.
pub struct Database {
    inner: Arc<DbInner>,
    background: Option<BackgroundCommit>,
}

/// Periodic commit thread, stopped and joined when the database drops.
struct BackgroundCommit {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BackgroundCommit {
    fn spawn(inner: &Arc<DbInner>, interval: Duration) -> BackgroundCommit {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let weak: Weak<DbInner> = Arc::downgrade(inner);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || loop {
            {
                let mut stopped = thread_stop.0.lock();
                if *stopped {
                    return;
                }
                let _ = thread_stop.1.wait_for(&mut stopped, interval);
                if *stopped {
                    return;
                }
            }
            match weak.upgrade() {
                // Background failures resurface at the next foreground
                // commit; there is nobody here to hand them to.
                Some(db) => {
                    let _ = db.commit(false);
                }
                None => return,
            }
        });
        BackgroundCommit {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(background) = &mut self.background {
            *background.stop.0.lock() = true;
            background.stop.1.notify_all();
            if let Some(handle) = background.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Database {
    pub fn builder() -> DatabaseConfig {
        DatabaseConfig::new()
    }

    /// Creates a new store at `path` with default configuration.
    pub fn create(path: impl AsRef<Path>) -> Result<Database> {
        DatabaseConfig::new().create(path)
    }

    /// Opens an existing store, running transaction recovery if the last
    /// commit recorded live transactions.
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        DatabaseConfig::new().open(path)
    }

    fn assemble(store: Arc<PageStore>, config: DatabaseConfig) -> Result<Database> {
        let cache = Arc::new(NodeCache::new(
            Arc::clone(&store),
            config.min_cached_nodes,
            config.max_cached_nodes,
            config.spare_buffer_count,
        )?);
        let tree = Tree::new(Arc::clone(&cache));

        let inner = Arc::new(DbInner {
            store,
            cache,
            tree,
            txns: (0..TXN_STRIPE_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            trash: Mutex::new(HashMap::new()),
            next_txn_id: AtomicU64::new(1),
            last_master_pages: Mutex::new(Vec::new()),
            commit_mutex: Mutex::new(()),
            custom_undo_handler: config.custom_undo_handler.clone(),
        });

        if let Some(master) = inner.store.master_undo_ref() {
            let holder: Arc<dyn RecoveryLockHolder> = config
                .recovery_lock_holder
                .clone()
                .unwrap_or_else(|| Arc::new(NoopLockHolder));
            inner.recover(
                master,
                config.recovery_lock_mode,
                &*holder,
                config.recovery_lock_timeout,
            )?;
        }

        let background = config
            .background_commit_interval
            .map(|interval| BackgroundCommit::spawn(&inner, interval));

        Ok(Database { inner, background })
    }

    /// Returns a copy of the value stored under `key`.
    pub fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.tree.load(key)
    }

    /// Stores `value` under `key`, replacing any existing value.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let inner = &*self.inner;
        let _commit = inner.store.shared_commit_lock();
        let old = inner.tree.store(key, Some(StoreValue::Bytes(value)))?;
        inner.release_old_value(old)
    }

    /// Deletes the entry stored under `key`, if any.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let inner = &*self.inner;
        let _commit = inner.store.shared_commit_lock();
        let old = inner.tree.store(key, None)?;
        inner.release_old_value(old)
    }

    /// Durably commits all changes, while allowing further changes to be
    /// made concurrently.
    pub fn commit(&self) -> Result<()> {
        self.inner.commit(false)
    }

    /// Begins a transaction whose mutations can be rolled back.
    pub fn begin(&self) -> Transaction {
        let inner = &self.inner;
        let txn_id = inner.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(TxnState {
            undo: Mutex::new(UndoLog::new(txn_id)),
        });
        inner.stripe(txn_id).lock().insert(txn_id, Arc::clone(&state));
        Transaction {
            db: Arc::clone(inner),
            txn_id,
            state,
            done: false,
        }
    }

    /// Verifies every reachable tree node, returning how many were
    /// checked.
    pub fn verify(&self) -> Result<usize> {
        self.inner.tree.verify()
    }

    /// The committed tree header: `(encoding version, root page id)`.
    /// None until the first commit.
    pub fn commit_header(&self) -> Option<(u32, u64)> {
        let extra = self.inner.store.read_extra_commit_data();
        let version = u32::from_be_bytes(extra[0..4].try_into().unwrap());
        if version == 0 {
            return None;
        }
        let root_id = u64::from_be_bytes(extra[4..12].try_into().unwrap());
        Some((version, root_id))
    }

    /// Resident node frames, the pinned root excluded.
    pub fn cached_node_count(&self) -> usize {
        self.inner.cache.cached_node_count()
    }

    #[doc(hidden)]
    pub fn debug_verify_clean_parents(&self) -> Result<()> {
        self.inner.cache.verify_clean_parents()
    }
}

impl DbInner {
    fn stripe(&self, txn_id: u64) -> &Mutex<HashMap<u64, Arc<TxnState>>> {
        let hash = txn_id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.txns[(hash >> 56) as usize & (TXN_STRIPE_COUNT - 1)]
    }

    fn deregister(&self, txn_id: u64) {
        self.stripe(txn_id).lock().remove(&txn_id);
        self.trash.lock().remove(&txn_id);
    }

    /// Frees the chain behind a displaced fragmented value. Caller holds
    /// the shared commit lock.
    fn release_old_value(&self, old: OldValue) -> Result<()> {
        if let OldValue::Fragmented(desc) = old {
            overflow::free_chain(&self.store, &desc)?;
        }
        Ok(())
    }

    fn commit(&self, force: bool) -> Result<()> {
        let _coordinator = self.commit_mutex.lock();
        let root = self.cache.root();

        // Quick check.
        if !force {
            let guard = root.read();
            if guard.cached_state == CachedState::Clean {
                // Root is clean, so nothing to do.
                return Ok(());
            }
        }

        // Commit lock must be acquired first, to prevent deadlock.
        let exclusive = self.store.exclusive_commit_lock();
        let root_guard = root.write();
        if !force && root_guard.cached_state == CachedState::Clean {
            return Ok(());
        }

        // Record every live transaction's undo log in a fresh master log,
        // still under the exclusive lock so the set cannot shift.
        let mut master = UndoLog::new(0);
        let mut undo_nodes: Vec<Node> = Vec::new();
        for stripe in &self.txns {
            for state in stripe.lock().values() {
                let undo = state.undo.lock();
                undo.write_to_master(&self.cache, &mut master)?;
                undo_nodes.extend(undo.chain_nodes());
            }
        }
        let master_ref: Option<MasterUndoRef> = if master.length() > 0 {
            master.persist_ready(&self.cache)?;
            master.master_ref()
        } else {
            None
        };
        undo_nodes.extend(master.chain_nodes());
        let new_master_pages = master.chain_page_ids();

        // The previous commit's master pages are superseded.
        for id in self.last_master_pages.lock().drain(..) {
            self.store.delete_page(id);
        }

        self.store.commit(master_ref, || {
            commit::flush(&self.cache, &self.store, exclusive, root_guard, undo_nodes)
        })?;

        *self.last_master_pages.lock() = new_master_pages;
        master.release_frames(&self.cache);
        Ok(())
    }

    fn recover(
        &self,
        master: MasterUndoRef,
        lock_mode: RecoveryLockMode,
        holder: &dyn RecoveryLockHolder,
        timeout: Duration,
    ) -> Result<()> {
        let transactions =
            recovery::recover_transactions(&self.cache, &master, lock_mode, holder, timeout)?;

        for txn in &transactions {
            let mut log = txn.reopen_log(&self.cache)?;
            let _commit = self.store.shared_commit_lock();
            if txn.committed {
                // Nothing to undo, but fragmented values the transaction
                // displaced were never released; free their chains.
                while let Some((op, entry)) = log.pop(&self.cache, true)? {
                    if op == OP_UNDELETE_FRAGMENTED {
                        if let (_, LeafValue::Fragment(desc)) = leaf_entry_at(&entry, 0) {
                            overflow::free_chain(&self.store, &FragmentDescriptor::decode(desc))?;
                        }
                    }
                }
            } else {
                log.rollback(&self.cache, self)?;
            }
        }

        // Persist the recovered state and clear the master reference, even
        // when the rollbacks net out to a clean tree.
        self.commit(true)
    }
}

impl UndoTarget for DbInner {
    fn undo_delete(&self, _txn_id: u64, index_id: u64, key: &[u8]) -> Result<()> {
        ensure!(index_id == TREE_INDEX_ID, "unknown index id: {}", index_id);
        let old = self.tree.store(key, None)?;
        // A value inserted by the transaction being rolled back may itself
        // have spilled into a chain; nothing else references it.
        self.release_old_value(old)
    }

    fn undo_store(
        &self,
        _txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: &LeafValue<'_>,
    ) -> Result<()> {
        ensure!(index_id == TREE_INDEX_ID, "unknown index id: {}", index_id);
        let old = match value {
            LeafValue::Inline(v) => self.tree.store(key, Some(StoreValue::Bytes(v)))?,
            LeafValue::Fragment(desc) => self.tree.store(
                key,
                Some(StoreValue::Fragment(FragmentDescriptor::decode(desc))),
            )?,
        };
        self.release_old_value(old)
    }

    fn undo_restore_fragmented(
        &self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        descriptor: &[u8; FRAGMENT_DESC_LEN],
    ) -> Result<()> {
        ensure!(index_id == TREE_INDEX_ID, "unknown index id: {}", index_id);
        let desc = FragmentDescriptor::decode(descriptor);
        // Un-park the chain so transaction resolution will not free it.
        if let Some(parked) = self.trash.lock().get_mut(&txn_id) {
            if let Some(at) = parked.iter().position(|d| *d == desc) {
                parked.remove(at);
            }
        }
        let old = self.tree.store(key, Some(StoreValue::Fragment(desc)))?;
        self.release_old_value(old)
    }

    fn undo_custom(&self, payload: &[u8]) -> Result<()> {
        match &self.custom_undo_handler {
            Some(handler) => handler.undo(payload),
            None => bail!("custom undo handler is not installed"),
        }
    }
}

/// A transaction over the database. Mutations push reverse records into a
/// per-transaction undo log; dropping the transaction without committing
/// rolls it back.
pub struct Transaction {
    db: Arc<DbInner>,
    txn_id: u64,
    state: Arc<TxnState>,
    done: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.txn_id
    }

    /// Reads through to the tree. Isolation is the caller's concern; lock
    /// management lives outside the storage core.
    pub fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.tree.load(key)
    }

    /// Stores `value` under `key`, recording how to undo it.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let db = &*self.db;
        let _commit = db.store.shared_commit_lock();
        let old = db.tree.store(key, Some(StoreValue::Bytes(value)))?;
        self.push_reverse(old, key, true)
    }

    /// Deletes the entry under `key`, recording how to undo it.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let db = &*self.db;
        let _commit = db.store.shared_commit_lock();
        let old = db.tree.store(key, None)?;
        self.push_reverse(old, key, false)
    }

    /// Caller holds the shared commit lock.
    fn push_reverse(&self, old: OldValue, key: &[u8], was_store: bool) -> Result<()> {
        let db = &*self.db;
        let mut undo = self.state.undo.lock();
        match old {
            OldValue::None => {
                if was_store {
                    undo.push(&db.cache, TREE_INDEX_ID, OP_UNINSERT, key)?;
                }
                // Deleting a missing key needs no undo record.
            }
            OldValue::Inline(v) => {
                let payload = encode_leaf_pair(key, &LeafValue::Inline(&v));
                let op = if was_store { OP_UNUPDATE } else { OP_UNDELETE };
                undo.push(&db.cache, TREE_INDEX_ID, op, &payload)?;
            }
            OldValue::Fragmented(desc) => {
                // Park the chain instead of freeing it; rollback restores
                // it, commit releases it.
                db.trash.lock().entry(self.txn_id).or_default().push(desc);
                let bytes = desc.encode();
                let payload = encode_leaf_pair(key, &LeafValue::Fragment(&bytes));
                undo.push(&db.cache, TREE_INDEX_ID, OP_UNDELETE_FRAGMENTED, &payload)?;
            }
        }
        Ok(())
    }

    /// Records an application-defined reverse operation, replayed through
    /// the configured [`CustomUndoHandler`] on rollback.
    pub fn push_custom_undo(&self, payload: &[u8]) -> Result<()> {
        let db = &*self.db;
        let _commit = db.store.shared_commit_lock();
        self.state
            .undo
            .lock()
            .push(&db.cache, TREE_INDEX_ID, OP_CUSTOM, payload)
    }

    /// Opens a nested scope; returns the savepoint for
    /// [`Transaction::scope_rollback`].
    pub fn scope_enter(&self) -> Result<u64> {
        let db = &*self.db;
        let _commit = db.store.shared_commit_lock();
        self.state.undo.lock().scope_enter(&db.cache)
    }

    /// Commits the innermost scope; returns the new savepoint.
    pub fn scope_commit(&self) -> Result<u64> {
        let db = &*self.db;
        let _commit = db.store.shared_commit_lock();
        self.state.undo.lock().scope_commit(&db.cache)
    }

    /// Rolls back to a savepoint returned by [`Transaction::scope_enter`].
    pub fn scope_rollback(&self, savepoint: u64) -> Result<()> {
        let db = &*self.db;
        let _commit = db.store.shared_commit_lock();
        self.state
            .undo
            .lock()
            .scope_rollback(&db.cache, &*db, savepoint)
    }

    /// Commits the transaction: the undo log is truncated with commit
    /// markers and parked fragment chains are released. Rollback becomes a
    /// no-op afterwards.
    pub fn commit(mut self) -> Result<()> {
        self.do_commit()
    }

    /// Rolls the transaction back, reversing every recorded mutation.
    pub fn rollback(mut self) -> Result<()> {
        self.do_rollback()
    }

    fn do_commit(&mut self) -> Result<()> {
        let db = Arc::clone(&self.db);
        {
            let _commit = db.store.shared_commit_lock();
            let mut undo = self.state.undo.lock();
            undo.do_push(&db.cache, OP_COMMIT, &[])?;
            undo.truncate(&db.cache, true)?;
            if let Some(parked) = db.trash.lock().remove(&self.txn_id) {
                for desc in parked {
                    overflow::free_chain(&db.store, &desc)?;
                }
            }
        }
        db.deregister(self.txn_id);
        self.done = true;
        Ok(())
    }

    fn do_rollback(&mut self) -> Result<()> {
        let db = Arc::clone(&self.db);
        {
            let _commit = db.store.shared_commit_lock();
            let mut undo = self.state.undo.lock();
            undo.rollback(&db.cache, &*db)?;
        }
        db.deregister(self.txn_id);
        self.done = true;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            // Exiting scope without committing reverts all changes.
            let _ = self.do_rollback();
        }
    }
}
