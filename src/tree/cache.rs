//! # Node Cache
//!
//! A bounded population of node frames fronting the page store. Frames are
//! owned by the cache arena for the life of the process; eviction recycles
//! a frame's contents, never the frame itself, so handles held elsewhere
//! stay valid and detect recycling by comparing page ids.
//!
//! ## LRU list
//!
//! An intrusive doubly-linked list over frame indices orders all frames
//! from least to most recently used. Allocation grows the arena until
//! `max_cached` frames exist, then evicts from the LRU end: each candidate
//! is moved to the MRU position and write-latched without blocking; if the
//! latch is won and the node is evictable, the frame is recycled and
//! returned still latched. A failed full scan is retried a bounded number
//! of times with a short blocking latch timeout before the allocation
//! reports cache exhaustion.
//!
//! ## Dirty discipline
//!
//! A process-wide commit state names one of the two dirty generations.
//! `mark_dirty` is copy-on-write: it reserves a fresh page id, schedules
//! the old id for deletion, and, when the node was dirty under the other
//! generation, first writes the old content out under the old id so the
//! committing snapshot stays complete. Repeated marks within one
//! generation are no-ops. The mutual exclusion between a node's dirty tag
//! and the current commit state is what lets the flush routine identify
//! exactly which nodes belong to the committing snapshot.
//!
//! ## Latch ordering
//!
//! The cache latch is taken after node latches are attempted, and node
//! latch attempts inside the eviction scan never block in the first round.
//! Dirty write-back during eviction takes no commit lock: the victim's
//! write latch serializes it against both mutators and the flush sweep,
//! and the flush syncs only after it has re-latched every node it covers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;

use crate::config::{
    CACHE_ALLOC_RETRIES, CACHE_EVICT_LATCH_TIMEOUT_MICROS, ENCODING_VERSION,
};
use crate::memory::BufferPool;
use crate::store::PageStore;

use super::node::{read_u64, CachedState, Node, NodeInner, NodeWriteGuard, TYPE_LEAF};

const NIL: usize = usize::MAX;

#[derive(Clone, Copy)]
struct Link {
    less: usize,
    more: usize,
}

struct LruState {
    frames: Vec<Node>,
    links: Vec<Link>,
    least: usize,
    most: usize,
}

impl LruState {
    fn link_most(&mut self, frame: usize) {
        self.links[frame] = Link {
            less: self.most,
            more: NIL,
        };
        if self.most != NIL {
            self.links[self.most].more = frame;
        } else {
            self.least = frame;
        }
        self.most = frame;
    }

    fn unlink(&mut self, frame: usize) {
        let Link { less, more } = self.links[frame];
        if less != NIL {
            self.links[less].more = more;
        } else if self.least == frame {
            self.least = more;
        }
        if more != NIL {
            self.links[more].less = less;
        } else if self.most == frame {
            self.most = less;
        }
        self.links[frame] = Link {
            less: NIL,
            more: NIL,
        };
    }

    fn move_to_most(&mut self, frame: usize) {
        if self.most != frame {
            self.unlink(frame);
            self.link_most(frame);
        }
    }
}

pub(crate) struct NodeCache {
    store: Arc<PageStore>,
    spare_pool: BufferPool,
    state: Mutex<LruState>,
    max_cached: usize,
    // Either Dirty0 or Dirty1. Flipped only under the exclusive commit
    // lock; read under the shared lock.
    commit_state: AtomicU8,
    root: Node,
}

impl NodeCache {
    pub fn new(
        store: Arc<PageStore>,
        min_cached: usize,
        max_cached: usize,
        spare_buffers: usize,
    ) -> Result<NodeCache> {
        ensure!(
            min_cached <= max_cached,
            "minimum cached node count exceeds maximum: {} > {}",
            min_cached,
            max_cached
        );
        // Eviction assumes the LRU end always points at a valid frame.
        ensure!(
            max_cached >= 2,
            "maximum cached node count is too small: {}",
            max_cached
        );

        let root = Self::load_root(&store)?;
        let cache = NodeCache {
            spare_pool: BufferPool::new(store.page_size(), spare_buffers),
            state: Mutex::new(LruState {
                frames: Vec::new(),
                links: Vec::new(),
                least: NIL,
                most: NIL,
            }),
            store,
            max_cached,
            commit_state: AtomicU8::new(CachedState::Dirty0 as u8),
            root,
        };

        // Pre-populate the arena. The frames join the usage list clean, so
        // evicting them later costs nothing.
        for _ in 0..min_cached {
            let (_, guard) = cache.alloc_latched_node()?;
            drop(guard);
        }
        Ok(cache)
    }

    /// Loads the root from the committed header, or creates an empty leaf
    /// for a new store. The root is never evicted and never recycled.
    fn load_root(store: &PageStore) -> Result<Node> {
        let header = store.read_extra_commit_data();
        let version = u32::from_be_bytes(header[0..4].try_into().unwrap());

        let node = Node::new_unlinked(store.page_size());
        if version == 0 {
            // New store; start from an empty leaf.
            node.write().init_empty_leaf();
            return Ok(node);
        }
        ensure!(
            version == ENCODING_VERSION,
            "unknown encoding version: {}",
            version
        );
        let root_id = u64::from_be_bytes(header[4..12].try_into().unwrap());
        node.write().read_from(store, root_id)?;
        Ok(node)
    }

    /// The tree root; always the same frame.
    pub fn root(&self) -> Node {
        self.root.clone()
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    /// Current dirty generation tag.
    pub fn commit_state(&self) -> CachedState {
        CachedState::from_u8(self.commit_state.load(Ordering::Acquire))
    }

    /// Flips the dirty generation. Caller holds the exclusive commit lock.
    pub fn flip_commit_state(&self) -> CachedState {
        let current = self.commit_state();
        let next = current.flipped();
        self.commit_state.store(next as u8, Ordering::Release);
        current
    }

    /// Returns a new or recycled frame, write-latched, with id zero and a
    /// clean state.
    pub fn alloc_latched_node(&self) -> Result<(Node, NodeWriteGuard)> {
        for round in 0..CACHE_ALLOC_RETRIES {
            let mut state = self.state.lock();

            if state.frames.len() < self.max_cached {
                let frame = state.frames.len();
                let node = Node::new_frame(self.store.page_size(), frame);
                let guard = node.write();
                state.frames.push(node.clone());
                state.links.push(Link {
                    less: NIL,
                    more: NIL,
                });
                state.link_most(frame);
                return Ok((node, guard));
            }

            let mut remaining = self.max_cached;
            while remaining > 0 {
                let frame = state.least;
                state.move_to_most(frame);
                let node = state.frames[frame].clone();

                let guard = if round == 0 {
                    node.try_write()
                } else {
                    node.try_write_for(Duration::from_micros(CACHE_EVICT_LATCH_TIMEOUT_MICROS))
                };
                if let Some(mut guard) = guard {
                    if self.evict(&mut guard)? {
                        // Return with the latch still held.
                        return Ok((node, guard));
                    }
                }
                remaining -= 1;
            }
            drop(state);
        }
        bail!(
            "node cache is full: no evictable frames among {} candidates",
            self.max_cached
        )
    }

    /// As [`NodeCache::alloc_latched_node`], additionally reserving a page
    /// id and marking the node dirty under the current generation. Caller
    /// holds the shared commit lock.
    pub fn new_node_for_split(&self) -> Result<(Node, NodeWriteGuard)> {
        let (node, mut guard) = self.alloc_latched_node()?;
        guard.id = self.store.reserve_page();
        guard.cached_state = self.commit_state();
        Ok((node, guard))
    }

    /// Recycles a frame's contents. Dirty nodes are written back first;
    /// the write latch held across the write-back is what orders it
    /// against the commit flush, which re-latches every node it examines.
    /// The latch is never released here, even on error.
    fn evict(&self, guard: &mut NodeWriteGuard) -> Result<bool> {
        if !guard.can_evict() {
            return Ok(false);
        }

        if guard.cached_state != CachedState::Clean {
            guard.prepare_write()?;
            guard.write_page(&self.store)?;
            guard.cached_state = CachedState::Clean;
        }

        guard.id = 0;
        guard.child_nodes.clear();
        guard.typ = TYPE_LEAF;
        Ok(true)
    }

    /// Recycles an undo-log frame whose page has been popped. The caller
    /// holds the write latch and has already scheduled the page id.
    pub fn recycle_frame(&self, guard: &mut NodeWriteGuard) {
        guard.id = 0;
        guard.cached_state = CachedState::Clean;
        guard.typ = TYPE_LEAF;
        guard.unevictable = false;
        guard.split = None;
        guard.child_nodes.clear();
    }

    /// True when the node is not dirty under the current generation.
    /// Caller holds the commit lock and any latch on the node.
    pub fn should_mark_dirty(&self, node: &NodeInner) -> bool {
        node.cached_state != self.commit_state()
    }

    /// Marks a node dirty under the current generation, allocating a new
    /// page id and releasing the old one. A node dirty under the other
    /// generation is written out first under its old id, preserving the
    /// committing snapshot. Caller holds the shared commit lock and the
    /// node's write latch, which is never released here.
    pub fn mark_dirty(&self, guard: &mut NodeWriteGuard) -> Result<bool> {
        let state = guard.cached_state;
        let commit_state = self.commit_state();
        if state == commit_state {
            return Ok(false);
        }

        let old_id = guard.id;
        let new_id = self.store.reserve_page();

        if state != CachedState::Clean {
            if let Err(e) = guard.prepare_write() {
                self.store.unreserve_page(new_id);
                return Err(e);
            }
            if let Err(e) = guard.write_page(&self.store) {
                self.store.unreserve_page(new_id);
                return Err(e);
            }
        }
        if old_id != 0 {
            self.store.delete_page(old_id);
        }

        guard.id = new_id;
        guard.cached_state = commit_state;
        Ok(true)
    }

    /// Hints that a node is most recently used. Best effort: when the cache
    /// latch is contended the hint is dropped, since a popular node will
    /// get another chance soon enough.
    pub fn used(&self, node: &Node) {
        if node.frame() == NIL {
            return;
        }
        if let Some(mut state) = self.state.try_lock() {
            if node.frame() < state.frames.len() {
                state.move_to_most(node.frame());
            }
        }
    }

    pub fn read_page(&self, id: u64, buf: &mut [u8]) -> Result<()> {
        self.store.read_page(id, buf)
    }

    pub fn write_reserved_page(&self, id: u64, buf: &[u8]) -> Result<()> {
        self.store.write_reserved_page(id, buf)
    }

    pub fn take_spare(&self) -> Box<[u8]> {
        self.spare_pool.take()
    }

    pub fn put_spare(&self, buffer: Box<[u8]>) {
        self.spare_pool.put(buffer)
    }

    /// Resident frame count, the root excluded.
    pub fn cached_node_count(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Debug check used by eviction tests: every clean resident internal
    /// node must not reference a dirty resident child.
    pub fn verify_clean_parents(&self) -> Result<()> {
        let state = self.state.lock();
        for node in &state.frames {
            if let Some(guard) = node.try_read() {
                if guard.cached_state != CachedState::Clean || guard.is_leaf() {
                    continue;
                }
                for (i, child) in guard.child_nodes.iter().enumerate() {
                    if let Some(child) = child {
                        if let Some(child_guard) = child.try_read() {
                            let child_id = read_u64(
                                &guard.page,
                                guard.search_vec_end + 2 + (i << 3),
                            );
                            ensure!(
                                child_guard.id != child_id
                                    || child_guard.cached_state == CachedState::Clean,
                                "clean node {} references dirty child {}",
                                guard.id,
                                child_id
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
