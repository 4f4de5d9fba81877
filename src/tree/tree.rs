//! # Tree Operations
//!
//! The descent logic over the node layer: point lookups with shared-latch
//! crab walking, and stores that dirty the path copy-on-write, split
//! overfull leaves, and propagate separators upward.
//!
//! ## Lookup
//!
//! A search holds a shared latch on at most one ancestor at a time: the
//! child is latched before the parent latch is released. A cached child
//! whose id no longer matches the parent's slot has been recycled; the
//! parent is then re-latched exclusively and the child reloaded from the
//! store. The child's id is installed before the parent is released, so
//! concurrent searches for the same child block on its latch instead of
//! loading it twice. A node carrying a split descriptor steers the search
//! to whichever half covers the key.
//!
//! ## Store
//!
//! Mutations run under the shared commit lock. The descent latches the
//! path exclusively, marking each node dirty (which swaps its page id) and
//! patching the parent's child slot before the parent can be released.
//! Ancestors that cannot be forced to split by the pending operation are
//! released early; the rest stay latched so a split can propagate. A leaf
//! split releases the leaf, leaving the descriptor for concurrent readers,
//! and the still-latched parent then adopts the split key. A root split is
//! finished before the root latch is released.
//!
//! ## Large values
//!
//! Values that cannot live inline are written to an overflow chain first;
//! the leaf then stores a fragment descriptor. Replaced chains are
//! released by the caller, which knows whether the store is transactional
//! (chains get parked in the trash) or not (chains are deleted).

use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::{max_key_len, max_leaf_entry, MAX_INLINE_VALUE};
use crate::encoding::entry::{calculate_leaf_entry_len, LeafValue, FRAGMENT_DESC_LEN};

use super::cache::NodeCache;
use super::node::{Node, NodeInner, NodeWriteGuard, SearchPos};
use super::overflow::{self, FragmentDescriptor};
use super::split::{select_node_exclusive, select_node_shared};

/// Value handed to [`Tree::store`]: fresh bytes, or an existing fragment
/// descriptor being re-installed (undo log rollback).
pub(crate) enum StoreValue<'a> {
    Bytes(&'a [u8]),
    Fragment(FragmentDescriptor),
}

/// What a store displaced. Fragmented old values are returned as their
/// descriptor; the caller decides between releasing and parking the chain.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OldValue {
    None,
    Inline(Vec<u8>),
    Fragmented(FragmentDescriptor),
}

enum Repr<'a> {
    Inline(&'a [u8]),
    Fragment([u8; FRAGMENT_DESC_LEN]),
}

pub(crate) struct Tree {
    cache: Arc<NodeCache>,
}

impl Tree {
    pub fn new(cache: Arc<NodeCache>) -> Tree {
        Tree { cache }
    }

    /// Looks up `key`, returning a copy of its value.
    pub fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cache = &*self.cache;
        let store = cache.store();

        'restart: loop {
            let root = cache.root();
            let mut node = root.clone();
            let mut guard = node.read();

            loop {
                if guard.is_leaf() {
                    return match guard.binary_search_leaf(key) {
                        SearchPos::Found(pos) => match guard.retrieve_leaf_value(pos) {
                            LeafValue::Inline(v) => Ok(Some(v.to_vec())),
                            LeafValue::Fragment(desc) => {
                                let desc = FragmentDescriptor::decode(desc);
                                Ok(Some(overflow::read_chain(store, &desc)?))
                            }
                        },
                        SearchPos::Insert(_) => Ok(None),
                    };
                }

                let pos = guard.binary_search_internal(key).internal();
                let child_index = pos >> 1;
                let child_id = guard.retrieve_child_ref_id(pos);

                if let Some(child) = guard.child_nodes[child_index].clone() {
                    let child_guard = child.read();
                    // Check again in case an evict snuck in.
                    if child_guard.id == child_id {
                        drop(guard);
                        let (child, child_guard) = if child_guard.split.is_some() {
                            select_node_shared(child, child_guard, key)
                        } else {
                            (child, child_guard)
                        };
                        cache.used(&child);
                        node = child;
                        guard = child_guard;
                        continue;
                    }
                }

                // Child needs to be loaded; trade the shared latch for an
                // exclusive one and revalidate everything afterwards.
                let node_id = guard.id;
                let is_root = node.same_as(&root);
                drop(guard);
                let mut latched = node.write();
                if !is_root && latched.id != node_id {
                    // The frame was recycled while unlatched.
                    continue 'restart;
                }
                if latched.split.is_some() {
                    let (selected, selected_guard) =
                        select_node_exclusive(node.clone(), latched, key);
                    node = selected;
                    guard = NodeWriteGuard::downgrade(selected_guard);
                    continue;
                }
                if latched.is_leaf() {
                    guard = NodeWriteGuard::downgrade(latched);
                    continue;
                }

                let pos = latched.binary_search_internal(key).internal();
                let child_index = pos >> 1;
                let child_id = latched.retrieve_child_ref_id(pos);

                if let Some(child) = latched.child_nodes[child_index].clone() {
                    let child_guard = child.read();
                    if child_guard.id == child_id {
                        drop(latched);
                        let (child, child_guard) = if child_guard.split.is_some() {
                            select_node_shared(child, child_guard, key)
                        } else {
                            (child, child_guard)
                        };
                        cache.used(&child);
                        node = child;
                        guard = child_guard;
                        continue;
                    }
                }

                let (child, mut child_guard) = cache.alloc_latched_node()?;
                // Publish the expected id first: concurrent searches match
                // it and block on the latch until the read completes.
                child_guard.id = child_id;
                latched.child_nodes[child_index] = Some(child.clone());
                drop(latched);

                if let Err(e) = child_guard.read_from(store, child_id) {
                    // Others will see id zero, assume an evict, and reload.
                    child_guard.id = 0;
                    return Err(e);
                }
                cache.used(&child);
                node = child;
                guard = NodeWriteGuard::downgrade(child_guard);
            }
        }
    }

    /// Stores, updates, or deletes (`value == None`) an entry, returning
    /// whatever the operation displaced. Caller holds the shared commit
    /// lock. Freshly written overflow chains are released again if the
    /// descent fails.
    pub fn store(&self, key: &[u8], value: Option<StoreValue<'_>>) -> Result<OldValue> {
        let cache = &*self.cache;
        let page_size = cache.page_size();
        ensure!(
            key.len() <= max_key_len(page_size),
            "key too large: {} bytes, limit {}",
            key.len(),
            max_key_len(page_size)
        );

        let mut fresh_chain = None;
        let repr = match &value {
            None => None,
            Some(StoreValue::Bytes(v)) => {
                let inline_len = calculate_leaf_entry_len(key, &LeafValue::Inline(v));
                if v.len() > MAX_INLINE_VALUE || inline_len > max_leaf_entry(page_size) {
                    let desc = overflow::write_chain(cache.store(), v)?;
                    fresh_chain = Some(desc);
                    Some(Repr::Fragment(desc.encode()))
                } else {
                    Some(Repr::Inline(v))
                }
            }
            Some(StoreValue::Fragment(desc)) => Some(Repr::Fragment(desc.encode())),
        };
        let leaf_value = match &repr {
            None => None,
            Some(Repr::Inline(v)) => Some(LeafValue::Inline(v)),
            Some(Repr::Fragment(bytes)) => Some(LeafValue::Fragment(bytes)),
        };

        match self.store_descend(key, leaf_value.as_ref()) {
            Ok(old) => Ok(old),
            Err(e) => {
                if let Some(desc) = fresh_chain {
                    // Best effort: the chain was never linked into the tree.
                    let _ = overflow::free_chain(cache.store(), &desc);
                }
                Err(e)
            }
        }
    }

    fn store_descend(&self, key: &[u8], value: Option<&LeafValue<'_>>) -> Result<OldValue> {
        let cache = &*self.cache;
        let store = cache.store();
        let encoded_len = value.map_or(0, |v| calculate_leaf_entry_len(key, v));
        // Worst-case separator entry a child split can push upward.
        let max_internal_entry = 2 + max_key_len(cache.page_size());

        struct Level {
            node: Node,
            guard: NodeWriteGuard,
            child_pos: usize,
        }
        let mut stack: SmallVec<[Level; 8]> = SmallVec::new();

        let mut node = cache.root();
        let mut guard = node.write();
        cache.mark_dirty(&mut guard)?;

        while !guard.is_leaf() {
            let pos = guard.binary_search_internal(key).internal();
            let child_index = pos >> 1;
            let child_id = guard.retrieve_child_ref_id(pos);

            let (child, mut child_guard) = 'resolve: {
                if let Some(c) = guard.child_nodes[child_index].clone() {
                    let cg = c.write();
                    if cg.id == child_id {
                        break 'resolve (c, cg);
                    }
                }
                let (c, mut cg) = cache.alloc_latched_node()?;
                cg.id = child_id;
                guard.child_nodes[child_index] = Some(c.clone());
                if let Err(e) = cg.read_from(store, child_id) {
                    cg.id = 0;
                    return Err(e);
                }
                (c, cg)
            };
            // Splits are resolved while the parent is held, and this
            // descent holds every unreleased ancestor.
            debug_assert!(child_guard.split.is_none());

            if cache.mark_dirty(&mut child_guard)? {
                guard.update_child_ref_id(pos, child_guard.id);
            }
            cache.used(&child);

            let child_safe = if child_guard.is_leaf() {
                value.is_none() || leaf_has_room(&child_guard, encoded_len)
            } else {
                internal_has_room(&child_guard, max_internal_entry)
            };
            stack.push(Level {
                node,
                guard,
                child_pos: pos,
            });
            if child_safe {
                // Nothing above can be forced to split; let them go.
                stack.clear();
            }
            node = child;
            guard = child_guard;
        }

        let old = match guard.binary_search_leaf(key) {
            SearchPos::Found(pos) => {
                let old = match guard.retrieve_leaf_value(pos) {
                    LeafValue::Inline(v) => OldValue::Inline(v.to_vec()),
                    LeafValue::Fragment(desc) => {
                        OldValue::Fragmented(FragmentDescriptor::decode(desc))
                    }
                };
                match value {
                    Some(v) => guard.update_leaf_value(cache, pos, key, v)?,
                    None => guard.delete_leaf_entry(pos),
                }
                old
            }
            SearchPos::Insert(pos) => {
                if let Some(v) = value {
                    guard.insert_leaf_entry(cache, pos, key, v, encoded_len)?;
                }
                OldValue::None
            }
        };

        // Propagate splits. The split node is released first; searches in
        // the window are steered by its descriptor, and the parent is
        // still held so no other mutation can interfere.
        while guard.split.is_some() {
            match stack.pop() {
                Some(mut level) => {
                    drop(guard);
                    level
                        .guard
                        .insert_split_child_ref(cache, level.child_pos, &node)?;
                    node = level.node;
                    guard = level.guard;
                }
                None => {
                    guard.finish_split_root(cache)?;
                    break;
                }
            }
        }

        Ok(old)
    }

    /// Verifies every reachable node, returning how many were checked.
    /// Children missing from the cache are read into throwaway frames;
    /// dirty nodes are always resident or were written back at eviction.
    pub fn verify(&self) -> Result<usize> {
        let root = self.cache.root();
        let guard = root.read();
        self.verify_subtree(&guard)
    }

    fn verify_subtree(&self, node: &NodeInner) -> Result<usize> {
        node.verify()?;
        let mut count = 1;
        if !node.is_leaf() {
            for i in 0..node.child_nodes.len() {
                let child_id = node.retrieve_child_ref_id_from_index(i);
                if let Some(child) = &node.child_nodes[i] {
                    let child_guard = child.read();
                    if child_guard.id == child_id {
                        count += self.verify_subtree(&child_guard)?;
                        continue;
                    }
                }
                count += self.verify_detached(child_id)?;
            }
        }
        Ok(count)
    }

    fn verify_detached(&self, id: u64) -> Result<usize> {
        let mut temp = NodeInner::new_standalone(self.cache.page_size());
        temp.read_from(self.cache.store(), id)?;
        self.verify_subtree(&temp)
    }
}

fn leaf_has_room(node: &NodeInner, encoded_len: usize) -> bool {
    let left = node.search_vec_start as isize - node.left_seg_tail as isize;
    let right = node.right_seg_tail as isize - node.search_vec_end as isize - 1;
    left + right + node.garbage as isize >= encoded_len as isize + 2
}

fn internal_has_room(node: &NodeInner, max_entry: usize) -> bool {
    let left = node.search_vec_start as isize - node.left_seg_tail as isize;
    let right = node.right_seg_tail as isize
        - node.search_vec_end as isize
        - (((node.search_vec_end - node.search_vec_start) as isize) << 2)
        - 17;
    left + right + node.garbage as isize >= max_entry as isize + 10
}
