//! # Commit Coordinator
//!
//! Produces a consistent snapshot of the tree as of a chosen instant
//! without stopping the world.
//!
//! The caller has already taken the quick path (shared root latch, return
//! if clean) and arrives here holding the exclusive commit lock and the
//! root's write latch. The flush then:
//!
//! 1. Captures the generation to flush and flips the commit state, so
//!    resumed mutations dirty pages under the new generation.
//! 2. Rotates the store's pending deletions and releases the exclusive
//!    commit lock.
//! 3. Walks the tree breadth-first collecting dirty nodes. A child joins
//!    the list only while its parent's shared latch pins the child
//!    identity: the parent must still point at the same child id and the
//!    child must be tagged with the flushed generation.
//! 4. Sweeps the collected nodes: re-latch, re-verify the tag, transition
//!    to clean, downgrade, and write the page. Nodes redirtied under the
//!    new generation in the meantime fail the re-check and are left for
//!    the next commit.
//! 5. Sweeps the registered undo-log chains the same way, then emits the
//!    12-byte commit header `[encoding version][root id]`.
//!
//! At most one flush runs at a time; the database serializes callers.

use eyre::Result;
use parking_lot::RwLockWriteGuard;

use crate::config::ENCODING_VERSION;
use crate::store::PageStore;

use super::cache::NodeCache;
use super::node::{write_u16, write_u64, CachedState, Node, NodeWriteGuard};

/// Flushes every node dirty under the current generation and returns the
/// commit header for the store to install.
pub(crate) fn flush(
    cache: &NodeCache,
    store: &PageStore,
    exclusive: RwLockWriteGuard<'_, ()>,
    root_guard: NodeWriteGuard,
    undo_nodes: Vec<Node>,
) -> Result<[u8; 12]> {
    let root_id = root_guard.id;
    let state_to_flush = cache.flip_commit_state();
    store.rotate_pending_deletes();
    drop(exclusive);

    // Breadth-first traversal finding dirty nodes. Entries keep their
    // write latch from the moment they are admitted until they have been
    // scanned for children.
    let mut dirty: Vec<(Node, Option<NodeWriteGuard>)> = vec![(cache.root(), Some(root_guard))];

    let mut index = 0;
    while index < dirty.len() {
        let guard = dirty[index].1.take().expect("scan guard already taken");
        index += 1;

        if guard.is_leaf() {
            continue;
        }

        // Allow reads that do not load children while the children are
        // checked.
        let guard = NodeWriteGuard::downgrade(guard);

        for child_index in 0..guard.child_nodes.len() {
            let Some(child) = guard.child_nodes[child_index].clone() else {
                continue;
            };
            let child_id = guard.retrieve_child_ref_id_from_index(child_index);
            let child_guard = child.write();
            if child_guard.id == child_id && child_guard.cached_state == state_to_flush {
                dirty.push((child, Some(child_guard)));
            }
        }
    }

    // Sweep the collected nodes. A node that changed generation since the
    // scan belongs to the next commit.
    for (node, _) in &dirty {
        write_if_still_flushing(node, store, state_to_flush)?;
    }
    for node in &undo_nodes {
        write_if_still_flushing(node, store, state_to_flush)?;
    }

    let mut header = [0u8; 12];
    write_u16(&mut header, 0, (ENCODING_VERSION >> 16) as u16);
    write_u16(&mut header, 2, ENCODING_VERSION as u16);
    write_u64(&mut header, 4, root_id);
    Ok(header)
}

fn write_if_still_flushing(
    node: &Node,
    store: &PageStore,
    state_to_flush: CachedState,
) -> Result<()> {
    let mut guard = node.write();
    if guard.cached_state != state_to_flush {
        return Ok(());
    }
    guard.cached_state = CachedState::Clean;
    guard.prepare_write()?;
    let guard = NodeWriteGuard::downgrade(guard);
    guard.write_page(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENCODING_VERSION;

    #[test]
    fn header_layout_is_version_then_root_id() {
        let mut header = [0u8; 12];
        write_u16(&mut header, 0, (ENCODING_VERSION >> 16) as u16);
        write_u16(&mut header, 2, ENCODING_VERSION as u16);
        write_u64(&mut header, 4, 0x1122334455667788);

        assert_eq!(
            u32::from_be_bytes(header[0..4].try_into().unwrap()),
            20110514
        );
        assert_eq!(
            u64::from_be_bytes(header[4..12].try_into().unwrap()),
            0x1122334455667788
        );
    }
}
