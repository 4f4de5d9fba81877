//! # Overflow Chains for Fragmented Values
//!
//! Values too large to store inline spill into a chain of overflow pages.
//! The leaf entry keeps a 16-byte descriptor behind the fragment marker;
//! the chain holds the bytes.
//!
//! ## Descriptor
//!
//! ```text
//! 0 : u64 big-endian  total value length
//! 8 : u64 big-endian  head overflow page id
//! ```
//!
//! ## Overflow page layout
//!
//! ```text
//! 0    : u8   page type (Overflow)
//! 1    : u8   reserved, must be 0
//! 2-3  : u16  bytes of value data in this page (little endian)
//! 4-11 : u64  next page id (little endian, 0 = end of chain)
//! 12.. : value data
//! ```
//!
//! Chains are written front to back with all ids reserved up front, so the
//! descriptor can be composed before the leaf entry is touched. Pages are
//! reserved pages like any other: they become durable at commit, and a
//! replaced chain's ids are only recycled after the commit that stops
//! referencing them.

use eyre::{ensure, Result};

use crate::encoding::entry::FRAGMENT_DESC_LEN;
use crate::store::PageStore;

pub(crate) const OVERFLOW_PAGE_TYPE: u8 = 3;
pub(crate) const OVERFLOW_HEADER_SIZE: usize = 12;

/// Locates a fragmented value: its full length and the head of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentDescriptor {
    pub total_len: u64,
    pub head_page: u64,
}

impl FragmentDescriptor {
    pub fn encode(&self) -> [u8; FRAGMENT_DESC_LEN] {
        let mut buf = [0u8; FRAGMENT_DESC_LEN];
        buf[0..8].copy_from_slice(&self.total_len.to_be_bytes());
        buf[8..16].copy_from_slice(&self.head_page.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAGMENT_DESC_LEN]) -> FragmentDescriptor {
        FragmentDescriptor {
            total_len: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            head_page: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

/// Bytes of value data per overflow page.
fn chunk_size(page_size: usize) -> usize {
    page_size - OVERFLOW_HEADER_SIZE
}

/// Writes `value` into a fresh overflow chain. Caller holds the shared
/// commit lock. On failure the reserved ids are returned to the store.
pub(crate) fn write_chain(store: &PageStore, value: &[u8]) -> Result<FragmentDescriptor> {
    debug_assert!(!value.is_empty());
    let page_size = store.page_size();
    let chunk = chunk_size(page_size);
    let count = value.len().div_ceil(chunk);

    let ids: Vec<u64> = (0..count).map(|_| store.reserve_page()).collect();

    let mut page = vec![0u8; page_size];
    for (i, data) in value.chunks(chunk).enumerate() {
        page.fill(0);
        page[0] = OVERFLOW_PAGE_TYPE;
        page[2..4].copy_from_slice(&(data.len() as u16).to_le_bytes());
        let next = ids.get(i + 1).copied().unwrap_or(0);
        page[4..12].copy_from_slice(&next.to_le_bytes());
        page[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + data.len()].copy_from_slice(data);
        if let Err(e) = store.write_reserved_page(ids[i], &page) {
            for id in ids {
                store.unreserve_page(id);
            }
            return Err(e);
        }
    }

    Ok(FragmentDescriptor {
        total_len: value.len() as u64,
        head_page: ids[0],
    })
}

/// Reassembles a fragmented value. The caller still holds a latch on the
/// leaf referencing the descriptor, which keeps the chain from being
/// released mid-read.
pub(crate) fn read_chain(store: &PageStore, desc: &FragmentDescriptor) -> Result<Vec<u8>> {
    let page_size = store.page_size();
    let mut value = Vec::with_capacity(desc.total_len as usize);
    let mut page = vec![0u8; page_size];
    let mut next = desc.head_page;
    let mut remaining = desc.total_len as usize;

    while remaining > 0 {
        ensure!(
            next != 0,
            "corrupt overflow chain: {} bytes missing",
            remaining
        );
        store.read_page(next, &mut page)?;
        ensure!(
            page[0] == OVERFLOW_PAGE_TYPE,
            "corrupt overflow page {}: unexpected type {}",
            next,
            page[0]
        );
        ensure!(
            page[1] == 0,
            "corrupt overflow page {}: illegal reserved byte {}",
            next,
            page[1]
        );
        let len = u16::from_le_bytes([page[2], page[3]]) as usize;
        ensure!(
            len <= chunk_size(page_size) && len <= remaining,
            "corrupt overflow page {}: chunk length {}",
            next,
            len
        );
        value.extend_from_slice(&page[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + len]);
        remaining -= len;
        next = u64::from_le_bytes(page[4..12].try_into().unwrap());
    }
    Ok(value)
}

/// Schedules every page of a chain for deletion. Caller holds the shared
/// commit lock; the ids are recycled only after the next commit.
pub(crate) fn free_chain(store: &PageStore, desc: &FragmentDescriptor) -> Result<()> {
    let page_size = store.page_size();
    let mut page = vec![0u8; page_size];
    let mut next = desc.head_page;
    let mut remaining = desc.total_len as usize;

    while remaining > 0 && next != 0 {
        store.read_page(next, &mut page)?;
        ensure!(
            page[0] == OVERFLOW_PAGE_TYPE,
            "corrupt overflow page {}: unexpected type {}",
            next,
            page[0]
        );
        let len = u16::from_le_bytes([page[2], page[3]]) as usize;
        store.delete_page(next);
        remaining = remaining.saturating_sub(len);
        next = u64::from_le_bytes(page[4..12].try_into().unwrap());
    }
    Ok(())
}
