//! # Persisted Free Page List
//!
//! The set of reusable page ids is written at each commit into a chain of
//! trunk pages. Each trunk holds a header and a packed array of ids:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! 0       1     page type (FreeList)
//! 1       1     reserved, must be 0
//! 2       2     count: ids stored in this trunk
//! 4       8     next trunk page id (0 = end of chain)
//! 12      8*N   page ids, little endian
//! ```
//!
//! The chain is rewritten wholesale at every commit from the in-memory
//! allocator state; trunk pages of the previous commit are scheduled for
//! deletion at the same time, so the file reaches a steady state instead of
//! growing per commit.

use eyre::{ensure, Result};
use zerocopy::byteorder::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::file::PageFile;

pub const FREE_LIST_PAGE_TYPE: u8 = 4;
pub const TRUNK_HEADER_SIZE: usize = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TrunkHeader {
    page_type: u8,
    reserved: u8,
    count: U16,
    next_trunk: U64,
}

impl TrunkHeader {
    fn new(count: u16, next_trunk: u64) -> Self {
        Self {
            page_type: FREE_LIST_PAGE_TYPE,
            reserved: 0,
            count: U16::new(count),
            next_trunk: U64::new(next_trunk),
        }
    }

    fn from_page(page: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_bytes(&page[..TRUNK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read trunk header: {:?}", e))?;
        ensure!(
            header.page_type == FREE_LIST_PAGE_TYPE,
            "not a free-list trunk page: type {:#04x}",
            header.page_type
        );
        ensure!(
            header.reserved == 0,
            "trunk page reserved byte is {:#04x}",
            header.reserved
        );
        Ok(header)
    }
}

/// Ids one trunk page can hold.
pub fn trunk_capacity(page_size: usize) -> usize {
    (page_size - TRUNK_HEADER_SIZE) / 8
}

/// Writes `ids` into the pre-reserved `trunk_ids` chain. Returns the head
/// page id, or 0 when there is nothing to persist.
pub fn write_chain(
    file: &PageFile,
    page_size: usize,
    trunk_ids: &[u64],
    ids: &[u64],
) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let cap = trunk_capacity(page_size);
    ensure!(
        trunk_ids.len() * cap >= ids.len(),
        "free-list chain too short: {} trunks for {} ids",
        trunk_ids.len(),
        ids.len()
    );

    let mut page = vec![0u8; page_size];
    for (ti, chunk) in ids.chunks(cap).enumerate() {
        let next = trunk_ids.get(ti + 1).copied().unwrap_or(0);
        page.fill(0);
        let header = TrunkHeader::new(chunk.len() as u16, next);
        page[..TRUNK_HEADER_SIZE].copy_from_slice(header.as_bytes());
        for (i, id) in chunk.iter().enumerate() {
            let off = TRUNK_HEADER_SIZE + i * 8;
            page[off..off + 8].copy_from_slice(&id.to_le_bytes());
        }
        file.write_at(trunk_ids[ti] * page_size as u64, &page)?;
    }
    Ok(trunk_ids[0])
}

/// Reads the chain starting at `head`, returning the free ids and the
/// trunk page ids occupied by the chain itself.
pub fn read_chain(file: &PageFile, page_size: usize, head: u64) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut ids = Vec::new();
    let mut trunks = Vec::new();
    let mut page = vec![0u8; page_size];
    let mut next = head;
    while next != 0 {
        ensure!(
            !trunks.contains(&next),
            "free-list chain cycles through page {}",
            next
        );
        file.read_at(next * page_size as u64, &mut page)?;
        let header = TrunkHeader::from_page(&page)?;
        let count = header.count.get() as usize;
        ensure!(
            count <= trunk_capacity(page_size),
            "trunk page {} claims {} ids, capacity is {}",
            next,
            count,
            trunk_capacity(page_size)
        );
        for i in 0..count {
            let off = TRUNK_HEADER_SIZE + i * 8;
            ids.push(u64::from_le_bytes(page[off..off + 8].try_into().unwrap()));
        }
        trunks.push(next);
        next = header.next_trunk.get();
    }
    Ok((ids, trunks))
}
