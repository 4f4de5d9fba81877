//! # PageStore
//!
//! Fixed-size page allocator over a single file, with a two-slot commit
//! header. The tree layer sees five things: page reads, reserved-page
//! writes, id reservation, deferred deletion, and the commit lock pair.
//!
//! ## Header slots
//!
//! Page 0 holds two 96-byte header slots at offsets 0 and 256. A commit
//! writes the slot selected by `commit_counter % 2`, so the previous header
//! survives a torn write. Each slot:
//!
//! ```text
//! 0   : [u8; 8]  magic "tarndb\0\0"
//! 8   : u32      store format version (1)
//! 12  : u32      page size
//! 16  : u64      commit counter
//! 24  : u64      total page count
//! 32  : u64      free-list trunk head page id (0 = empty)
//! 40  : u64      free-list length
//! 48  : u64      master undo log top node id (0 = none)
//! 56  : u64      master undo log length
//! 64  : u16      master undo log top entry offset
//! 66  : [u8;14]  reserved, zero
//! 80  : [u8;12]  extra commit data (big-endian tree commit header)
//! 92  : u32      CRC-32 of bytes 0..92
//! ```
//!
//! Multibyte fields are little endian except the extra commit data, whose
//! interior layout belongs to the tree.
//!
//! ## Id lifecycle
//!
//! `reserve_page` pops a reusable id or grows the file. `delete_page` adds
//! the id to the current generation's pending list; the commit protocol
//! rotates pending ids into a committing list when the dirty generation
//! flips, and promotes them to reusable only after the new header is
//! durable. A crash at any point therefore leaves every page of the last
//! durable commit untouched.

use std::mem;
use std::path::Path;

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};

use super::file::PageFile;
use super::free_list;

const STORE_MAGIC: [u8; 8] = *b"tarndb\0\0";
const STORE_FORMAT_VERSION: u32 = 1;
const HEADER_SLOT_SIZE: usize = 96;
const HEADER_SLOT_STRIDE: u64 = 256;
const HEADER_REGION_SIZE: usize = 512;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// First id handed out to callers; 0 is the "no page" sentinel and 1 is
/// reserved.
const FIRST_ALLOCATABLE_ID: u64 = 2;

/// Location of a persisted master undo log, recorded in the commit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterUndoRef {
    pub node_id: u64,
    pub length: u64,
    pub top_offset: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct StoreHeader {
    magic: [u8; 8],
    format_version: U32,
    page_size: U32,
    commit_counter: U64,
    total_pages: U64,
    free_trunk_head: U64,
    free_page_count: U64,
    master_undo_id: U64,
    master_undo_length: U64,
    master_undo_top: U16,
    reserved: [u8; 14],
    extra_commit_data: [u8; 12],
}

const _: () = assert!(size_of::<StoreHeader>() == HEADER_SLOT_SIZE - 4);

struct Allocator {
    /// Ids reusable right now.
    free: Vec<u64>,
    /// Ids deleted under the current dirty generation.
    pending: Vec<u64>,
    /// Ids deleted under the generation currently being flushed; promoted
    /// to `free` once the commit header is durable.
    committing: Vec<u64>,
    /// File high-water mark in pages.
    total_pages: u64,
    /// Trunk pages referenced by the current committed header.
    trunk_ids: Vec<u64>,
}

struct Committed {
    commit_counter: u64,
    extra: [u8; 12],
    master: Option<MasterUndoRef>,
}

pub struct PageStore {
    file: PageFile,
    page_size: usize,
    commit_lock: RwLock<()>,
    alloc: Mutex<Allocator>,
    committed: Mutex<Committed>,
}

impl PageStore {
    /// Creates a new store file with an empty zeroth commit header.
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        ensure!(
            page_size.is_power_of_two()
                && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "unsupported page size: {}",
            page_size
        );
        let file = PageFile::create(path)?;
        file.write_at(0, &[0u8; HEADER_REGION_SIZE])?;

        let store = Self {
            file,
            page_size,
            commit_lock: RwLock::new(()),
            alloc: Mutex::new(Allocator {
                free: Vec::new(),
                pending: Vec::new(),
                committing: Vec::new(),
                total_pages: FIRST_ALLOCATABLE_ID,
                trunk_ids: Vec::new(),
            }),
            committed: Mutex::new(Committed {
                commit_counter: 0,
                extra: [0u8; 12],
                master: None,
            }),
        };
        store.write_header_slot(0, FIRST_ALLOCATABLE_ID, 0, 0, &None, [0u8; 12])?;
        store.file.sync()?;
        Ok(store)
    }

    /// Opens an existing store, picking the newest valid header slot.
    pub fn open(path: &Path) -> Result<Self> {
        let file = PageFile::open(path)?;
        let mut region = [0u8; HEADER_REGION_SIZE];
        file.read_at(0, &mut region)?;

        let slot0 = parse_header_slot(&region[..HEADER_SLOT_SIZE]);
        let slot1 = parse_header_slot(
            &region[HEADER_SLOT_STRIDE as usize..HEADER_SLOT_STRIDE as usize + HEADER_SLOT_SIZE],
        );
        let header = match (slot0, slot1) {
            (Some(a), Some(b)) => {
                if a.commit_counter.get() >= b.commit_counter.get() {
                    a
                } else {
                    b
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => bail!("corrupt store: no valid commit header slot"),
        };

        let page_size = header.page_size.get() as usize;
        ensure!(
            page_size.is_power_of_two()
                && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
            "corrupt store: page size {} in commit header",
            page_size
        );
        let total_pages = header.total_pages.get();
        ensure!(
            total_pages >= FIRST_ALLOCATABLE_ID,
            "corrupt store: total page count {}",
            total_pages
        );

        let (free, trunk_ids) =
            free_list::read_chain(&file, page_size, header.free_trunk_head.get())?;
        ensure!(
            free.len() as u64 == header.free_page_count.get(),
            "corrupt store: free list holds {} ids, header records {}",
            free.len(),
            header.free_page_count.get()
        );

        let master = if header.master_undo_id.get() != 0 {
            Some(MasterUndoRef {
                node_id: header.master_undo_id.get(),
                length: header.master_undo_length.get(),
                top_offset: header.master_undo_top.get(),
            })
        } else {
            None
        };

        Ok(Self {
            file,
            page_size,
            commit_lock: RwLock::new(()),
            alloc: Mutex::new(Allocator {
                free,
                pending: Vec::new(),
                committing: Vec::new(),
                total_pages,
                trunk_ids,
            }),
            committed: Mutex::new(Committed {
                commit_counter: header.commit_counter.get(),
                extra: header.extra_commit_data,
                master,
            }),
        })
    }

    /// Fixed size of every page in the store.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current high-water mark, in pages.
    pub fn total_pages(&self) -> u64 {
        self.alloc.lock().total_pages
    }

    /// Reads a page into `buf`.
    pub fn read_page(&self, id: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(id >= FIRST_ALLOCATABLE_ID, "illegal page id {}", id);
        debug_assert_eq!(buf.len(), self.page_size);
        self.file
            .read_at(id * self.page_size as u64, buf)
            .map_err(|e| e.wrap_err(format!("reading page {}", id)))
    }

    /// Writes a previously reserved page. Not durable until commit.
    pub fn write_reserved_page(&self, id: u64, buf: &[u8]) -> Result<()> {
        ensure!(id >= FIRST_ALLOCATABLE_ID, "illegal page id {}", id);
        debug_assert_eq!(buf.len(), self.page_size);
        self.file
            .write_at(id * self.page_size as u64, buf)
            .map_err(|e| e.wrap_err(format!("writing page {}", id)))
    }

    /// Allocates a fresh page id from the free list, growing the file when
    /// none is reusable.
    pub fn reserve_page(&self) -> u64 {
        let mut a = self.alloc.lock();
        if let Some(id) = a.free.pop() {
            id
        } else {
            let id = a.total_pages;
            a.total_pages += 1;
            id
        }
    }

    /// Returns an id reserved by [`reserve_page`] that was never used.
    pub fn unreserve_page(&self, id: u64) {
        debug_assert!(id >= FIRST_ALLOCATABLE_ID);
        self.alloc.lock().free.push(id);
    }

    /// Schedules an id for reuse after the next successful commit.
    pub fn delete_page(&self, id: u64) {
        debug_assert!(id >= FIRST_ALLOCATABLE_ID);
        self.alloc.lock().pending.push(id);
    }

    /// Shared side of the commit lock; held by every mutation.
    pub fn shared_commit_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_lock.read()
    }

    /// Exclusive side of the commit lock; serializes the coordinator
    /// against all mutations.
    pub fn exclusive_commit_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_lock.write()
    }

    /// Moves the current generation's deleted ids into the committing set.
    /// Called by the flush routine while the exclusive commit lock is still
    /// held, immediately after the dirty generation flips.
    pub fn rotate_pending_deletes(&self) {
        let mut a = self.alloc.lock();
        let pending = mem::take(&mut a.pending);
        a.committing.extend(pending);
    }

    /// Runs the two-phase commit. The caller holds the exclusive commit
    /// lock at entry; `prepare` flushes the tree (releasing that lock
    /// part-way) and returns the 12-byte extra commit data, which is then
    /// installed atomically together with the free list and `master`.
    pub fn commit(
        &self,
        master: Option<MasterUndoRef>,
        prepare: impl FnOnce() -> Result<[u8; 12]>,
    ) -> Result<()> {
        let extra = prepare()?;
        self.finish_commit(master, extra)
    }

    fn finish_commit(&self, master: Option<MasterUndoRef>, extra: [u8; 12]) -> Result<()> {
        // Snapshot the ids that are free as of this commit: the currently
        // reusable set plus everything deleted by the flushed generation.
        // Ids reserved concurrently by the new generation may still appear
        // in the snapshot; they are unreachable from the new root until the
        // next commit, so a crash leaves them genuinely free.
        let (snapshot, trunks, old_trunks, total_pages) = {
            let mut a = self.alloc.lock();
            let mut snapshot = a.free.clone();
            snapshot.extend_from_slice(&a.committing);
            let cap = free_list::trunk_capacity(self.page_size);
            let need = if snapshot.is_empty() {
                0
            } else {
                snapshot.len().div_ceil(cap)
            };
            // Trunk pages come from file growth, never from the free list,
            // so the snapshot cannot name its own storage.
            let mut trunks = Vec::with_capacity(need);
            for _ in 0..need {
                let id = a.total_pages;
                a.total_pages += 1;
                trunks.push(id);
            }
            let old_trunks = mem::replace(&mut a.trunk_ids, trunks.clone());
            (snapshot, trunks, old_trunks, a.total_pages)
        };

        let head = free_list::write_chain(&self.file, self.page_size, &trunks, &snapshot)?;
        for id in old_trunks {
            self.delete_page(id);
        }

        // Every reserved page and the new free list must be durable before
        // the header that references them.
        self.file.sync()?;

        let mut committed = self.committed.lock();
        let counter = committed.commit_counter + 1;
        self.write_header_slot(counter, total_pages, head, snapshot.len() as u64, &master, extra)?;
        self.file.sync()?;
        committed.commit_counter = counter;
        committed.extra = extra;
        committed.master = master;
        drop(committed);

        let mut a = self.alloc.lock();
        let committing = mem::take(&mut a.committing);
        a.free.extend(committing);
        Ok(())
    }

    fn write_header_slot(
        &self,
        counter: u64,
        total_pages: u64,
        free_trunk_head: u64,
        free_page_count: u64,
        master: &Option<MasterUndoRef>,
        extra: [u8; 12],
    ) -> Result<()> {
        let header = StoreHeader {
            magic: STORE_MAGIC,
            format_version: U32::new(STORE_FORMAT_VERSION),
            page_size: U32::new(self.page_size as u32),
            commit_counter: U64::new(counter),
            total_pages: U64::new(total_pages),
            free_trunk_head: U64::new(free_trunk_head),
            free_page_count: U64::new(free_page_count),
            master_undo_id: U64::new(master.map_or(0, |m| m.node_id)),
            master_undo_length: U64::new(master.map_or(0, |m| m.length)),
            master_undo_top: U16::new(master.map_or(0, |m| m.top_offset)),
            reserved: [0u8; 14],
            extra_commit_data: extra,
        };
        let mut slot = [0u8; HEADER_SLOT_SIZE];
        slot[..size_of::<StoreHeader>()].copy_from_slice(header.as_bytes());
        let crc = CRC32.checksum(&slot[..size_of::<StoreHeader>()]);
        slot[size_of::<StoreHeader>()..].copy_from_slice(&crc.to_le_bytes());
        self.file.write_at((counter % 2) * HEADER_SLOT_STRIDE, &slot)
    }

    /// Extra commit data of the most recent committed header. All zeroes on
    /// a new store.
    pub fn read_extra_commit_data(&self) -> [u8; 12] {
        self.committed.lock().extra
    }

    /// Master undo log reference from the most recent committed header.
    pub fn master_undo_ref(&self) -> Option<MasterUndoRef> {
        self.committed.lock().master
    }

    /// Commit counter of the most recent committed header.
    pub fn commit_counter(&self) -> u64 {
        self.committed.lock().commit_counter
    }
}

fn parse_header_slot(slot: &[u8]) -> Option<StoreHeader> {
    let header = StoreHeader::read_from_bytes(&slot[..size_of::<StoreHeader>()]).ok()?;
    if header.magic != STORE_MAGIC || header.format_version.get() != STORE_FORMAT_VERSION {
        return None;
    }
    let stored = u32::from_le_bytes(slot[size_of::<StoreHeader>()..].try_into().unwrap());
    if CRC32.checksum(&slot[..size_of::<StoreHeader>()]) != stored {
        return None;
    }
    Some(header)
}
