//! The clustered heap store: fixed-size records in slotted pages with a
//! bitmap of occupied slots and a free-list of non-full pages threaded
//! through the page headers.

use std::mem::size_of;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer_pool::{BufferPoolManager, Page, PageGuard, PageId};
use crate::db::Context;
use crate::disk::FileId;
use crate::errors::{DbError, Result};
use crate::{PageNo, Rid, INVALID_PAGE_NO, PAGE_SIZE};

const HEAP_FILE_HDR_PAGE: PageNo = 0;

/// On-disk header of the heap file, stored in page 0.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct HeapFileHdr {
    record_size: u32,
    num_records_per_page: u32,
    num_pages: u32,
    first_free_page: i32,
}

/// Header of every data page.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct HeapPageHdr {
    num_records: u32,
    next_free_page: i32,
}

const PAGE_HDR_SIZE: usize = size_of::<HeapPageHdr>();

fn read_page_hdr(page: &Page) -> HeapPageHdr {
    unsafe { std::ptr::read_unaligned(page.data.as_ptr() as *const HeapPageHdr) }
}

fn write_page_hdr(page: &mut Page, hdr: &HeapPageHdr) {
    unsafe {
        std::ptr::write_unaligned(page.data.as_mut_ptr() as *mut HeapPageHdr, *hdr);
    }
}

mod bitmap {
    pub fn set(map: &mut [u8], pos: usize) {
        map[pos / 8] |= 1 << (pos % 8);
    }

    pub fn reset(map: &mut [u8], pos: usize) {
        map[pos / 8] &= !(1 << (pos % 8));
    }

    pub fn is_set(map: &[u8], pos: usize) -> bool {
        map[pos / 8] & (1 << (pos % 8)) != 0
    }

    /// First position in `[start, n)` whose bit equals `target`, or `n`.
    pub fn next_bit(target: bool, map: &[u8], n: usize, start: usize) -> usize {
        (start..n).find(|&i| is_set(map, i) == target).unwrap_or(n)
    }

    pub fn first_bit(target: bool, map: &[u8], n: usize) -> usize {
        next_bit(target, map, n, 0)
    }
}

struct HeapState {
    num_pages: PageNo,
    first_free_page: PageNo,
}

/// Handle to one table's heap file. Records are fixed-size; a `Rid` names a
/// record by page and slot.
pub struct HeapFile {
    file_id: FileId,
    bpm: Arc<BufferPoolManager>,
    record_size: usize,
    records_per_page: usize,
    bitmap_size: usize,
    state: Mutex<HeapState>,
}

impl HeapFile {
    /// How many fixed-size records fit a data page next to the page header
    /// and the occupancy bitmap.
    pub fn slots_per_page(record_size: usize) -> usize {
        (8 * (PAGE_SIZE - PAGE_HDR_SIZE) - 1) / (1 + 8 * record_size)
    }

    /// Creates a fresh heap file: page 0 becomes the file header.
    pub fn create(bpm: Arc<BufferPoolManager>, name: &str, record_size: usize) -> Result<HeapFile> {
        let file_id = bpm.disk().open_file(name)?;
        let records_per_page = Self::slots_per_page(record_size);
        let heap = HeapFile {
            file_id,
            bpm,
            record_size,
            records_per_page,
            bitmap_size: records_per_page.div_ceil(8),
            state: Mutex::new(HeapState {
                num_pages: 1,
                first_free_page: INVALID_PAGE_NO,
            }),
        };
        {
            let guard = heap.bpm.new_page(file_id)?;
            debug_assert_eq!(guard.page_id().page_no, HEAP_FILE_HDR_PAGE);
        }
        heap.flush_hdr()?;
        Ok(heap)
    }

    /// Opens an existing heap file by reading its header page.
    pub fn open(bpm: Arc<BufferPoolManager>, name: &str) -> Result<HeapFile> {
        let file_id = bpm.disk().open_file(name)?;
        if bpm.disk().num_pages(file_id)? == 0 {
            return Err(DbError::CorruptHeader(format!(
                "heap file {name} has no header page"
            )));
        }
        let hdr = {
            let guard = bpm.acquire_page(PageId::new(file_id, HEAP_FILE_HDR_PAGE))?;
            let page = guard.read();
            unsafe { std::ptr::read_unaligned(page.data.as_ptr() as *const HeapFileHdr) }
        };
        let records_per_page = hdr.num_records_per_page as usize;
        Ok(HeapFile {
            file_id,
            bpm,
            record_size: hdr.record_size as usize,
            records_per_page,
            bitmap_size: records_per_page.div_ceil(8),
            state: Mutex::new(HeapState {
                num_pages: hdr.num_pages as PageNo,
                first_free_page: hdr.first_free_page,
            }),
        })
    }

    /// Writes the in-memory file header back to page 0.
    pub fn flush_hdr(&self) -> Result<()> {
        let state = self.state.lock();
        let hdr = HeapFileHdr {
            record_size: self.record_size as u32,
            num_records_per_page: self.records_per_page as u32,
            num_pages: state.num_pages as u32,
            first_free_page: state.first_free_page,
        };
        let guard = self
            .bpm
            .acquire_page(PageId::new(self.file_id, HEAP_FILE_HDR_PAGE))?;
        let mut page = guard.write();
        unsafe {
            std::ptr::write_unaligned(page.data.as_mut_ptr() as *mut HeapFileHdr, hdr);
        }
        Ok(())
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn records_per_page(&self) -> usize {
        self.records_per_page
    }

    pub fn num_pages(&self) -> PageNo {
        self.state.lock().num_pages
    }

    /// Head of the free-list of non-full pages, or -1.
    pub fn first_free_page(&self) -> PageNo {
        self.state.lock().first_free_page
    }

    fn slot_offset(&self, slot_no: usize) -> usize {
        PAGE_HDR_SIZE + self.bitmap_size + slot_no * self.record_size
    }

    fn bitmap_range(&self) -> std::ops::Range<usize> {
        PAGE_HDR_SIZE..PAGE_HDR_SIZE + self.bitmap_size
    }

    fn check_rid(&self, rid: Rid, num_pages: PageNo) -> Result<()> {
        if rid.page_no <= 0 || rid.page_no >= num_pages {
            return Err(DbError::PageNotExist {
                file_id: self.file_id,
                page_no: rid.page_no,
            });
        }
        if rid.slot_no < 0 || rid.slot_no as usize >= self.records_per_page {
            return Err(DbError::PageNotExist {
                file_id: self.file_id,
                page_no: rid.page_no,
            });
        }
        Ok(())
    }

    fn fetch_page(&self, page_no: PageNo) -> Result<PageGuard<'_>> {
        self.bpm.acquire_page(PageId::new(self.file_id, page_no))
    }

    /// Allocates a fresh data page and makes it the free-list head.
    fn create_page(&self, state: &mut HeapState) -> Result<PageNo> {
        let guard = self.bpm.new_page(self.file_id)?;
        let page_no = guard.page_id().page_no;
        let mut page = guard.write();
        write_page_hdr(
            &mut page,
            &HeapPageHdr {
                num_records: 0,
                next_free_page: INVALID_PAGE_NO,
            },
        );
        state.num_pages += 1;
        state.first_free_page = page_no;
        Ok(page_no)
    }

    /// Returns a copy of the record under a shared row lock.
    pub fn get(&self, rid: Rid, ctx: &Context) -> Result<Vec<u8>> {
        if !ctx.lock_mgr.lock_shared_on_record(ctx.txn, rid, self.file_id) {
            return Err(DbError::lock_denied(ctx.txn.id()));
        }
        self.check_rid(rid, self.state.lock().num_pages)?;
        let guard = self.fetch_page(rid.page_no)?;
        let page = guard.read();
        let off = self.slot_offset(rid.slot_no as usize);
        Ok(page.data[off..off + self.record_size].to_vec())
    }

    /// Reads without locking; the abort path uses this to snapshot the
    /// current on-disk state before undoing.
    pub fn get_for_undo(&self, rid: Rid) -> Result<Vec<u8>> {
        self.check_rid(rid, self.state.lock().num_pages)?;
        let guard = self.fetch_page(rid.page_no)?;
        let page = guard.read();
        let off = self.slot_offset(rid.slot_no as usize);
        Ok(page.data[off..off + self.record_size].to_vec())
    }

    /// Inserts a record into the first page with a free slot, allocating a
    /// new page when the free-list is empty. The lowest clear slot wins to
    /// keep growth localized.
    pub fn insert(&self, buf: &[u8], ctx: &Context) -> Result<Rid> {
        let mut state = self.state.lock();
        loop {
            let page_no = if state.first_free_page != INVALID_PAGE_NO {
                state.first_free_page
            } else {
                self.create_page(&mut state)?
            };
            let guard = self.fetch_page(page_no)?;
            let mut page = guard.write();
            let mut hdr = read_page_hdr(&page);

            let bitmap_range = self.bitmap_range();
            let slot_no = bitmap::first_bit(
                false,
                &page.data[bitmap_range.clone()],
                self.records_per_page,
            );
            if slot_no == self.records_per_page {
                // Stale free-list head (an undo can refill a listed page);
                // unlink it and retry.
                state.first_free_page = hdr.next_free_page;
                continue;
            }

            let rid = Rid::new(page_no, slot_no as i32);
            if !ctx.lock_mgr.lock_exclusive_on_record(ctx.txn, rid, self.file_id) {
                return Err(DbError::lock_denied(ctx.txn.id()));
            }

            let off = self.slot_offset(slot_no);
            page.data[off..off + self.record_size].copy_from_slice(&buf[..self.record_size]);
            bitmap::set(&mut page.data[bitmap_range], slot_no);
            hdr.num_records += 1;
            if hdr.num_records as usize == self.records_per_page {
                // The sentinel in next_free_page propagates to the file
                // header when the page leaves the free-list.
                state.first_free_page = hdr.next_free_page;
            }
            write_page_hdr(&mut page, &hdr);
            return Ok(rid);
        }
    }

    /// Places a record at an exact position. Undo path only: no locking and
    /// no free-list bookkeeping beyond the bitmap and record count.
    pub fn insert_at(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        self.check_rid(rid, self.state.lock().num_pages)?;
        let guard = self.fetch_page(rid.page_no)?;
        let mut page = guard.write();
        let bitmap_range = self.bitmap_range();
        let slot_no = rid.slot_no as usize;
        if !bitmap::is_set(&page.data[bitmap_range.clone()], slot_no) {
            bitmap::set(&mut page.data[bitmap_range], slot_no);
            let mut hdr = read_page_hdr(&page);
            hdr.num_records += 1;
            write_page_hdr(&mut page, &hdr);
        }
        let off = self.slot_offset(slot_no);
        page.data[off..off + self.record_size].copy_from_slice(&buf[..self.record_size]);
        Ok(())
    }

    /// Deletes the record under an exclusive row lock, re-linking the page
    /// at the head of the free-list if it was full before.
    pub fn delete(&self, rid: Rid, ctx: &Context) -> Result<()> {
        if !ctx.lock_mgr.lock_exclusive_on_record(ctx.txn, rid, self.file_id) {
            return Err(DbError::lock_denied(ctx.txn.id()));
        }
        let mut state = self.state.lock();
        self.check_rid(rid, state.num_pages)?;
        let guard = self.fetch_page(rid.page_no)?;
        let mut page = guard.write();
        let mut hdr = read_page_hdr(&page);

        let bitmap_range = self.bitmap_range();
        let slot_no = rid.slot_no as usize;
        if !bitmap::is_set(&page.data[bitmap_range.clone()], slot_no) {
            return Ok(());
        }
        let was_full = hdr.num_records as usize == self.records_per_page;
        bitmap::reset(&mut page.data[bitmap_range], slot_no);
        hdr.num_records -= 1;
        if was_full {
            hdr.next_free_page = state.first_free_page;
            state.first_free_page = rid.page_no;
        }
        write_page_hdr(&mut page, &hdr);
        Ok(())
    }

    /// Overwrites the record in place under an exclusive row lock. Record
    /// size is fixed, so the slot never moves.
    pub fn update(&self, rid: Rid, buf: &[u8], ctx: &Context) -> Result<()> {
        if !ctx.lock_mgr.lock_exclusive_on_record(ctx.txn, rid, self.file_id) {
            return Err(DbError::lock_denied(ctx.txn.id()));
        }
        self.check_rid(rid, self.state.lock().num_pages)?;
        let guard = self.fetch_page(rid.page_no)?;
        let mut page = guard.write();
        let off = self.slot_offset(rid.slot_no as usize);
        page.data[off..off + self.record_size].copy_from_slice(&buf[..self.record_size]);
        Ok(())
    }

    /// Forward cursor over live slots.
    pub fn scan(&self) -> Result<HeapScan<'_>> {
        HeapScan::new(self)
    }
}

/// Linear iteration over the occupied slots of a heap file. Not snapshot
/// isolated: inserts behind the cursor's current page are not observed, and
/// deletes of already-yielded rids do not rewind it.
pub struct HeapScan<'a> {
    heap: &'a HeapFile,
    rid: Rid,
    num_pages: PageNo,
}

impl<'a> HeapScan<'a> {
    fn new(heap: &'a HeapFile) -> Result<Self> {
        let num_pages = heap.state.lock().num_pages;
        let mut scan = HeapScan {
            heap,
            rid: Rid::new(num_pages, 0),
            num_pages,
        };
        scan.seek(1, 0)?;
        Ok(scan)
    }

    /// Positions the cursor at the first set bit at or after
    /// (`page_no`, `slot_no`), or at the end sentinel.
    fn seek(&mut self, mut page_no: PageNo, mut slot_no: usize) -> Result<()> {
        while page_no < self.num_pages {
            let guard = self.heap.fetch_page(page_no)?;
            let page = guard.read();
            let bitmap = &page.data[self.heap.bitmap_range()];
            let found = bitmap::next_bit(true, bitmap, self.heap.records_per_page, slot_no);
            if found < self.heap.records_per_page {
                self.rid = Rid::new(page_no, found as i32);
                return Ok(());
            }
            page_no += 1;
            slot_no = 0;
        }
        self.rid = Rid::new(self.num_pages, 0);
        Ok(())
    }

    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        let (page_no, slot_no) = (self.rid.page_no, self.rid.slot_no as usize + 1);
        self.seek(page_no, slot_no)
    }

    pub fn is_end(&self) -> bool {
        self.rid.page_no >= self.num_pages
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Context;
    use crate::disk::DiskManager;
    use crate::lock_manager::LockManager;
    use crate::transaction::Transaction;
    use tempfile::tempdir;

    fn setup(record_size: usize) -> (tempfile::TempDir, HeapFile, LockManager) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::open(dir.path()).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(disk));
        let heap = HeapFile::create(bpm, "t.tab", record_size).unwrap();
        (dir, heap, LockManager::new())
    }

    fn record(fill: u8, len: usize) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn bitmap_finds_bits() {
        let mut map = [0u8; 2];
        assert_eq!(bitmap::first_bit(false, &map, 16), 0);
        bitmap::set(&mut map, 0);
        bitmap::set(&mut map, 1);
        bitmap::set(&mut map, 9);
        assert_eq!(bitmap::first_bit(false, &map, 16), 2);
        assert_eq!(bitmap::first_bit(true, &map, 16), 0);
        assert_eq!(bitmap::next_bit(true, &map, 16, 2), 9);
        bitmap::reset(&mut map, 9);
        assert_eq!(bitmap::next_bit(true, &map, 16, 2), 16);
    }

    #[test]
    fn insert_then_get_round_trips() {
        let (_dir, heap, lm) = setup(16);
        let txn = Transaction::new(1, 1);
        let ctx = Context {
            lock_mgr: &lm,
            txn: &txn,
        };

        let rid = heap.insert(&record(7, 16), &ctx).unwrap();
        assert_eq!(rid, Rid::new(1, 0));
        assert_eq!(heap.get(rid, &ctx).unwrap(), record(7, 16));

        heap.update(rid, &record(9, 16), &ctx).unwrap();
        assert_eq!(heap.get(rid, &ctx).unwrap(), record(9, 16));

        heap.delete(rid, &ctx).unwrap();
        let scan = heap.scan().unwrap();
        assert!(scan.is_end());
    }

    #[test]
    fn slots_fill_lowest_first() {
        let (_dir, heap, lm) = setup(16);
        let txn = Transaction::new(1, 1);
        let ctx = Context {
            lock_mgr: &lm,
            txn: &txn,
        };

        let a = heap.insert(&record(1, 16), &ctx).unwrap();
        let b = heap.insert(&record(2, 16), &ctx).unwrap();
        let c = heap.insert(&record(3, 16), &ctx).unwrap();
        assert_eq!((a.slot_no, b.slot_no, c.slot_no), (0, 1, 2));

        heap.delete(b, &ctx).unwrap();
        let again = heap.insert(&record(4, 16), &ctx).unwrap();
        assert_eq!(again, b);
    }

    #[test]
    fn free_list_tracks_full_pages() {
        let (_dir, heap, lm) = setup(16);
        let txn = Transaction::new(1, 1);
        let ctx = Context {
            lock_mgr: &lm,
            txn: &txn,
        };
        let per_page = heap.records_per_page();

        // Fill page 1 completely; the file then has no free page.
        let mut first = None;
        for i in 0..per_page {
            let rid = heap.insert(&record(i as u8, 16), &ctx).unwrap();
            first.get_or_insert(rid);
        }
        assert_eq!(heap.first_free_page(), INVALID_PAGE_NO);

        // Deleting one record re-links page 1 at the head of the free-list.
        heap.delete(first.unwrap(), &ctx).unwrap();
        assert_eq!(heap.first_free_page(), 1);

        // The next insert lands back in slot 0 of page 1.
        let rid = heap.insert(&record(0xee, 16), &ctx).unwrap();
        assert_eq!(rid, Rid::new(1, 0));
        assert_eq!(heap.first_free_page(), INVALID_PAGE_NO);
    }

    #[test]
    fn full_page_spills_to_a_new_page() {
        let (_dir, heap, lm) = setup(16);
        let txn = Transaction::new(1, 1);
        let ctx = Context {
            lock_mgr: &lm,
            txn: &txn,
        };
        let per_page = heap.records_per_page();
        for i in 0..per_page + 1 {
            heap.insert(&record(i as u8, 16), &ctx).unwrap();
        }
        assert_eq!(heap.num_pages(), 3);
        assert_eq!(heap.first_free_page(), 2);
    }

    #[test]
    fn scan_walks_live_slots_across_pages() {
        let (_dir, heap, lm) = setup(16);
        let txn = Transaction::new(1, 1);
        let ctx = Context {
            lock_mgr: &lm,
            txn: &txn,
        };
        let per_page = heap.records_per_page();
        let mut rids = Vec::new();
        for i in 0..per_page + 3 {
            rids.push(heap.insert(&record(i as u8, 16), &ctx).unwrap());
        }
        heap.delete(rids[1], &ctx).unwrap();
        heap.delete(rids[per_page], &ctx).unwrap();

        let mut seen = Vec::new();
        let mut scan = heap.scan().unwrap();
        while !scan.is_end() {
            seen.push(scan.rid());
            scan.next().unwrap();
        }
        let expected: Vec<Rid> = rids
            .iter()
            .copied()
            .filter(|r| *r != rids[1] && *r != rids[per_page])
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn insert_at_restores_a_deleted_slot() {
        let (_dir, heap, lm) = setup(16);
        let txn = Transaction::new(1, 1);
        let ctx = Context {
            lock_mgr: &lm,
            txn: &txn,
        };
        let rid = heap.insert(&record(5, 16), &ctx).unwrap();
        heap.delete(rid, &ctx).unwrap();

        heap.insert_at(rid, &record(5, 16)).unwrap();
        assert_eq!(heap.get_for_undo(rid).unwrap(), record(5, 16));

        let mut scan = heap.scan().unwrap();
        assert_eq!(scan.rid(), rid);
        scan.next().unwrap();
        assert!(scan.is_end());
    }

    #[test]
    fn invalid_rid_is_page_not_exist() {
        let (_dir, heap, _lm) = setup(16);
        assert!(matches!(
            heap.get_for_undo(Rid::new(9, 0)),
            Err(DbError::PageNotExist { .. })
        ));
        assert!(matches!(
            heap.get_for_undo(Rid::new(0, 0)),
            Err(DbError::PageNotExist { .. })
        ));
    }
}
