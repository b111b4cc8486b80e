//! Manages the buffer pool, a collection of in-memory frames that cache
//! disk pages. Pages stay pinned while a `PageGuard` is alive.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::disk::{DiskManager, FileId};
use crate::errors::{DbError, Result};
use crate::{PageNo, PAGE_SIZE};

const BUFFER_POOL_SIZE: usize = 256;

/// A unique identifier for a page: the file it belongs to plus its page
/// number within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub file_id: FileId,
    pub page_no: PageNo,
}

impl PageId {
    pub fn new(file_id: FileId, page_no: PageNo) -> Self {
        PageId { file_id, page_no }
    }
}

/// One page worth of bytes, tagged with its identity.
#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Page {
            id,
            data: [0; PAGE_SIZE],
        }
    }
}

/// A single frame in the buffer pool.
struct Frame {
    page: RwLock<Page>,
    is_dirty: Mutex<bool>,
    pin_count: Mutex<u32>,
    recently_used: Mutex<bool>,
}

/// The buffer pool manager.
pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    frames: Vec<Arc<Frame>>,
    page_table: RwLock<HashMap<PageId, usize>>,
    free_list: Mutex<Vec<usize>>,
    clock_hand: Mutex<usize>,
}

/// An RAII guard for a pinned page; unpins on drop.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    frame: Arc<Frame>,
}

impl<'a> PageGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        *self.frame.is_dirty.lock() = true;
        self.frame.page.write()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.bpm.unpin_page(self.page_id);
    }
}

impl BufferPoolManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self::with_capacity(disk, BUFFER_POOL_SIZE)
    }

    pub fn with_capacity(disk: Arc<DiskManager>, capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        let mut free_list = Vec::with_capacity(capacity);
        for i in 0..capacity {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new(PageId::new(0, -1))),
                is_dirty: Mutex::new(false),
                pin_count: Mutex::new(0),
                recently_used: Mutex::new(false),
            }));
            free_list.push(i);
        }
        Self {
            disk,
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            clock_hand: Mutex::new(0),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Pins the page, pulling it from disk if it is not resident.
    pub fn acquire_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        // 1. Check if the page is already in the buffer pool.
        if let Some(&frame_index) = self.page_table.read().get(&page_id) {
            let frame = self.frames[frame_index].clone();
            self.pin_frame(&frame);
            return Ok(PageGuard {
                bpm: self,
                page_id,
                frame,
            });
        }

        // 2. If not, find a free frame or evict one.
        let frame_index = self.find_victim_frame().ok_or(DbError::BufferPoolFull)?;
        let frame = self.frames[frame_index].clone();

        // 3. Write back the evicted page if the frame is dirty.
        self.evict_frame(frame_index)?;

        // 4. Read the new page from disk.
        let mut new_page = Page::new(page_id);
        self.disk
            .read_page(page_id.file_id, page_id.page_no, &mut new_page.data)?;

        // 5. Update frame content and metadata.
        {
            let mut page = frame.page.write();
            *page = new_page;
            *frame.is_dirty.lock() = false;
            self.pin_frame(&frame);
        }

        // 6. Update the page table.
        self.page_table.write().insert(page_id, frame_index);
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame,
        })
    }

    /// Allocates a fresh page in the file and pins it, zero-filled.
    pub fn new_page(&self, file_id: FileId) -> Result<PageGuard<'_>> {
        let frame_index = self.find_victim_frame().ok_or(DbError::BufferPoolFull)?;
        let frame = self.frames[frame_index].clone();

        self.evict_frame(frame_index)?;

        let page_no = self.disk.allocate_page(file_id)?;
        let page_id = PageId::new(file_id, page_no);

        {
            let mut page = frame.page.write();
            *page = Page::new(page_id);
            *frame.is_dirty.lock() = true;
            self.pin_frame(&frame);
        }

        self.page_table.write().insert(page_id, frame_index);
        Ok(PageGuard {
            bpm: self,
            page_id,
            frame,
        })
    }

    fn pin_frame(&self, frame: &Arc<Frame>) {
        let mut pin_count = frame.pin_count.lock();
        *pin_count += 1;
        *frame.recently_used.lock() = true;
    }

    /// Removes whatever page currently occupies the frame, writing it back
    /// first if dirty.
    fn evict_frame(&self, frame_index: usize) -> Result<()> {
        let frame = &self.frames[frame_index];
        let old_page_id = {
            let page_table = self.page_table.read();
            page_table
                .iter()
                .find(|&(_, &idx)| idx == frame_index)
                .map(|(&id, _)| id)
        };
        let Some(old_page_id) = old_page_id else {
            return Ok(());
        };

        let mut is_dirty = frame.is_dirty.lock();
        if *is_dirty {
            let page_to_write = frame.page.read().clone();
            self.disk.write_page(
                old_page_id.file_id,
                old_page_id.page_no,
                &page_to_write.data,
            )?;
            *is_dirty = false;
        }
        self.page_table.write().remove(&old_page_id);
        Ok(())
    }

    fn unpin_page(&self, page_id: PageId) {
        if let Some(&frame_index) = self.page_table.read().get(&page_id) {
            let frame = &self.frames[frame_index];
            let mut pin_count = frame.pin_count.lock();
            if *pin_count > 0 {
                *pin_count -= 1;
            }
        }
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        if let Some(&frame_index) = self.page_table.read().get(&page_id) {
            let frame = &self.frames[frame_index];
            let mut is_dirty = frame.is_dirty.lock();
            if *is_dirty {
                let page = frame.page.read();
                self.disk
                    .write_page(page_id.file_id, page_id.page_no, &page.data)?;
                *is_dirty = false;
            }
        }
        Ok(())
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        let page_ids: Vec<PageId> = self.page_table.read().keys().copied().collect();
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drops the page from the pool without writing it back. The page
    /// number is not reused; only the frame is recycled.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        if let Some(frame_index) = self.page_table.write().remove(&page_id) {
            let frame = &self.frames[frame_index];
            *frame.is_dirty.lock() = false;
            *frame.pin_count.lock() = 0;
            *frame.recently_used.lock() = false;
            self.free_list.lock().push(frame_index);
        }
        Ok(())
    }

    fn find_victim_frame(&self) -> Option<usize> {
        if let Some(frame_index) = self.free_list.lock().pop() {
            return Some(frame_index);
        }

        let frame_count = self.frames.len();
        if frame_count == 0 {
            return None;
        }

        let mut clock_hand = self.clock_hand.lock();
        // Two full passes: the first can clear second-chance bits, the
        // second can pick a victim.
        for _ in 0..(frame_count * 2) {
            let frame_index = *clock_hand;
            *clock_hand = (*clock_hand + 1) % frame_count;

            let frame = &self.frames[frame_index];
            let pin_count = frame.pin_count.lock();

            if *pin_count == 0 {
                let mut recently_used = frame.recently_used.lock();
                if *recently_used {
                    *recently_used = false;
                } else {
                    return Some(frame_index);
                }
            }
        }

        // All frames are pinned.
        None
    }
}
