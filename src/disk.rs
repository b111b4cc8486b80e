//! Disk manager: page-granular I/O over the files of one database
//! directory. Each open file gets a `FileId`; pages are read and written at
//! `page_no * PAGE_SIZE` offsets.

use std::collections::HashMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::errors::{DbError, Result};
use crate::{PageNo, PAGE_SIZE};

/// A unique identifier for an open file.
pub type FileId = u32;

struct FileEntry {
    file: Mutex<File>,
    num_pages: AtomicI32,
}

pub struct DiskManager {
    dir: PathBuf,
    files: RwLock<HashMap<FileId, Arc<FileEntry>>>,
    next_file_id: AtomicU32,
}

impl DiskManager {
    /// Opens (creating if needed) a database directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir)?;
        crate::plinth_debug_log!("[DiskManager::open] Database directory: {dir:?}");
        Ok(DiskManager {
            dir,
            files: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(0),
        })
    }

    /// Opens a file inside the database directory and returns its id.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as i32;

        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        crate::plinth_debug_log!(
            "[DiskManager::open_file] {name} -> file_id {file_id}, {num_pages} pages"
        );
        self.files.write().insert(
            file_id,
            Arc::new(FileEntry {
                file: Mutex::new(file),
                num_pages: AtomicI32::new(num_pages),
            }),
        );
        Ok(file_id)
    }

    fn entry(&self, file_id: FileId) -> Result<Arc<FileEntry>> {
        self.files.read().get(&file_id).cloned().ok_or_else(|| {
            DbError::CorruptHeader(format!("file {file_id} is not open"))
        })
    }

    /// Reads one page into `buf`. A page past the end of the file reads as
    /// zeroes; the caller is responsible for page-number validity.
    pub fn read_page(&self, file_id: FileId, page_no: PageNo, buf: &mut [u8]) -> Result<()> {
        if page_no < 0 {
            return Err(DbError::PageNotExist { file_id, page_no });
        }
        let entry = self.entry(file_id)?;
        if page_no >= entry.num_pages.load(Ordering::SeqCst) {
            buf.fill(0);
            return Ok(());
        }
        let mut file = entry.file.lock();
        file.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        let n = file.read(buf)?;
        buf[n..].fill(0);
        Ok(())
    }

    pub fn write_page(&self, file_id: FileId, page_no: PageNo, buf: &[u8]) -> Result<()> {
        if page_no < 0 {
            return Err(DbError::PageNotExist { file_id, page_no });
        }
        let entry = self.entry(file_id)?;
        let mut file = entry.file.lock();
        file.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))?;
        file.write_all(buf)?;
        entry.num_pages.fetch_max(page_no + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Hands out the next page number of the file.
    pub fn allocate_page(&self, file_id: FileId) -> Result<PageNo> {
        let entry = self.entry(file_id)?;
        let page_no = entry.num_pages.fetch_add(1, Ordering::SeqCst);
        crate::plinth_debug_log!(
            "[DiskManager::allocate_page] file {file_id} -> page {page_no}"
        );
        Ok(page_no)
    }

    pub fn num_pages(&self, file_id: FileId) -> Result<PageNo> {
        Ok(self.entry(file_id)?.num_pages.load(Ordering::SeqCst))
    }

    /// Flushes file contents to stable storage.
    pub fn sync_file(&self, file_id: FileId) -> Result<()> {
        let entry = self.entry(file_id)?;
        let file = entry.file.lock();
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pages_round_trip_through_disk() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(dir.path()).unwrap();
        let fd = disk.open_file("t.tab").unwrap();

        let page_no = disk.allocate_page(fd).unwrap();
        assert_eq!(page_no, 0);

        let mut out = vec![0u8; PAGE_SIZE];
        out[0] = 0xab;
        out[PAGE_SIZE - 1] = 0xcd;
        disk.write_page(fd, page_no, &out).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, page_no, &mut buf).unwrap();
        assert_eq!(buf, out);
    }

    #[test]
    fn unwritten_page_reads_as_zeroes() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(dir.path()).unwrap();
        let fd = disk.open_file("t.tab").unwrap();
        let page_no = disk.allocate_page(fd).unwrap();

        let mut buf = vec![0xffu8; PAGE_SIZE];
        disk.read_page(fd, page_no, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn negative_page_is_rejected() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::open(dir.path()).unwrap();
        let fd = disk.open_file("t.tab").unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            disk.read_page(fd, -1, &mut buf),
            Err(DbError::PageNotExist { .. })
        ));
    }

    #[test]
    fn reopened_file_remembers_page_count() {
        let dir = tempdir().unwrap();
        {
            let disk = DiskManager::open(dir.path()).unwrap();
            let fd = disk.open_file("t.tab").unwrap();
            for _ in 0..3 {
                let p = disk.allocate_page(fd).unwrap();
                disk.write_page(fd, p, &vec![1u8; PAGE_SIZE]).unwrap();
            }
        }
        let disk = DiskManager::open(dir.path()).unwrap();
        let fd = disk.open_file("t.tab").unwrap();
        assert_eq!(disk.num_pages(fd).unwrap(), 3);
    }
}
