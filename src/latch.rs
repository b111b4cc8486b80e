//! Short-term page latches and the per-file latch map used by the B+-tree
//! crabbing protocol. Latches guard physical page access; they are released
//! at the latest when the page is unpinned, unlike logical locks which live
//! until transaction termination.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

use crate::PageNo;

/// A reader/writer latch on one page. Lock and unlock are explicit because
/// the crabbing protocol releases latches far from where they were taken;
/// every lock must be paired with exactly one unlock on the same latch.
pub struct PageLatch {
    raw: RawRwLock,
}

impl PageLatch {
    fn new() -> Self {
        PageLatch {
            raw: RawRwLock::INIT,
        }
    }

    pub fn read_lock(&self) {
        self.raw.lock_shared();
    }

    pub fn read_unlock(&self) {
        // Caller holds a shared lock on this latch.
        unsafe { self.raw.unlock_shared() }
    }

    pub fn write_lock(&self) {
        self.raw.lock_exclusive();
    }

    pub fn try_write_lock(&self) -> bool {
        self.raw.try_lock_exclusive()
    }

    pub fn write_unlock(&self) {
        // Caller holds the exclusive lock on this latch.
        unsafe { self.raw.unlock_exclusive() }
    }
}

/// Scoped shared latch; unlocks on drop.
pub struct ReadLatchGuard {
    latch: Arc<PageLatch>,
}

impl ReadLatchGuard {
    pub fn lock(latch: Arc<PageLatch>) -> Self {
        latch.read_lock();
        ReadLatchGuard { latch }
    }
}

impl Drop for ReadLatchGuard {
    fn drop(&mut self) {
        self.latch.read_unlock();
    }
}

/// Scoped exclusive latch; unlocks on drop. Used for latches whose lifetime
/// stays within one call tree (split targets, siblings, fresh roots) as
/// opposed to the transaction-tracked ancestor set.
pub struct WriteLatchGuard {
    latch: Arc<PageLatch>,
}

impl WriteLatchGuard {
    pub fn lock(latch: Arc<PageLatch>) -> Self {
        latch.write_lock();
        WriteLatchGuard { latch }
    }
}

impl Drop for WriteLatchGuard {
    fn drop(&mut self) {
        self.latch.write_unlock();
    }
}

/// Page-number → latch map. Populated on first access and never pruned for
/// the lifetime of the owning file handle.
pub struct LatchMap {
    latches: Mutex<HashMap<PageNo, Arc<PageLatch>>>,
}

impl LatchMap {
    pub fn new() -> Self {
        LatchMap {
            latches: Mutex::new(HashMap::new()),
        }
    }

    pub fn latch(&self, page_no: PageNo) -> Arc<PageLatch> {
        self.latches
            .lock()
            .entry(page_no)
            .or_insert_with(|| Arc::new(PageLatch::new()))
            .clone()
    }
}

impl Default for LatchMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn same_page_returns_same_latch() {
        let map = LatchMap::new();
        let a = map.latch(3);
        let b = map.latch(3);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &map.latch(4)));
    }

    #[test]
    fn writer_excludes_writer() {
        let map = LatchMap::new();
        let latch = map.latch(1);
        latch.write_lock();
        assert!(!latch.try_write_lock());
        latch.write_unlock();
        assert!(latch.try_write_lock());
        latch.write_unlock();
    }

    #[test]
    fn readers_share_but_block_writers() {
        let map = LatchMap::new();
        let latch = map.latch(1);
        let _r1 = ReadLatchGuard::lock(latch.clone());
        let _r2 = ReadLatchGuard::lock(latch.clone());
        assert!(!latch.try_write_lock());
    }

    #[test]
    fn guard_releases_across_threads() {
        let map = Arc::new(LatchMap::new());
        let latch = map.latch(9);
        {
            let _g = WriteLatchGuard::lock(latch.clone());
        }
        let handle = {
            let map = map.clone();
            thread::spawn(move || {
                let latch = map.latch(9);
                let _g = WriteLatchGuard::lock(latch);
            })
        };
        handle.join().unwrap();
        assert!(latch.try_write_lock());
        latch.write_unlock();
    }
}
