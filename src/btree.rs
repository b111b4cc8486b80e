//! B+-tree index over variable-width composite keys. Traversals use latch
//! crabbing: a child is latched before its parent is released, and all
//! retained ancestor latches are dropped as soon as the child is known to
//! be safe for the operation in flight. Leaves form a doubly-linked ring
//! anchored by a sentinel header page.

use std::mem::size_of;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::buffer_pool::{BufferPoolManager, Page, PageGuard, PageId};
use crate::catalog::IndexMeta;
use crate::disk::FileId;
use crate::errors::{DbError, Result};
use crate::latch::{LatchMap, ReadLatchGuard, WriteLatchGuard};
use crate::transaction::Transaction;
use crate::types::{ix_compare, ColType};
use crate::{PageNo, Rid, INVALID_PAGE_NO, PAGE_SIZE};

const IX_FILE_HDR_PAGE: PageNo = 0;
const IX_LEAF_HDR_PAGE: PageNo = 1;

/// Serialized into page 0 of the index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IxFileHdr {
    root_page: PageNo,
    first_leaf: PageNo,
    last_leaf: PageNo,
    num_pages: PageNo,
    btree_order: u32,
    col_types: Vec<ColType>,
    col_lens: Vec<u32>,
    col_tot_len: u32,
}

/// Header of every node page. For internal nodes the rid array holds child
/// page numbers in `page_no`; for leaves it holds tuple rids.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct IxPageHdr {
    parent: PageNo,
    is_leaf: u8,
    num_key: u32,
    next_leaf: PageNo,
    prev_leaf: PageNo,
}

const IX_PAGE_HDR_SIZE: usize = size_of::<IxPageHdr>();

/// Immutable shape of the index: key layout and node fan-out.
pub struct IxMeta {
    pub col_types: Vec<ColType>,
    pub col_lens: Vec<usize>,
    pub col_tot_len: usize,
    /// Maximum number of (key, rid) pairs a node can hold; a node that
    /// reaches `order` keys splits.
    pub order: usize,
    pub min_size: usize,
}

/// Mutable tree geometry, shared across traversals.
struct IxState {
    root_page: PageNo,
    first_leaf: PageNo,
    last_leaf: PageNo,
    num_pages: PageNo,
}

fn read_node_hdr(page: &Page) -> IxPageHdr {
    unsafe { std::ptr::read_unaligned(page.data.as_ptr() as *const IxPageHdr) }
}

fn write_node_hdr(page: &mut Page, hdr: &IxPageHdr) {
    unsafe {
        std::ptr::write_unaligned(page.data.as_mut_ptr() as *mut IxPageHdr, *hdr);
    }
}

fn key_off(meta: &IxMeta, i: usize) -> usize {
    IX_PAGE_HDR_SIZE + i * meta.col_tot_len
}

fn rid_off(meta: &IxMeta, i: usize) -> usize {
    IX_PAGE_HDR_SIZE + meta.order * meta.col_tot_len + i * Rid::SIZE
}

fn key_slice<'a>(meta: &IxMeta, page: &'a Page, i: usize) -> &'a [u8] {
    let off = key_off(meta, i);
    &page.data[off..off + meta.col_tot_len]
}

fn set_key_at(meta: &IxMeta, page: &mut Page, i: usize, key: &[u8]) {
    let off = key_off(meta, i);
    page.data[off..off + meta.col_tot_len].copy_from_slice(key);
}

fn rid_at(meta: &IxMeta, page: &Page, i: usize) -> Rid {
    let off = rid_off(meta, i);
    Rid::from_bytes(&page.data[off..off + Rid::SIZE])
}

fn set_rid_at(meta: &IxMeta, page: &mut Page, i: usize, rid: Rid) {
    let off = rid_off(meta, i);
    page.data[off..off + Rid::SIZE].copy_from_slice(&rid.to_bytes());
}

/// First slot whose key is >= target, in [0, num_key].
fn lower_bound(meta: &IxMeta, page: &Page, target: &[u8]) -> usize {
    let (mut l, mut r) = (0usize, read_node_hdr(page).num_key as usize);
    while l < r {
        let mid = (l + r) / 2;
        let ord = ix_compare(
            key_slice(meta, page, mid),
            target,
            &meta.col_types,
            &meta.col_lens,
        );
        if ord != std::cmp::Ordering::Less {
            r = mid;
        } else {
            l = mid + 1;
        }
    }
    r
}

/// First slot whose key is > target, in [0, num_key].
fn upper_bound(meta: &IxMeta, page: &Page, target: &[u8]) -> usize {
    let (mut l, mut r) = (0usize, read_node_hdr(page).num_key as usize);
    while l < r {
        let mid = (l + r) / 2;
        let ord = ix_compare(
            key_slice(meta, page, mid),
            target,
            &meta.col_types,
            &meta.col_lens,
        );
        if ord == std::cmp::Ordering::Greater {
            r = mid;
        } else {
            l = mid + 1;
        }
    }
    r
}

fn keys_equal(meta: &IxMeta, a: &[u8], b: &[u8]) -> bool {
    ix_compare(a, b, &meta.col_types, &meta.col_lens) == std::cmp::Ordering::Equal
}

fn leaf_lookup(meta: &IxMeta, page: &Page, key: &[u8]) -> Option<Rid> {
    let idx = lower_bound(meta, page, key);
    if idx != read_node_hdr(page).num_key as usize && keys_equal(meta, key, key_slice(meta, page, idx))
    {
        return Some(rid_at(meta, page, idx));
    }
    None
}

/// Which child subtree covers the key: the child followed is the one just
/// below `upper_bound`, clamped to the leftmost.
fn internal_lookup(meta: &IxMeta, page: &Page, key: &[u8]) -> (PageNo, usize) {
    let idx = upper_bound(meta, page, key);
    let pos = if idx > 0 { idx - 1 } else { idx };
    (rid_at(meta, page, pos).page_no, idx)
}

/// Inserts `rids.len()` consecutive pairs at `pos`, shifting the tail
/// right. No-op when the node cannot hold them or `pos` is out of range.
fn insert_pairs(meta: &IxMeta, page: &mut Page, pos: usize, keys: &[u8], rids: &[Rid]) {
    let n = rids.len();
    let num_key = read_node_hdr(page).num_key as usize;
    if pos > num_key || num_key + n > meta.order {
        return;
    }

    let key_len = meta.col_tot_len;
    page.data
        .copy_within(key_off(meta, pos)..key_off(meta, num_key), key_off(meta, pos + n));
    page.data
        .copy_within(rid_off(meta, pos)..rid_off(meta, num_key), rid_off(meta, pos + n));

    page.data[key_off(meta, pos)..key_off(meta, pos) + n * key_len].copy_from_slice(keys);
    for (i, rid) in rids.iter().enumerate() {
        set_rid_at(meta, page, pos + i, *rid);
    }

    let mut hdr = read_node_hdr(page);
    hdr.num_key += n as u32;
    write_node_hdr(page, &hdr);
}

/// Single-pair insert with silent duplicate rejection. Returns the key
/// count after the operation and the slot of the (new or existing) key.
fn node_insert(meta: &IxMeta, page: &mut Page, key: &[u8], rid: Rid) -> (usize, usize) {
    let num_key = read_node_hdr(page).num_key as usize;
    let idx = lower_bound(meta, page, key);
    if num_key == 0 || idx == num_key || !keys_equal(meta, key_slice(meta, page, idx), key) {
        insert_pairs(meta, page, idx, key, &[rid]);
    }
    (read_node_hdr(page).num_key as usize, idx)
}

fn erase_pair(meta: &IxMeta, page: &mut Page, pos: usize) {
    let num_key = read_node_hdr(page).num_key as usize;
    page.data
        .copy_within(key_off(meta, pos + 1)..key_off(meta, num_key), key_off(meta, pos));
    page.data
        .copy_within(rid_off(meta, pos + 1)..rid_off(meta, num_key), rid_off(meta, pos));
    let mut hdr = read_node_hdr(page);
    hdr.num_key -= 1;
    write_node_hdr(page, &hdr);
}

/// Single-key removal. Returns the key count after the operation and the
/// slot the key occupied (or would occupy).
fn node_remove(meta: &IxMeta, page: &mut Page, key: &[u8]) -> (usize, usize) {
    let num_key = read_node_hdr(page).num_key as usize;
    let idx = lower_bound(meta, page, key);
    if idx != num_key && keys_equal(meta, key, key_slice(meta, page, idx)) {
        erase_pair(meta, page, idx);
    }
    (read_node_hdr(page).num_key as usize, idx)
}

/// Rank of a child page within an internal node.
fn find_child(meta: &IxMeta, page: &Page, child: PageNo) -> usize {
    let num_key = read_node_hdr(page).num_key as usize;
    (0..num_key)
        .find(|&i| rid_at(meta, page, i).page_no == child)
        .unwrap_or(0)
}

/// Per-traversal operation tag; selects the crabbing safety rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Insert,
    Delete,
}

/// Position of one index slot: a leaf page and a slot within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot_no: usize,
}

/// Handle to one B+-tree index file.
pub struct BPlusTree {
    file_id: FileId,
    bpm: Arc<BufferPoolManager>,
    meta: IxMeta,
    state: RwLock<IxState>,
    latches: LatchMap,
}

/// Releases whatever ancestor latches a traversal still holds, on every
/// control-flow exit.
struct TraversalGuard<'a> {
    tree: &'a BPlusTree,
    txn: &'a Transaction,
}

impl<'a> Drop for TraversalGuard<'a> {
    fn drop(&mut self) {
        self.tree.unlock_ancestors(self.txn);
    }
}

impl BPlusTree {
    /// Creates a fresh index file: page 0 holds the serialized header,
    /// page 1 the leaf-ring sentinel, page 2 the initial (empty) root leaf.
    pub fn create(
        bpm: Arc<BufferPoolManager>,
        name: &str,
        index_meta: &IndexMeta,
        order: Option<usize>,
    ) -> Result<BPlusTree> {
        let col_tot_len = index_meta.col_tot_len;
        let max_fit = (PAGE_SIZE - IX_PAGE_HDR_SIZE) / (col_tot_len + Rid::SIZE);
        let order = order.unwrap_or(max_fit);
        if !(4..=max_fit).contains(&order) {
            return Err(DbError::CorruptHeader(format!(
                "b-tree order {order} out of range [4, {max_fit}] for {col_tot_len}-byte keys"
            )));
        }

        let file_id = bpm.disk().open_file(name)?;
        let tree = BPlusTree {
            file_id,
            bpm,
            meta: IxMeta {
                col_types: index_meta.col_types(),
                col_lens: index_meta.col_lens(),
                col_tot_len,
                order,
                min_size: order / 2,
            },
            state: RwLock::new(IxState {
                root_page: 2,
                first_leaf: 2,
                last_leaf: 2,
                num_pages: 3,
            }),
            latches: LatchMap::new(),
        };

        {
            let guard = tree.bpm.new_page(file_id)?;
            debug_assert_eq!(guard.page_id().page_no, IX_FILE_HDR_PAGE);
        }
        {
            let guard = tree.bpm.new_page(file_id)?;
            debug_assert_eq!(guard.page_id().page_no, IX_LEAF_HDR_PAGE);
            let mut page = guard.write();
            write_node_hdr(
                &mut page,
                &IxPageHdr {
                    parent: INVALID_PAGE_NO,
                    is_leaf: 1,
                    num_key: 0,
                    next_leaf: 2,
                    prev_leaf: 2,
                },
            );
        }
        {
            let guard = tree.bpm.new_page(file_id)?;
            debug_assert_eq!(guard.page_id().page_no, 2);
            let mut page = guard.write();
            write_node_hdr(
                &mut page,
                &IxPageHdr {
                    parent: INVALID_PAGE_NO,
                    is_leaf: 1,
                    num_key: 0,
                    next_leaf: IX_LEAF_HDR_PAGE,
                    prev_leaf: IX_LEAF_HDR_PAGE,
                },
            );
        }
        tree.flush_hdr()?;
        Ok(tree)
    }

    /// Opens an existing index file from its serialized header.
    pub fn open(bpm: Arc<BufferPoolManager>, name: &str) -> Result<BPlusTree> {
        let file_id = bpm.disk().open_file(name)?;
        if bpm.disk().num_pages(file_id)? == 0 {
            return Err(DbError::CorruptHeader(format!(
                "index file {name} has no header page"
            )));
        }
        let hdr: IxFileHdr = {
            let guard = bpm.acquire_page(PageId::new(file_id, IX_FILE_HDR_PAGE))?;
            let page = guard.read();
            let len = u32::from_le_bytes([page.data[0], page.data[1], page.data[2], page.data[3]])
                as usize;
            if len == 0 || len > PAGE_SIZE - 4 {
                return Err(DbError::CorruptHeader(format!(
                    "index file {name} header length {len}"
                )));
            }
            bincode::deserialize(&page.data[4..4 + len])
                .map_err(|e| DbError::CorruptHeader(e.to_string()))?
        };
        Ok(BPlusTree {
            file_id,
            bpm,
            meta: IxMeta {
                col_types: hdr.col_types.clone(),
                col_lens: hdr.col_lens.iter().map(|&l| l as usize).collect(),
                col_tot_len: hdr.col_tot_len as usize,
                order: hdr.btree_order as usize,
                min_size: hdr.btree_order as usize / 2,
            },
            state: RwLock::new(IxState {
                root_page: hdr.root_page,
                first_leaf: hdr.first_leaf,
                last_leaf: hdr.last_leaf,
                num_pages: hdr.num_pages,
            }),
            latches: LatchMap::new(),
        })
    }

    /// Serializes the file header back into page 0.
    pub fn flush_hdr(&self) -> Result<()> {
        let hdr = {
            let state = self.state.read();
            IxFileHdr {
                root_page: state.root_page,
                first_leaf: state.first_leaf,
                last_leaf: state.last_leaf,
                num_pages: state.num_pages,
                btree_order: self.meta.order as u32,
                col_types: self.meta.col_types.clone(),
                col_lens: self.meta.col_lens.iter().map(|&l| l as u32).collect(),
                col_tot_len: self.meta.col_tot_len as u32,
            }
        };
        let bytes = bincode::serialize(&hdr).map_err(|e| DbError::CorruptHeader(e.to_string()))?;
        let guard = self
            .bpm
            .acquire_page(PageId::new(self.file_id, IX_FILE_HDR_PAGE))?;
        let mut page = guard.write();
        page.data[0..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        page.data[4..4 + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn meta(&self) -> &IxMeta {
        &self.meta
    }

    pub fn num_pages(&self) -> PageNo {
        self.state.read().num_pages
    }

    fn page(&self, page_no: PageNo) -> Result<PageGuard<'_>> {
        if page_no < 0 {
            return Err(DbError::PageNotExist {
                file_id: self.file_id,
                page_no,
            });
        }
        self.bpm.acquire_page(PageId::new(self.file_id, page_no))
    }

    fn node_hdr(&self, page_no: PageNo) -> Result<IxPageHdr> {
        let guard = self.page(page_no)?;
        let page = guard.read();
        Ok(read_node_hdr(&page))
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.meta.col_tot_len {
            return Err(DbError::IncompatibleType {
                expected: format!("{}-byte key", self.meta.col_tot_len),
                found: format!("{}-byte key", key.len()),
            });
        }
        Ok(())
    }

    fn create_node(&self) -> Result<PageNo> {
        let guard = self.bpm.new_page(self.file_id)?;
        let page_no = guard.page_id().page_no;
        let mut page = guard.write();
        write_node_hdr(
            &mut page,
            &IxPageHdr {
                parent: INVALID_PAGE_NO,
                is_leaf: 0,
                num_key: 0,
                next_leaf: INVALID_PAGE_NO,
                prev_leaf: INVALID_PAGE_NO,
            },
        );
        drop(page);
        self.state.write().num_pages += 1;
        Ok(page_no)
    }

    /// Read-crabbing descent. Returns the leaf page with its read latch
    /// still held by the returned guard.
    fn find_leaf_read(&self, key: &[u8]) -> Result<(PageNo, ReadLatchGuard)> {
        let mut current = self.state.read().root_page;
        let mut held = ReadLatchGuard::lock(self.latches.latch(current));
        // The root may move between the unlatched load and the latch grab.
        loop {
            let root_now = self.state.read().root_page;
            if current == root_now {
                break;
            }
            current = root_now;
            held = ReadLatchGuard::lock(self.latches.latch(current));
        }
        loop {
            let (is_leaf, child) = {
                let guard = self.page(current)?;
                let page = guard.read();
                let hdr = read_node_hdr(&page);
                if hdr.is_leaf != 0 {
                    (true, 0)
                } else {
                    (false, internal_lookup(&self.meta, &page, key).0)
                }
            };
            if is_leaf {
                return Ok((current, held));
            }
            let next = ReadLatchGuard::lock(self.latches.latch(child));
            held = next;
            current = child;
        }
    }

    /// Whether a freshly latched child lets its ancestors go: it will
    /// neither split (insert) nor underflow (delete).
    fn node_is_safe(&self, page_no: PageNo, op: Operation) -> Result<bool> {
        let hdr = self.node_hdr(page_no)?;
        let num_key = hdr.num_key as usize;
        Ok(match op {
            Operation::Insert => num_key < self.meta.order - 1,
            Operation::Delete => {
                num_key > self.meta.min_size
                    || (hdr.parent == INVALID_PAGE_NO && num_key > 2)
            }
        })
    }

    /// Write-crabbing descent. Every latched page is appended to the
    /// transaction's held-latch set, root first; ancestors are released as
    /// soon as the child is safe and is not its parent's leftmost entry
    /// (slot 0 would still be rewritten by `maintain_parent`).
    fn find_leaf_write(&self, key: &[u8], op: Operation, txn: &Transaction) -> Result<PageNo> {
        'restart: loop {
            let mut current = self.state.read().root_page;
            let latch = self.latches.latch(current);
            latch.write_lock();
            txn.push_latch_page(current);
            if current != self.state.read().root_page {
                self.unlock_ancestors(txn);
                continue 'restart;
            }
            loop {
                let (is_leaf, child, idx) = {
                    let guard = self.page(current)?;
                    let page = guard.read();
                    let hdr = read_node_hdr(&page);
                    if hdr.is_leaf != 0 {
                        (true, 0, 0)
                    } else {
                        let (child, idx) = internal_lookup(&self.meta, &page, key);
                        (false, child, idx)
                    }
                };
                if is_leaf {
                    return Ok(current);
                }
                let child_latch = self.latches.latch(child);
                child_latch.write_lock();
                let safe = match self.node_is_safe(child, op) {
                    Ok(safe) => safe,
                    Err(e) => {
                        child_latch.write_unlock();
                        return Err(e);
                    }
                };
                if idx != 0 && safe {
                    self.unlock_ancestors(txn);
                }
                txn.push_latch_page(child);
                current = child;
            }
        }
    }

    /// Pops and releases every latch the transaction still holds, in the
    /// order they were acquired.
    fn unlock_ancestors(&self, txn: &Transaction) {
        for page_no in txn.drain_latch_pages() {
            self.latches.latch(page_no).write_unlock();
        }
    }

    /// Releases the most recently tracked latch (the current node).
    fn release_last_latch(&self, txn: &Transaction) {
        if let Some(page_no) = txn.pop_latch_page() {
            self.latches.latch(page_no).write_unlock();
        }
    }

    /// Equality lookup.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<Rid>> {
        self.check_key(key)?;
        let (leaf_no, _held) = self.find_leaf_read(key)?;
        let guard = self.page(leaf_no)?;
        let page = guard.read();
        Ok(leaf_lookup(&self.meta, &page, key))
    }

    /// Inserts a (key, rid) pair, splitting on overflow. A duplicate key is
    /// rejected silently; returns whether the pair went in.
    pub fn insert_entry(&self, key: &[u8], rid: Rid, txn: &Transaction) -> Result<bool> {
        self.check_key(key)?;
        let _cleanup = TraversalGuard { tree: self, txn };
        let leaf_no = self.find_leaf_write(key, Operation::Insert, txn)?;

        let (count, pos, inserted) = {
            let guard = self.page(leaf_no)?;
            let mut page = guard.write();
            let before = read_node_hdr(&page).num_key as usize;
            let (count, pos) = node_insert(&self.meta, &mut page, key, rid);
            (count, pos, count != before)
        };
        if pos == 0 {
            self.maintain_parent(leaf_no)?;
        }

        if count == self.meta.order {
            let (right_no, right_latch, sep_key) = self.split(leaf_no)?;
            self.insert_into_parent(leaf_no, sep_key, right_no, right_latch, txn)?;
        } else {
            self.unlock_ancestors(txn);
        }
        Ok(inserted)
    }

    /// Moves the upper half of a full node into a fresh right sibling.
    /// Returns the new page, its still-held write latch, and its first key.
    fn split(&self, page_no: PageNo) -> Result<(PageNo, WriteLatchGuard, Vec<u8>)> {
        let new_no = self.create_node()?;
        let right_latch = WriteLatchGuard::lock(self.latches.latch(new_no));

        let (parent, is_leaf, old_next, moved_keys, moved_rids) = {
            let guard = self.page(page_no)?;
            let mut page = guard.write();
            let mut hdr = read_node_hdr(&page);
            let nums = hdr.num_key as usize;
            let pos = nums / 2;
            let mut keys = Vec::with_capacity((nums - pos) * self.meta.col_tot_len);
            let mut rids = Vec::with_capacity(nums - pos);
            for i in pos..nums {
                keys.extend_from_slice(key_slice(&self.meta, &page, i));
                rids.push(rid_at(&self.meta, &page, i));
            }
            hdr.num_key = pos as u32;
            write_node_hdr(&mut page, &hdr);
            (hdr.parent, hdr.is_leaf, hdr.next_leaf, keys, rids)
        };

        {
            let guard = self.page(new_no)?;
            let mut page = guard.write();
            write_node_hdr(
                &mut page,
                &IxPageHdr {
                    parent,
                    is_leaf,
                    num_key: 0,
                    next_leaf: INVALID_PAGE_NO,
                    prev_leaf: INVALID_PAGE_NO,
                },
            );
            insert_pairs(&self.meta, &mut page, 0, &moved_keys, &moved_rids);
        }

        if is_leaf != 0 {
            // Splice the new leaf between the split node and its successor;
            // all three latches are held while the ring is inconsistent.
            let succ_latch = WriteLatchGuard::lock(self.latches.latch(old_next));
            {
                let guard = self.page(new_no)?;
                let mut page = guard.write();
                let mut hdr = read_node_hdr(&page);
                hdr.prev_leaf = page_no;
                hdr.next_leaf = old_next;
                write_node_hdr(&mut page, &hdr);
            }
            {
                let guard = self.page(page_no)?;
                let mut page = guard.write();
                let mut hdr = read_node_hdr(&page);
                hdr.next_leaf = new_no;
                write_node_hdr(&mut page, &hdr);
            }
            {
                let guard = self.page(old_next)?;
                let mut page = guard.write();
                let mut hdr = read_node_hdr(&page);
                hdr.prev_leaf = new_no;
                write_node_hdr(&mut page, &hdr);
            }
            drop(succ_latch);

            let mut state = self.state.write();
            if state.last_leaf == page_no {
                state.last_leaf = new_no;
            }
        } else {
            let moved = {
                let guard = self.page(new_no)?;
                let page = guard.read();
                read_node_hdr(&page).num_key as usize
            };
            for i in 0..moved {
                self.maintain_child(new_no, i)?;
            }
        }

        let sep_key = {
            let guard = self.page(new_no)?;
            let page = guard.read();
            key_slice(&self.meta, &page, 0).to_vec()
        };
        Ok((new_no, right_latch, sep_key))
    }

    /// Publishes a split upwards: either a fresh root adopts both halves,
    /// or the separator goes into the existing parent, recursing if that
    /// fills it in turn.
    fn insert_into_parent(
        &self,
        left_no: PageNo,
        sep_key: Vec<u8>,
        right_no: PageNo,
        right_latch: WriteLatchGuard,
        txn: &Transaction,
    ) -> Result<()> {
        let parent_no = self.node_hdr(left_no)?.parent;

        if parent_no == INVALID_PAGE_NO {
            let root_no = self.create_node()?;
            let root_latch = WriteLatchGuard::lock(self.latches.latch(root_no));
            let left_key0 = {
                let guard = self.page(left_no)?;
                let page = guard.read();
                key_slice(&self.meta, &page, 0).to_vec()
            };
            {
                let guard = self.page(root_no)?;
                let mut page = guard.write();
                insert_pairs(&self.meta, &mut page, 0, &left_key0, &[Rid::new(left_no, 0)]);
                insert_pairs(&self.meta, &mut page, 1, &sep_key, &[Rid::new(right_no, 0)]);
            }
            self.maintain_child(root_no, 0)?;
            self.maintain_child(root_no, 1)?;
            self.state.write().root_page = root_no;
            drop(root_latch);
            self.release_last_latch(txn);
            drop(right_latch);
            return Ok(());
        }

        let count = {
            let guard = self.page(parent_no)?;
            let mut page = guard.write();
            node_insert(&self.meta, &mut page, &sep_key, Rid::new(right_no, 0)).0
        };
        self.release_last_latch(txn);
        drop(right_latch);

        if count == self.meta.order {
            let (new_no, new_latch, new_sep) = self.split(parent_no)?;
            self.insert_into_parent(parent_no, new_sep, new_no, new_latch, txn)
        } else {
            self.unlock_ancestors(txn);
            Ok(())
        }
    }

    /// Walks parents upwards overwriting each slot-0 copy of the child's
    /// first key, stopping at the first parent that already matches.
    fn maintain_parent(&self, start: PageNo) -> Result<()> {
        let mut current = start;
        loop {
            let (parent_no, child_key) = {
                let guard = self.page(current)?;
                let page = guard.read();
                let hdr = read_node_hdr(&page);
                if hdr.parent == INVALID_PAGE_NO || hdr.num_key == 0 {
                    return Ok(());
                }
                (hdr.parent, key_slice(&self.meta, &page, 0).to_vec())
            };
            let changed = {
                let guard = self.page(parent_no)?;
                let mut page = guard.write();
                let rank = find_child(&self.meta, &page, current);
                if key_slice(&self.meta, &page, rank) == child_key.as_slice() {
                    false
                } else {
                    set_key_at(&self.meta, &mut page, rank, &child_key);
                    true
                }
            };
            if !changed {
                return Ok(());
            }
            current = parent_no;
        }
    }

    /// Points the parent field of one child at `node_no`. No-op on leaves.
    fn maintain_child(&self, node_no: PageNo, idx: usize) -> Result<()> {
        let child_no = {
            let guard = self.page(node_no)?;
            let page = guard.read();
            let hdr = read_node_hdr(&page);
            if hdr.is_leaf != 0 {
                return Ok(());
            }
            rid_at(&self.meta, &page, idx).page_no
        };
        let guard = self.page(child_no)?;
        let mut page = guard.write();
        let mut hdr = read_node_hdr(&page);
        hdr.parent = node_no;
        write_node_hdr(&mut page, &hdr);
        Ok(())
    }

    /// Removes a key. Returns false (with no side effect) when it is
    /// absent.
    pub fn delete_entry(&self, key: &[u8], txn: &Transaction) -> Result<bool> {
        self.check_key(key)?;
        let _cleanup = TraversalGuard { tree: self, txn };
        let leaf_no = self.find_leaf_write(key, Operation::Delete, txn)?;

        let (removed, pos) = {
            let guard = self.page(leaf_no)?;
            let mut page = guard.write();
            let before = read_node_hdr(&page).num_key as usize;
            let (after, pos) = node_remove(&self.meta, &mut page, key);
            (after != before, pos)
        };
        if !removed {
            self.unlock_ancestors(txn);
            return Ok(false);
        }
        if pos == 0 {
            self.maintain_parent(leaf_no)?;
        }
        self.coalesce_or_redistribute(leaf_no, txn)?;
        Ok(true)
    }

    fn coalesce_or_redistribute(&self, node_no: PageNo, txn: &Transaction) -> Result<()> {
        let hdr = self.node_hdr(node_no)?;
        if hdr.parent == INVALID_PAGE_NO {
            return self.adjust_root(node_no, txn);
        }
        let num_key = hdr.num_key as usize;
        if num_key >= self.meta.min_size {
            self.unlock_ancestors(txn);
            return Ok(());
        }

        // Prefer the left sibling; the leftmost child falls back to its
        // right neighbor.
        let parent_no = hdr.parent;
        let (idx, sibling_no) = {
            let guard = self.page(parent_no)?;
            let page = guard.read();
            let idx = find_child(&self.meta, &page, node_no);
            let sibling = if idx == 0 {
                rid_at(&self.meta, &page, idx + 1).page_no
            } else {
                rid_at(&self.meta, &page, idx - 1).page_no
            };
            (idx, sibling)
        };
        let sibling_latch = WriteLatchGuard::lock(self.latches.latch(sibling_no));

        let total = num_key + self.node_hdr(sibling_no)?.num_key as usize;
        if total >= 2 * self.meta.min_size {
            self.redistribute(sibling_no, node_no, parent_no, idx)?;
            drop(sibling_latch);
            self.unlock_ancestors(txn);
            Ok(())
        } else {
            self.coalesce(sibling_no, node_no, parent_no, idx, sibling_latch, txn)
        }
    }

    /// The root follows looser rules: an internal root left with a single
    /// child promotes that child; an empty root leaf simply stays as the
    /// empty tree.
    fn adjust_root(&self, root_no: PageNo, txn: &Transaction) -> Result<()> {
        let hdr = self.node_hdr(root_no)?;
        if hdr.is_leaf == 0 && hdr.num_key == 1 {
            let child_no = {
                let guard = self.page(root_no)?;
                let page = guard.read();
                rid_at(&self.meta, &page, 0).page_no
            };
            let child_latch = WriteLatchGuard::lock(self.latches.latch(child_no));
            {
                let guard = self.page(child_no)?;
                let mut page = guard.write();
                let mut child_hdr = read_node_hdr(&page);
                child_hdr.parent = INVALID_PAGE_NO;
                write_node_hdr(&mut page, &child_hdr);
            }
            self.state.write().root_page = child_no;
            drop(child_latch);

            self.bpm.delete_page(PageId::new(self.file_id, root_no))?;
            self.state.write().num_pages -= 1;
        }
        self.unlock_ancestors(txn);
        Ok(())
    }

    /// Moves one boundary pair from the sibling into the underflowing node
    /// and rewrites the separator key in the parent.
    fn redistribute(
        &self,
        neighbor_no: PageNo,
        node_no: PageNo,
        parent_no: PageNo,
        idx: usize,
    ) -> Result<()> {
        if idx > 0 {
            // Left sibling: its last pair becomes the node's new front.
            let (key, rid) = {
                let guard = self.page(neighbor_no)?;
                let mut page = guard.write();
                let last = read_node_hdr(&page).num_key as usize - 1;
                let key = key_slice(&self.meta, &page, last).to_vec();
                let rid = rid_at(&self.meta, &page, last);
                erase_pair(&self.meta, &mut page, last);
                (key, rid)
            };
            {
                let guard = self.page(node_no)?;
                let mut page = guard.write();
                insert_pairs(&self.meta, &mut page, 0, &key, &[rid]);
            }
            {
                let guard = self.page(parent_no)?;
                let mut page = guard.write();
                set_key_at(&self.meta, &mut page, idx, &key);
            }
            self.maintain_child(node_no, 0)?;
        } else {
            // Right sibling: its first pair becomes the node's new tail.
            let (key, rid, sibling_first) = {
                let guard = self.page(neighbor_no)?;
                let mut page = guard.write();
                let key = key_slice(&self.meta, &page, 0).to_vec();
                let rid = rid_at(&self.meta, &page, 0);
                erase_pair(&self.meta, &mut page, 0);
                let first = key_slice(&self.meta, &page, 0).to_vec();
                (key, rid, first)
            };
            let tail = {
                let guard = self.page(node_no)?;
                let mut page = guard.write();
                let tail = read_node_hdr(&page).num_key as usize;
                insert_pairs(&self.meta, &mut page, tail, &key, &[rid]);
                tail
            };
            {
                let guard = self.page(parent_no)?;
                let mut page = guard.write();
                set_key_at(&self.meta, &mut page, idx + 1, &sibling_first);
            }
            self.maintain_child(node_no, tail)?;
        }
        Ok(())
    }

    /// Merges the right node into the left one, unlinks it from the leaf
    /// ring, deletes its page, and recurses on the parent.
    fn coalesce(
        &self,
        neighbor_no: PageNo,
        node_no: PageNo,
        parent_no: PageNo,
        idx: usize,
        neighbor_latch: WriteLatchGuard,
        txn: &Transaction,
    ) -> Result<()> {
        let (left_no, right_no, erase_idx) = if idx == 0 {
            (node_no, neighbor_no, 1)
        } else {
            (neighbor_no, node_no, idx)
        };

        let (right_keys, right_rids, right_is_leaf, right_next) = {
            let guard = self.page(right_no)?;
            let page = guard.read();
            let hdr = read_node_hdr(&page);
            let n = hdr.num_key as usize;
            let mut keys = Vec::with_capacity(n * self.meta.col_tot_len);
            let mut rids = Vec::with_capacity(n);
            for i in 0..n {
                keys.extend_from_slice(key_slice(&self.meta, &page, i));
                rids.push(rid_at(&self.meta, &page, i));
            }
            (keys, rids, hdr.is_leaf != 0, hdr.next_leaf)
        };

        let left_old = {
            let guard = self.page(left_no)?;
            let mut page = guard.write();
            let n = read_node_hdr(&page).num_key as usize;
            insert_pairs(&self.meta, &mut page, n, &right_keys, &right_rids);
            n
        };
        for i in left_old..left_old + right_rids.len() {
            self.maintain_child(left_no, i)?;
        }

        if right_is_leaf {
            // Unlink the right leaf; left, right and the successor are all
            // latched while the ring is inconsistent.
            let succ_latch = WriteLatchGuard::lock(self.latches.latch(right_next));
            {
                let guard = self.page(left_no)?;
                let mut page = guard.write();
                let mut hdr = read_node_hdr(&page);
                hdr.next_leaf = right_next;
                write_node_hdr(&mut page, &hdr);
            }
            {
                let guard = self.page(right_next)?;
                let mut page = guard.write();
                let mut hdr = read_node_hdr(&page);
                hdr.prev_leaf = left_no;
                write_node_hdr(&mut page, &hdr);
            }
            drop(succ_latch);

            let mut state = self.state.write();
            if state.last_leaf == right_no {
                state.last_leaf = left_no;
            }
        }

        self.bpm.delete_page(PageId::new(self.file_id, right_no))?;
        self.state.write().num_pages -= 1;

        drop(neighbor_latch);
        self.release_last_latch(txn);

        {
            let guard = self.page(parent_no)?;
            let mut page = guard.write();
            erase_pair(&self.meta, &mut page, erase_idx);
        }
        self.coalesce_or_redistribute(parent_no, txn)
    }

    /// Position of the first key >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iid> {
        self.check_key(key)?;
        let (leaf_no, _held) = self.find_leaf_read(key)?;
        let guard = self.page(leaf_no)?;
        let page = guard.read();
        Ok(Iid {
            page_no: leaf_no,
            slot_no: lower_bound(&self.meta, &page, key),
        })
    }

    /// Position just past the last key <= `key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iid> {
        self.check_key(key)?;
        let (leaf_no, _held) = self.find_leaf_read(key)?;
        let guard = self.page(leaf_no)?;
        let page = guard.read();
        Ok(Iid {
            page_no: leaf_no,
            slot_no: upper_bound(&self.meta, &page, key),
        })
    }

    /// First slot of the first leaf.
    pub fn leaf_begin(&self) -> Iid {
        Iid {
            page_no: self.state.read().first_leaf,
            slot_no: 0,
        }
    }

    /// One past the last slot of the last leaf.
    pub fn leaf_end(&self) -> Result<Iid> {
        let last = self.state.read().last_leaf;
        let hdr = self.node_hdr(last)?;
        Ok(Iid {
            page_no: last,
            slot_no: hdr.num_key as usize,
        })
    }

    /// Resolves an `Iid` to its tuple rid, hopping to the next leaf when
    /// the slot sits one past the end of its node.
    pub fn get_rid(&self, iid: Iid) -> Result<Rid> {
        let next = {
            let guard = self.page(iid.page_no)?;
            let page = guard.read();
            let hdr = read_node_hdr(&page);
            if iid.slot_no < hdr.num_key as usize {
                return Ok(rid_at(&self.meta, &page, iid.slot_no));
            }
            hdr.next_leaf
        };
        let guard = self.page(next)?;
        let page = guard.read();
        Ok(rid_at(&self.meta, &page, 0))
    }

    /// Ordered cursor over `[lo, hi)`.
    pub fn scan(&self, lo: Iid, hi: Iid) -> Result<IndexScan<'_>> {
        IndexScan::new(self, lo, hi)
    }

    /// Full ordered leaf scan.
    pub fn scan_all(&self) -> Result<IndexScan<'_>> {
        let end = self.leaf_end()?;
        IndexScan::new(self, self.leaf_begin(), end)
    }

    /// All rids with key in the given range; each bound is inclusive or
    /// exclusive per its flag. Equality lookup is the special case of equal
    /// inclusive bounds.
    pub fn range_query(
        &self,
        lk: &[u8],
        rk: &[u8],
        inclusive_l: bool,
        inclusive_r: bool,
    ) -> Result<Vec<Rid>> {
        self.check_key(lk)?;
        self.check_key(rk)?;
        if ix_compare(lk, rk, &self.meta.col_types, &self.meta.col_lens)
            == std::cmp::Ordering::Greater
        {
            return Ok(Vec::new());
        }
        let lo = if inclusive_l {
            self.lower_bound(lk)?
        } else {
            self.upper_bound(lk)?
        };
        let hi = if inclusive_r {
            self.upper_bound(rk)?
        } else {
            self.lower_bound(rk)?
        };
        let mut scan = self.scan(lo, hi)?;
        let mut rids = Vec::new();
        while !scan.is_end() {
            rids.push(scan.rid()?);
            scan.next()?;
        }
        Ok(rids)
    }
}

/// Forward cursor over the leaf chain between two `Iid` bounds.
pub struct IndexScan<'a> {
    tree: &'a BPlusTree,
    iid: Iid,
    end: Iid,
}

impl<'a> IndexScan<'a> {
    fn new(tree: &'a BPlusTree, lo: Iid, hi: Iid) -> Result<Self> {
        let mut scan = IndexScan {
            tree,
            iid: lo,
            end: hi,
        };
        scan.normalize()?;
        Ok(scan)
    }

    /// Skips past exhausted leaves so that `iid` always names a real slot
    /// or equals `end`.
    fn normalize(&mut self) -> Result<()> {
        while self.iid != self.end {
            let hdr = self.tree.node_hdr(self.iid.page_no)?;
            if self.iid.slot_no < hdr.num_key as usize {
                break;
            }
            if self.iid.page_no == self.tree.state.read().last_leaf {
                self.iid = self.end;
                break;
            }
            self.iid = Iid {
                page_no: hdr.next_leaf,
                slot_no: 0,
            };
        }
        Ok(())
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    pub fn rid(&self) -> Result<Rid> {
        let guard = self.tree.page(self.iid.page_no)?;
        let page = guard.read();
        Ok(rid_at(&self.tree.meta, &page, self.iid.slot_no))
    }

    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.iid.slot_no += 1;
        self.normalize()
    }
}
