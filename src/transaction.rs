//! The transaction layer: per-transaction lock, latch and undo state, plus
//! the transaction manager that drives begin, commit and abort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::{Context, Database};
use crate::errors::{DbError, Result};
use crate::lock_manager::{LockDataId, TableLockMode};
use crate::log::LogRecord;
use crate::{PageNo, Rid, TxnId};

/// Life cycle of a transaction. A transaction terminates exactly once, via
/// commit or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Default,
    Growing,
    Committed,
    Aborted,
}

/// Kind of tuple mutation recorded for undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    InsertTuple,
    UpdateTuple,
    DeleteTuple,
}

/// Everything needed to undo one tuple mutation: the kind, the place, and
/// the pre-image bytes.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub wtype: WriteType,
    pub tab_name: String,
    pub rid: Rid,
    pub record: Vec<u8>,
}

impl WriteRecord {
    pub fn new(wtype: WriteType, tab_name: &str, rid: Rid, record: Vec<u8>) -> Self {
        WriteRecord {
            wtype,
            tab_name: tab_name.to_string(),
            rid,
            record,
        }
    }
}

/// One running transaction: its held locks, its undo log, and the page
/// latches of an in-flight B+-tree traversal.
pub struct Transaction {
    txn_id: TxnId,
    start_ts: u64,
    state: Mutex<TxnState>,
    lock_set: Mutex<Vec<(LockDataId, TableLockMode)>>,
    write_set: Mutex<Vec<WriteRecord>>,
    latch_pages: Mutex<Vec<PageNo>>,
}

impl Transaction {
    pub fn new(txn_id: TxnId, start_ts: u64) -> Self {
        Transaction {
            txn_id,
            start_ts,
            state: Mutex::new(TxnState::Default),
            lock_set: Mutex::new(Vec::new()),
            write_set: Mutex::new(Vec::new()),
            latch_pages: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.txn_id
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock() = state;
    }

    pub fn append_lock_set(&self, id: LockDataId, mode: TableLockMode) {
        self.lock_set.lock().push((id, mode));
    }

    pub(crate) fn take_lock_set(&self) -> Vec<(LockDataId, TableLockMode)> {
        std::mem::take(&mut *self.lock_set.lock())
    }

    pub fn append_write_record(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    pub(crate) fn take_write_set(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut *self.write_set.lock())
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().len()
    }

    /// Tracks a write latch taken during a crabbing descent. Latches are
    /// appended root-first and released front-first.
    pub(crate) fn push_latch_page(&self, page_no: PageNo) {
        self.latch_pages.lock().push(page_no);
    }

    pub(crate) fn pop_latch_page(&self) -> Option<PageNo> {
        self.latch_pages.lock().pop()
    }

    pub(crate) fn drain_latch_pages(&self) -> Vec<PageNo> {
        std::mem::take(&mut *self.latch_pages.lock())
    }
}

/// Allocates transaction ids and timestamps and drives the two-phase
/// commit/abort protocol across the heap, the indexes and the lock manager.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    next_timestamp: AtomicU64,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            next_txn_id: AtomicU32::new(0),
            next_timestamp: AtomicU64::new(0),
            txn_map: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a transaction. With `None`, a new transaction is allocated,
    /// given a monotonically increasing id and start timestamp, and
    /// registered in the process-wide table.
    pub fn begin(&self, txn: Option<Arc<Transaction>>) -> Arc<Transaction> {
        if let Some(txn) = txn {
            return txn;
        }
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let start_ts = self.next_timestamp.fetch_add(1, Ordering::SeqCst) + 1;
        let txn = Arc::new(Transaction::new(txn_id, start_ts));
        txn.set_state(TxnState::Growing);
        self.txn_map.lock().insert(txn_id, txn.clone());
        crate::plinth_debug_log!("[TransactionManager::begin] Started txn {txn_id}");
        txn
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().get(&txn_id).cloned()
    }

    fn check_live(&self, txn: &Transaction) -> Result<()> {
        match txn.state() {
            TxnState::Default | TxnState::Growing => Ok(()),
            _ => Err(DbError::InvalidTxnState { txn_id: txn.id() }),
        }
    }

    /// Commits: undo records are dropped, locks and gap locks released, the
    /// log flushed, and the state moved to `Committed`.
    pub fn commit(&self, txn: &Arc<Transaction>, db: &Database) -> Result<()> {
        self.check_live(txn)?;
        txn.take_write_set();
        db.lock_mgr().release_all(txn);
        {
            let mut log = db.log_mgr().lock();
            log.append(&LogRecord::Commit { txn_id: txn.id() })?;
            log.flush_to_disk()?;
        }
        txn.set_state(TxnState::Committed);
        crate::plinth_debug_log!("[TransactionManager::commit] Committed txn {}", txn.id());
        Ok(())
    }

    /// Aborts: write records are replayed in reverse through the heap and
    /// every index to restore the pre-transaction state, then locks and gap
    /// locks are released and the log flushed.
    pub fn abort(&self, txn: &Arc<Transaction>, db: &Database) -> Result<()> {
        self.check_live(txn)?;
        let write_set = txn.take_write_set();
        let ctx = Context {
            lock_mgr: db.lock_mgr(),
            txn,
        };
        for wr in write_set.iter().rev() {
            let table = db.table(&wr.tab_name)?;
            match wr.wtype {
                WriteType::InsertTuple => {
                    // The post-image carries the index keys to retract.
                    let post = table.heap.get_for_undo(wr.rid)?;
                    table.heap.delete(wr.rid, &ctx)?;
                    for (meta, index) in table.index_pairs() {
                        let key = meta.key_from_record(&post);
                        index.delete_entry(&key, txn)?;
                    }
                }
                WriteType::DeleteTuple => {
                    table.heap.insert_at(wr.rid, &wr.record)?;
                    for (meta, index) in table.index_pairs() {
                        let key = meta.key_from_record(&wr.record);
                        index.insert_entry(&key, wr.rid, txn)?;
                    }
                }
                WriteType::UpdateTuple => {
                    let post = table.heap.get_for_undo(wr.rid)?;
                    for (meta, index) in table.index_pairs() {
                        let key = meta.key_from_record(&post);
                        index.delete_entry(&key, txn)?;
                    }
                    table.heap.update(wr.rid, &wr.record, &ctx)?;
                    for (meta, index) in table.index_pairs() {
                        let key = meta.key_from_record(&wr.record);
                        index.insert_entry(&key, wr.rid, txn)?;
                    }
                }
            }
        }
        db.lock_mgr().release_all(txn);
        {
            let mut log = db.log_mgr().lock();
            log.append(&LogRecord::Abort { txn_id: txn.id() })?;
            log.flush_to_disk()?;
        }
        txn.set_state(TxnState::Aborted);
        crate::plinth_debug_log!("[TransactionManager::abort] Aborted txn {}", txn.id());
        Ok(())
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
