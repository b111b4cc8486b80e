//! Manages table, record and gap locks under strict two-phase locking with
//! a no-wait policy: every acquisition is non-blocking, and a refused lock
//! aborts the requesting transaction instead of risking a deadlock.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use crate::catalog::ColMeta;
use crate::disk::FileId;
use crate::transaction::Transaction;
use crate::types::Value;
use crate::{Rid, TxnId};

/// Names one lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table { fd: FileId },
    Record { fd: FileId, rid: Rid },
}

impl LockDataId {
    pub fn fd(&self) -> FileId {
        match self {
            LockDataId::Table { fd } => *fd,
            LockDataId::Record { fd, .. } => *fd,
        }
    }
}

/// Strength of a table-level lock or intent. The declaration order is the
/// exclusivity order used to pick the strongest held mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableLockMode {
    NonLock,
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl Default for TableLockMode {
    fn default() -> Self {
        TableLockMode::NonLock
    }
}

enum Acquire {
    Granted,
    Reentrant,
    Denied,
}

/// Non-blocking reader/writer state of one lock entry.
#[derive(Debug, Default)]
struct LockEntry {
    writer: Option<TxnId>,
    readers: HashSet<TxnId>,
}

impl LockEntry {
    fn holds(&self, txn_id: TxnId) -> bool {
        self.writer == Some(txn_id) || self.readers.contains(&txn_id)
    }

    fn try_shared(&mut self, txn_id: TxnId) -> Acquire {
        if let Some(w) = self.writer {
            if w == txn_id {
                return Acquire::Reentrant;
            }
            return Acquire::Denied;
        }
        if self.readers.contains(&txn_id) {
            return Acquire::Reentrant;
        }
        self.readers.insert(txn_id);
        Acquire::Granted
    }

    fn try_exclusive(&mut self, txn_id: TxnId) -> Acquire {
        if self.writer == Some(txn_id) {
            return Acquire::Reentrant;
        }
        if self.writer.is_some() {
            return Acquire::Denied;
        }
        if self.readers.iter().any(|&t| t != txn_id) {
            return Acquire::Denied;
        }
        // Sole holder (or no holder): grant, upgrading a self-held read.
        self.writer = Some(txn_id);
        Acquire::Granted
    }

    fn release(&mut self, txn_id: TxnId) {
        if self.writer == Some(txn_id) {
            self.writer = None;
        } else {
            self.readers.remove(&txn_id);
        }
    }

    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// Per-table summary of every held base or intent lock, with the strongest
/// mode cached for compatibility checks.
#[derive(Debug, Default)]
struct TableModeSet {
    mode_set: BTreeMap<TableLockMode, usize>,
    mode: TableLockMode,
}

impl TableModeSet {
    fn insert(&mut self, mode: TableLockMode) {
        *self.mode_set.entry(mode).or_insert(0) += 1;
        self.recompute();
    }

    fn remove(&mut self, mode: TableLockMode) {
        if let Some(count) = self.mode_set.get_mut(&mode) {
            *count -= 1;
            if *count == 0 {
                self.mode_set.remove(&mode);
            }
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        self.mode = self
            .mode_set
            .keys()
            .next_back()
            .copied()
            .unwrap_or(TableLockMode::NonLock);
    }
}

/// A predicate-lock range over one column's values. Sentinel endpoints
/// express half-open predicates.
#[derive(Debug, Clone)]
pub struct ValueRange {
    pub lo: Value,
    pub hi: Value,
}

impl ValueRange {
    pub fn new(lo: Value, hi: Value) -> Self {
        ValueRange { lo, hi }
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.lo.compare(value) != std::cmp::Ordering::Greater
            && self.hi.compare(value) != std::cmp::Ordering::Less
    }
}

/// The lock manager. Row and table locks are keyed by `LockDataId`; gap
/// locks by (file, (transaction, column)).
#[derive(Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockEntry>>,
    tab_mode_table: Mutex<HashMap<FileId, TableModeSet>>,
    gap_table: Mutex<HashMap<FileId, HashMap<(TxnId, String), Vec<ValueRange>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table_mode(&self, fd: FileId) -> TableLockMode {
        self.tab_mode_table.lock().entry(fd).or_default().mode
    }

    fn insert_mode(&self, fd: FileId, mode: TableLockMode) {
        self.tab_mode_table.lock().entry(fd).or_default().insert(mode);
    }

    fn release_entry(&self, id: LockDataId, txn_id: TxnId) {
        let mut lock_table = self.lock_table.lock();
        if let Some(entry) = lock_table.get_mut(&id) {
            entry.release(txn_id);
            if entry.is_free() {
                lock_table.remove(&id);
            }
        }
    }

    /// Shared row lock. Records an IS intent on the table first.
    pub fn lock_shared_on_record(&self, txn: &Transaction, rid: Rid, fd: FileId) -> bool {
        let id = LockDataId::Record { fd, rid };
        self.lock_is_on_table(txn, fd);
        let outcome = self.lock_table.lock().entry(id).or_default().try_shared(txn.id());
        match outcome {
            Acquire::Granted => {
                txn.append_lock_set(id, TableLockMode::NonLock);
                true
            }
            Acquire::Reentrant => true,
            Acquire::Denied => false,
        }
    }

    /// Exclusive row lock. Records an IX intent on the table first. A
    /// transaction that already holds the row (shared or exclusive) is
    /// granted re-entrantly.
    pub fn lock_exclusive_on_record(&self, txn: &Transaction, rid: Rid, fd: FileId) -> bool {
        let id = LockDataId::Record { fd, rid };
        self.lock_ix_on_table(txn, fd);
        let outcome = self
            .lock_table
            .lock()
            .entry(id)
            .or_default()
            .try_exclusive(txn.id());
        match outcome {
            Acquire::Granted => {
                txn.append_lock_set(id, TableLockMode::NonLock);
                true
            }
            Acquire::Reentrant => true,
            Acquire::Denied => false,
        }
    }

    /// Table-wide shared lock: granted iff the strongest held mode is
    /// compatible with S.
    pub fn lock_shared_on_table(&self, txn: &Transaction, fd: FileId) -> bool {
        let id = LockDataId::Table { fd };
        let mode = self.table_mode(fd);
        let compatible = matches!(
            mode,
            TableLockMode::NonLock | TableLockMode::IntentionShared | TableLockMode::Shared
        );

        let mut lock_table = self.lock_table.lock();
        let entry = lock_table.entry(id).or_default();
        if !compatible {
            return entry.holds(txn.id());
        }
        match entry.try_shared(txn.id()) {
            Acquire::Granted => {
                drop(lock_table);
                self.insert_mode(fd, TableLockMode::Shared);
                txn.append_lock_set(id, TableLockMode::Shared);
                true
            }
            Acquire::Reentrant => true,
            Acquire::Denied => false,
        }
    }

    /// Table-wide exclusive lock: granted iff no other lock of any strength
    /// is held on the table.
    pub fn lock_exclusive_on_table(&self, txn: &Transaction, fd: FileId) -> bool {
        let id = LockDataId::Table { fd };
        let mode = self.table_mode(fd);

        let mut lock_table = self.lock_table.lock();
        let entry = lock_table.entry(id).or_default();
        if mode != TableLockMode::NonLock {
            return entry.holds(txn.id());
        }
        match entry.try_exclusive(txn.id()) {
            Acquire::Granted => {
                drop(lock_table);
                self.insert_mode(fd, TableLockMode::Exclusive);
                txn.append_lock_set(id, TableLockMode::Exclusive);
                true
            }
            Acquire::Reentrant => true,
            Acquire::Denied => false,
        }
    }

    /// Intention-shared: records the intent and proceeds without blocking.
    pub fn lock_is_on_table(&self, txn: &Transaction, fd: FileId) -> bool {
        self.insert_mode(fd, TableLockMode::IntentionShared);
        txn.append_lock_set(LockDataId::Table { fd }, TableLockMode::IntentionShared);
        true
    }

    /// Intention-exclusive: records the intent and proceeds without blocking.
    pub fn lock_ix_on_table(&self, txn: &Transaction, fd: FileId) -> bool {
        self.insert_mode(fd, TableLockMode::IntentionExclusive);
        txn.append_lock_set(LockDataId::Table { fd }, TableLockMode::IntentionExclusive);
        true
    }

    /// Registers one predicate range for a scanning transaction.
    pub fn add_gap_lock(&self, txn_id: TxnId, fd: FileId, col: &str, range: ValueRange) {
        self.gap_table
            .lock()
            .entry(fd)
            .or_default()
            .entry((txn_id, col.to_string()))
            .or_default()
            .push(range);
    }

    /// Checks a row mutation against every other transaction's gap locks on
    /// the file. Returns false when any column value falls inside a foreign
    /// range, which the caller must treat as a write-write conflict.
    pub fn check_gap_lock(
        &self,
        txn_id: TxnId,
        fd: FileId,
        cols: &[ColMeta],
        record: &[u8],
    ) -> bool {
        let gap_table = self.gap_table.lock();
        let Some(per_file) = gap_table.get(&fd) else {
            return true;
        };
        for ((owner, col_name), ranges) in per_file {
            if *owner == txn_id {
                continue;
            }
            let Some(col) = cols.iter().find(|c| &c.name == col_name) else {
                continue;
            };
            let value = Value::read_from(col.ty, &record[col.offset..col.offset + col.len]);
            if ranges.iter().any(|r| r.contains(&value)) {
                return false;
            }
        }
        true
    }

    /// Drops every gap lock the transaction registered, on every file.
    pub fn erase_gap_locks(&self, txn_id: TxnId) {
        for per_file in self.gap_table.lock().values_mut() {
            per_file.retain(|(owner, _), _| *owner != txn_id);
        }
    }

    /// Releases one lock and demotes the table mode summary to the new
    /// strongest mode.
    pub fn unlock(&self, txn_id: TxnId, id: LockDataId, mode: TableLockMode) -> bool {
        if mode != TableLockMode::NonLock {
            self.tab_mode_table
                .lock()
                .entry(id.fd())
                .or_default()
                .remove(mode);
        }
        match id {
            LockDataId::Record { .. } => self.release_entry(id, txn_id),
            LockDataId::Table { .. } => {
                if matches!(mode, TableLockMode::Shared | TableLockMode::Exclusive) {
                    self.release_entry(id, txn_id);
                }
            }
        }
        true
    }

    /// Releases everything a transaction holds: its lock set in order, then
    /// its gap locks.
    pub fn release_all(&self, txn: &Transaction) {
        for (id, mode) in txn.take_lock_set() {
            self.unlock(txn.id(), id, mode);
        }
        self.erase_gap_locks(txn.id());
    }

    #[cfg(test)]
    fn mode_of(&self, fd: FileId) -> TableLockMode {
        self.table_mode(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: TxnId) -> Transaction {
        Transaction::new(id, id as u64)
    }

    #[test]
    fn exclusive_row_locks_conflict_across_transactions() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_exclusive_on_record(&t1, rid, 0));
        assert!(!lm.lock_exclusive_on_record(&t2, rid, 0));
        assert!(!lm.lock_shared_on_record(&t2, rid, 0));

        lm.release_all(&t1);
        assert!(lm.lock_exclusive_on_record(&t2, rid, 0));
    }

    #[test]
    fn shared_row_locks_coexist() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared_on_record(&t1, rid, 0));
        assert!(lm.lock_shared_on_record(&t2, rid, 0));
        assert!(!lm.lock_exclusive_on_record(&t1, rid, 0));
    }

    #[test]
    fn self_acquisition_is_reentrant_and_upgrades() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let rid = Rid::new(2, 3);

        assert!(lm.lock_shared_on_record(&t1, rid, 0));
        assert!(lm.lock_shared_on_record(&t1, rid, 0));
        // Sole reader upgrades to exclusive.
        assert!(lm.lock_exclusive_on_record(&t1, rid, 0));
        assert!(lm.lock_exclusive_on_record(&t1, rid, 0));
    }

    #[test]
    fn row_locks_record_intents_on_the_table() {
        let lm = LockManager::new();
        let t1 = txn(1);

        assert!(lm.lock_shared_on_record(&t1, Rid::new(1, 0), 5));
        assert_eq!(lm.mode_of(5), TableLockMode::IntentionShared);

        assert!(lm.lock_exclusive_on_record(&t1, Rid::new(1, 1), 5));
        assert_eq!(lm.mode_of(5), TableLockMode::IntentionExclusive);

        lm.release_all(&t1);
        assert_eq!(lm.mode_of(5), TableLockMode::NonLock);
    }

    #[test]
    fn table_x_requires_an_idle_table() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);

        assert!(lm.lock_shared_on_record(&t1, Rid::new(1, 0), 7));
        assert!(!lm.lock_exclusive_on_table(&t2, 7));

        lm.release_all(&t1);
        assert!(lm.lock_exclusive_on_table(&t2, 7));
        assert!(!lm.lock_shared_on_table(&t1, 7));
    }

    #[test]
    fn table_s_is_compatible_with_is_and_s() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);
        let t3 = txn(3);

        assert!(lm.lock_shared_on_record(&t1, Rid::new(1, 0), 9));
        assert!(lm.lock_shared_on_table(&t2, 9));
        assert!(lm.lock_shared_on_table(&t3, 9));
    }

    #[test]
    fn table_s_is_denied_under_ix() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);

        // A row write leaves IX as the strongest table mode.
        assert!(lm.lock_exclusive_on_record(&t1, Rid::new(1, 0), 9));
        assert!(!lm.lock_shared_on_table(&t2, 9));

        lm.release_all(&t1);
        assert!(lm.lock_shared_on_table(&t2, 9));
    }

    #[test]
    fn unlock_demotes_to_the_next_strongest_mode() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);

        assert!(lm.lock_shared_on_record(&t1, Rid::new(1, 0), 3));
        assert!(lm.lock_exclusive_on_record(&t2, Rid::new(1, 1), 3));
        assert_eq!(lm.mode_of(3), TableLockMode::IntentionExclusive);

        lm.release_all(&t2);
        assert_eq!(lm.mode_of(3), TableLockMode::IntentionShared);
    }

    #[test]
    fn gap_lock_blocks_foreign_writes_only() {
        let lm = LockManager::new();
        let cols = vec![ColMeta {
            tab_name: "t".into(),
            name: "a".into(),
            ty: crate::types::ColType::Int,
            offset: 0,
            len: 4,
        }];

        // txn 1 scanned with predicate a = 5.
        lm.add_gap_lock(1, 0, "a", ValueRange::new(Value::Int(5), Value::Int(5)));

        let row5 = 5i32.to_le_bytes();
        let row6 = 6i32.to_le_bytes();
        assert!(!lm.check_gap_lock(2, 0, &cols, &row5));
        assert!(lm.check_gap_lock(2, 0, &cols, &row6));
        // The scanning transaction itself is unaffected.
        assert!(lm.check_gap_lock(1, 0, &cols, &row5));

        lm.erase_gap_locks(1);
        assert!(lm.check_gap_lock(2, 0, &cols, &row5));
    }

    #[test]
    fn sentinel_ranges_cover_open_ends() {
        let range = ValueRange::new(Value::Min, Value::Int(10));
        assert!(range.contains(&Value::Int(i32::MIN)));
        assert!(range.contains(&Value::Int(10)));
        assert!(!range.contains(&Value::Int(11)));

        let all = ValueRange::new(Value::Min, Value::Max);
        assert!(all.contains(&Value::Str("anything".into())));

        // The empty cover used for unconstrained columns matches nothing.
        let empty = ValueRange::new(Value::Max, Value::Min);
        assert!(!empty.contains(&Value::Int(0)));
    }
}
