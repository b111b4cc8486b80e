//! The database instance: wires the buffer pool, lock manager, statement
//! log and transaction manager together, owns the table registry, and
//! exposes the record-level operations that executors drive. Nothing here
//! is process-global; all shared state hangs off the `Database` value.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::btree::BPlusTree;
use crate::buffer_pool::BufferPoolManager;
use crate::catalog::{ColMeta, IndexMeta, TabMeta};
use crate::disk::DiskManager;
use crate::errors::{DbError, Result};
use crate::heap::HeapFile;
use crate::lock_manager::{LockManager, ValueRange};
use crate::log::{LogManager, LogRecord};
use crate::transaction::{Transaction, TransactionManager, WriteRecord, WriteType};
use crate::types::{decode_record, encode_record, ColType, Value};
use crate::Rid;

/// Per-statement context threaded into the storage layers.
pub struct Context<'a> {
    pub lock_mgr: &'a LockManager,
    pub txn: &'a Transaction,
}

/// One table's storage: metadata, heap file, and one B+-tree per index
/// (parallel to `meta.indexes`).
pub struct TableHandle {
    pub meta: TabMeta,
    pub heap: Arc<HeapFile>,
    pub indexes: Vec<Arc<BPlusTree>>,
}

impl TableHandle {
    pub fn index_pairs(&self) -> impl Iterator<Item = (&IndexMeta, &Arc<BPlusTree>)> {
        self.meta.indexes.iter().zip(self.indexes.iter())
    }
}

/// Comparison operator of a scan predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One `column op value` predicate of a scan.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub col: String,
    pub op: CmpOp,
    pub value: Value,
}

fn col_width(ty: ColType, declared: usize) -> usize {
    match ty {
        ColType::Int => 4,
        ColType::Float => 8,
        ColType::Str => declared,
    }
}

/// A database instance rooted in one directory.
pub struct Database {
    bpm: Arc<BufferPoolManager>,
    lock_mgr: LockManager,
    log_mgr: Mutex<LogManager>,
    txn_mgr: TransactionManager,
    tables: RwLock<HashMap<String, Arc<TableHandle>>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Database> {
        let disk = Arc::new(DiskManager::open(&dir)?);
        let bpm = Arc::new(BufferPoolManager::new(disk));
        let log_mgr = Mutex::new(LogManager::open(dir.as_ref().join("db.log"))?);
        Ok(Database {
            bpm,
            lock_mgr: LockManager::new(),
            log_mgr,
            txn_mgr: TransactionManager::new(),
            tables: RwLock::new(HashMap::new()),
        })
    }

    pub fn lock_mgr(&self) -> &LockManager {
        &self.lock_mgr
    }

    pub fn log_mgr(&self) -> &Mutex<LogManager> {
        &self.log_mgr
    }

    pub fn txn_mgr(&self) -> &TransactionManager {
        &self.txn_mgr
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.bpm
    }

    /// Creates a table with the given `(name, type, length)` columns. The
    /// length is only meaningful for strings; numerics get their fixed
    /// width.
    pub fn create_table(&self, name: &str, cols: &[(&str, ColType, usize)]) -> Result<()> {
        let mut metas = Vec::with_capacity(cols.len());
        let mut offset = 0;
        for (col_name, ty, declared) in cols {
            let len = col_width(*ty, *declared);
            if len == 0 {
                return Err(DbError::IncompatibleType {
                    expected: "STRING(1..)".to_string(),
                    found: "STRING(0)".to_string(),
                });
            }
            metas.push(ColMeta {
                tab_name: name.to_string(),
                name: col_name.to_string(),
                ty: *ty,
                offset,
                len,
            });
            offset += len;
        }
        let meta = TabMeta {
            name: name.to_string(),
            cols: metas,
            indexes: Vec::new(),
        };
        let heap = HeapFile::create(self.bpm.clone(), &format!("{name}.tab"), meta.record_size())?;
        self.tables.write().insert(
            name.to_string(),
            Arc::new(TableHandle {
                meta,
                heap: Arc::new(heap),
                indexes: Vec::new(),
            }),
        );
        Ok(())
    }

    /// Creates an index over the named columns and back-fills it from the
    /// table's current contents.
    pub fn create_index(
        &self,
        tab_name: &str,
        col_names: &[&str],
        order: Option<usize>,
        txn: &Transaction,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let handle = tables
            .get(tab_name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(tab_name.to_string()))?;

        let mut key_cols = Vec::with_capacity(col_names.len());
        for name in col_names {
            key_cols.push(handle.meta.get_col(name)?.clone());
        }
        let index_meta = IndexMeta::new(tab_name.to_string(), key_cols);
        let tree = BPlusTree::create(self.bpm.clone(), &index_meta.index_name(), &index_meta, order)?;

        let mut scan = handle.heap.scan()?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = handle.heap.get_for_undo(rid)?;
            tree.insert_entry(&index_meta.key_from_record(&record), rid, txn)?;
            scan.next()?;
        }

        let mut meta = handle.meta.clone();
        meta.indexes.push(index_meta);
        let mut indexes = handle.indexes.clone();
        indexes.push(Arc::new(tree));
        tables.insert(
            tab_name.to_string(),
            Arc::new(TableHandle {
                meta,
                heap: handle.heap.clone(),
                indexes,
            }),
        );
        Ok(())
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableHandle>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn begin(&self) -> Result<Arc<Transaction>> {
        let txn = self.txn_mgr.begin(None);
        self.log_mgr
            .lock()
            .append(&LogRecord::Begin { txn_id: txn.id() })?;
        Ok(txn)
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.txn_mgr.commit(txn, self)
    }

    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        self.txn_mgr.abort(txn, self)
    }

    /// Inserts a row: gap-lock check, exclusive row lock, heap write, index
    /// maintenance, undo record.
    pub fn insert(&self, tab_name: &str, values: &[Value], txn: &Arc<Transaction>) -> Result<Rid> {
        let table = self.table(tab_name)?;
        let record = encode_record(&table.meta.cols, values)?;
        if !self.lock_mgr.check_gap_lock(
            txn.id(),
            table.heap.file_id(),
            &table.meta.cols,
            &record,
        ) {
            return Err(DbError::lock_denied(txn.id()));
        }
        let ctx = Context {
            lock_mgr: &self.lock_mgr,
            txn,
        };
        let rid = table.heap.insert(&record, &ctx)?;
        for (meta, index) in table.index_pairs() {
            index.insert_entry(&meta.key_from_record(&record), rid, txn)?;
        }
        txn.append_write_record(WriteRecord::new(
            WriteType::InsertTuple,
            tab_name,
            rid,
            record.clone(),
        ));
        self.log_mgr.lock().append(&LogRecord::InsertTuple {
            txn_id: txn.id(),
            tab_name: tab_name.to_string(),
            rid,
            record,
        })?;
        Ok(rid)
    }

    /// Deletes a row, retracting its index keys and keeping the pre-image
    /// for undo.
    pub fn delete(&self, tab_name: &str, rid: Rid, txn: &Arc<Transaction>) -> Result<()> {
        let table = self.table(tab_name)?;
        let record = table.heap.get_for_undo(rid)?;
        if !self.lock_mgr.check_gap_lock(
            txn.id(),
            table.heap.file_id(),
            &table.meta.cols,
            &record,
        ) {
            return Err(DbError::lock_denied(txn.id()));
        }
        let ctx = Context {
            lock_mgr: &self.lock_mgr,
            txn,
        };
        table.heap.delete(rid, &ctx)?;
        for (meta, index) in table.index_pairs() {
            index.delete_entry(&meta.key_from_record(&record), txn)?;
        }
        txn.append_write_record(WriteRecord::new(
            WriteType::DeleteTuple,
            tab_name,
            rid,
            record.clone(),
        ));
        self.log_mgr.lock().append(&LogRecord::DeleteTuple {
            txn_id: txn.id(),
            tab_name: tab_name.to_string(),
            rid,
            record,
        })?;
        Ok(())
    }

    /// Updates a row in place: old index keys come out, the tuple is
    /// overwritten, new keys go in.
    pub fn update(
        &self,
        tab_name: &str,
        rid: Rid,
        values: &[Value],
        txn: &Arc<Transaction>,
    ) -> Result<()> {
        let table = self.table(tab_name)?;
        let old_record = table.heap.get_for_undo(rid)?;
        let new_record = encode_record(&table.meta.cols, values)?;
        let fd = table.heap.file_id();
        if !self
            .lock_mgr
            .check_gap_lock(txn.id(), fd, &table.meta.cols, &old_record)
            || !self
                .lock_mgr
                .check_gap_lock(txn.id(), fd, &table.meta.cols, &new_record)
        {
            return Err(DbError::lock_denied(txn.id()));
        }
        let ctx = Context {
            lock_mgr: &self.lock_mgr,
            txn,
        };
        for (meta, index) in table.index_pairs() {
            index.delete_entry(&meta.key_from_record(&old_record), txn)?;
        }
        table.heap.update(rid, &new_record, &ctx)?;
        for (meta, index) in table.index_pairs() {
            index.insert_entry(&meta.key_from_record(&new_record), rid, txn)?;
        }
        txn.append_write_record(WriteRecord::new(
            WriteType::UpdateTuple,
            tab_name,
            rid,
            old_record.clone(),
        ));
        self.log_mgr.lock().append(&LogRecord::UpdateTuple {
            txn_id: txn.id(),
            tab_name: tab_name.to_string(),
            rid,
            old_record,
            new_record,
        })?;
        Ok(())
    }

    /// Reads a row under a shared row lock and decodes it.
    pub fn get(&self, tab_name: &str, rid: Rid, txn: &Arc<Transaction>) -> Result<Vec<Value>> {
        let table = self.table(tab_name)?;
        let ctx = Context {
            lock_mgr: &self.lock_mgr,
            txn,
        };
        let record = table.heap.get(rid, &ctx)?;
        Ok(decode_record(&table.meta.cols, &record))
    }

    /// Registers next-key gap locks for a scan's predicates, one range per
    /// predicate column. Unconstrained columns contribute nothing (the
    /// empty cover).
    pub fn add_scan_gap_locks(
        &self,
        tab_name: &str,
        preds: &[Predicate],
        txn: &Arc<Transaction>,
    ) -> Result<()> {
        let table = self.table(tab_name)?;
        let fd = table.heap.file_id();
        for pred in preds {
            let col = table.meta.get_col(&pred.col)?;
            let matches_type = matches!(
                (&pred.value, col.ty),
                (Value::Int(_), ColType::Int)
                    | (Value::Float(_), ColType::Float)
                    | (Value::Str(_), ColType::Str)
            );
            if !matches_type {
                return Err(DbError::IncompatibleType {
                    expected: col.ty.name().to_string(),
                    found: pred.value.type_name().to_string(),
                });
            }
            let range = match pred.op {
                CmpOp::Eq => ValueRange::new(pred.value.clone(), pred.value.clone()),
                CmpOp::Ne => ValueRange::new(Value::Min, Value::Max),
                CmpOp::Lt | CmpOp::Le => ValueRange::new(Value::Min, pred.value.clone()),
                CmpOp::Gt | CmpOp::Ge => ValueRange::new(pred.value.clone(), Value::Max),
            };
            self.lock_mgr.add_gap_lock(txn.id(), fd, &col.name, range);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.create_table(
            "people",
            &[("id", ColType::Int, 0), ("name", ColType::Str, 8)],
        )
        .unwrap();
        (dir, db)
    }

    fn row(id: i32, name: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::Str(name.to_string())]
    }

    #[test]
    fn insert_commit_get_round_trips() {
        let (_dir, db) = open_db();
        let txn = db.begin().unwrap();
        let rid = db.insert("people", &row(1, "ada"), &txn).unwrap();
        db.commit(&txn).unwrap();

        let txn = db.begin().unwrap();
        assert_eq!(db.get("people", rid, &txn).unwrap(), row(1, "ada"));
        db.commit(&txn).unwrap();
    }

    #[test]
    fn update_maintains_indexes() {
        let (_dir, db) = open_db();
        let setup = db.begin().unwrap();
        db.create_index("people", &["id"], Some(4), &setup).unwrap();
        let rid = db.insert("people", &row(1, "ada"), &setup).unwrap();
        db.commit(&setup).unwrap();

        let txn = db.begin().unwrap();
        db.update("people", rid, &row(2, "bob"), &txn).unwrap();
        db.commit(&txn).unwrap();

        let table = db.table("people").unwrap();
        let index = &table.indexes[0];
        assert_eq!(index.get_value(&1i32.to_le_bytes()).unwrap(), None);
        assert_eq!(index.get_value(&2i32.to_le_bytes()).unwrap(), Some(rid));
    }

    #[test]
    fn create_index_backfills_existing_rows() {
        let (_dir, db) = open_db();
        let txn = db.begin().unwrap();
        let mut rids = Vec::new();
        for i in 0..10 {
            rids.push(db.insert("people", &row(i, "x"), &txn).unwrap());
        }
        db.create_index("people", &["id"], Some(4), &txn).unwrap();
        db.commit(&txn).unwrap();

        let table = db.table("people").unwrap();
        let index = &table.indexes[0];
        for (i, rid) in rids.iter().enumerate() {
            assert_eq!(
                index.get_value(&(i as i32).to_le_bytes()).unwrap(),
                Some(*rid)
            );
        }
    }

    #[test]
    fn unknown_table_and_column_are_reported() {
        let (_dir, db) = open_db();
        let txn = db.begin().unwrap();
        assert!(matches!(
            db.insert("ghosts", &row(1, "x"), &txn),
            Err(DbError::TableNotFound(_))
        ));
        assert!(matches!(
            db.add_scan_gap_locks(
                "people",
                &[Predicate {
                    col: "age".into(),
                    op: CmpOp::Eq,
                    value: Value::Int(1),
                }],
                &txn
            ),
            Err(DbError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn mistyped_predicate_is_incompatible() {
        let (_dir, db) = open_db();
        let txn = db.begin().unwrap();
        assert!(matches!(
            db.add_scan_gap_locks(
                "people",
                &[Predicate {
                    col: "id".into(),
                    op: CmpOp::Eq,
                    value: Value::Str("one".into()),
                }],
                &txn
            ),
            Err(DbError::IncompatibleType { .. })
        ));
    }

    #[test]
    fn gap_lock_blocks_insert_from_other_transaction() {
        let (_dir, db) = open_db();
        let scanner = db.begin().unwrap();
        db.add_scan_gap_locks(
            "people",
            &[Predicate {
                col: "id".into(),
                op: CmpOp::Eq,
                value: Value::Int(5),
            }],
            &scanner,
        )
        .unwrap();

        let writer = db.begin().unwrap();
        let err = db.insert("people", &row(5, "eve"), &writer).unwrap_err();
        assert!(matches!(err, DbError::TransactionAbort { .. }));
        db.abort(&writer).unwrap();

        // A non-conflicting insert still goes through.
        let writer2 = db.begin().unwrap();
        db.insert("people", &row(6, "sam"), &writer2).unwrap();
        db.commit(&writer2).unwrap();

        db.commit(&scanner).unwrap();
    }
}
