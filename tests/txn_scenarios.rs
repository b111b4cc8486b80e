//! Transactional end-to-end scenarios: no-wait lock conflicts, phantom
//! avoidance through gap locks, and bitwise state restoration on abort.

use std::sync::Arc;
use std::thread;

use plinth::db::{CmpOp, Database, Predicate};
use plinth::errors::DbError;
use plinth::transaction::TxnState;
use plinth::types::{ColType, Value};
use serial_test::serial;
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
fn exclusive_conflict_aborts_second_writer_and_undo_removes_insert() {
    let (_dir, db) = open_db();

    // T1 inserts and keeps its exclusive row lock.
    let t1 = db.begin().unwrap();
    let rid = db.insert("people", &row(1, "ada"), &t1).unwrap();

    // T2 cannot take the same row exclusively under no-wait.
    let t2 = db.begin().unwrap();
    let err = db.delete("people", rid, &t2).unwrap_err();
    assert!(matches!(err, DbError::TransactionAbort { .. }));
    db.abort(&t2).unwrap();
    assert_eq!(t2.state(), TxnState::Aborted);

    // Undoing T1 removes the inserted record entirely.
    db.abort(&t1).unwrap();
    let table = db.table("people").unwrap();
    assert!(table.heap.scan().unwrap().is_end());
}

#[test]
fn gap_lock_conflict_forces_phantom_writer_to_abort() {
    let (_dir, db) = open_db();

    let seed = db.begin().unwrap();
    db.insert("people", &row(1, "ada"), &seed).unwrap();
    db.commit(&seed).unwrap();

    // T1 scans with predicate id = 5, taking a next-key gap lock.
    let t1 = db.begin().unwrap();
    db.add_scan_gap_locks(
        "people",
        &[Predicate {
            col: "id".into(),
            op: CmpOp::Eq,
            value: Value::Int(5),
        }],
        &t1,
    )
    .unwrap();

    // T2's insert of id = 5 intersects T1's range and must abort.
    let t2 = db.begin().unwrap();
    let err = db.insert("people", &row(5, "eve"), &t2).unwrap_err();
    assert!(matches!(err, DbError::TransactionAbort { .. }));
    db.abort(&t2).unwrap();

    // Once T1 terminates its gap locks vanish and the insert succeeds.
    db.commit(&t1).unwrap();
    let t3 = db.begin().unwrap();
    db.insert("people", &row(5, "eve"), &t3).unwrap();
    db.commit(&t3).unwrap();
}

#[test]
fn range_gap_locks_cover_open_intervals() {
    let (_dir, db) = open_db();

    // T1 scanned id > 10.
    let t1 = db.begin().unwrap();
    db.add_scan_gap_locks(
        "people",
        &[Predicate {
            col: "id".into(),
            op: CmpOp::Gt,
            value: Value::Int(10),
        }],
        &t1,
    )
    .unwrap();

    // Next-key semantics: the range covers the boundary value too.
    let t2 = db.begin().unwrap();
    assert!(db.insert("people", &row(11, "hi"), &t2).is_err());
    db.abort(&t2).unwrap();
    let t2 = db.begin().unwrap();
    assert!(db.insert("people", &row(10, "eq"), &t2).is_err());
    db.abort(&t2).unwrap();

    let t3 = db.begin().unwrap();
    db.insert("people", &row(9, "lo"), &t3).unwrap();
    db.commit(&t3).unwrap();
    db.commit(&t1).unwrap();
}

#[test]
fn abort_restores_tuples_and_index_keys_bitwise() {
    let (_dir, db) = open_db();

    let setup = db.begin().unwrap();
    db.create_index("people", &["id"], Some(4), &setup).unwrap();
    let mut rids = Vec::new();
    for i in 1..=5 {
        rids.push(db.insert("people", &row(i, "base"), &setup).unwrap());
    }
    db.commit(&setup).unwrap();

    let table = db.table("people").unwrap();
    let before: Vec<Vec<u8>> = rids
        .iter()
        .map(|r| table.heap.get_for_undo(*r).unwrap())
        .collect();

    // One transaction updates, deletes and inserts, then rolls back.
    let t1 = db.begin().unwrap();
    db.update("people", rids[1], &row(20, "upd"), &t1).unwrap();
    db.delete("people", rids[2], &t1).unwrap();
    let extra = db.insert("people", &row(6, "new"), &t1).unwrap();
    db.abort(&t1).unwrap();
    assert_eq!(t1.state(), TxnState::Aborted);

    // Tuples are bitwise identical to the pre-transaction state.
    for (rid, bytes) in rids.iter().zip(before.iter()) {
        assert_eq!(&table.heap.get_for_undo(*rid).unwrap(), bytes);
    }

    // Index state matches: original keys resolve, transient ones are gone.
    let index = &table.indexes[0];
    for (i, rid) in rids.iter().enumerate() {
        let k = (i as i32 + 1).to_le_bytes();
        assert_eq!(index.get_value(&k).unwrap(), Some(*rid));
    }
    assert_eq!(index.get_value(&20i32.to_le_bytes()).unwrap(), None);
    assert_eq!(index.get_value(&6i32.to_le_bytes()).unwrap(), None);

    // The transient insert's slot is free again.
    let mut live = 0;
    let mut scan = table.heap.scan().unwrap();
    while !scan.is_end() {
        assert_ne!(scan.rid(), extra);
        live += 1;
        scan.next().unwrap();
    }
    assert_eq!(live, 5);
}

#[test]
fn terminated_transactions_reject_further_termination() {
    let (_dir, db) = open_db();

    let t1 = db.begin().unwrap();
    db.commit(&t1).unwrap();
    assert!(matches!(
        db.abort(&t1),
        Err(DbError::InvalidTxnState { .. })
    ));
    assert_eq!(t1.state(), TxnState::Committed);

    let t2 = db.begin().unwrap();
    db.abort(&t2).unwrap();
    assert!(matches!(
        db.commit(&t2),
        Err(DbError::InvalidTxnState { .. })
    ));
    assert_eq!(t2.state(), TxnState::Aborted);
}

#[test]
#[serial]
fn concurrent_writers_on_disjoint_keys_both_commit() {
    let dir = tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path()).unwrap());
    db.create_table(
        "people",
        &[("id", ColType::Int, 0), ("name", ColType::Str, 8)],
    )
    .unwrap();
    let setup = db.begin().unwrap();
    db.create_index("people", &["id"], Some(4), &setup).unwrap();
    db.commit(&setup).unwrap();

    let mut handles = Vec::new();
    for t in 0..4 {
        let db = db.clone();
        handles.push(thread::spawn(move || {
            let txn = db.begin().unwrap();
            for i in 0..50 {
                let id = t * 1000 + i;
                db.insert("people", &row(id, "w"), &txn).unwrap();
            }
            db.commit(&txn).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let table = db.table("people").unwrap();
    let index = &table.indexes[0];
    let reader = db.begin().unwrap();
    for t in 0..4 {
        for i in 0..50 {
            let id: i32 = t * 1000 + i;
            let rid = index.get_value(&id.to_le_bytes()).unwrap().expect("key present");
            assert_eq!(db.get("people", rid, &reader).unwrap()[0], Value::Int(id));
        }
    }
    db.commit(&reader).unwrap();
}
