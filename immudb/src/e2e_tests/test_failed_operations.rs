//! Transactions that keep going after an operation fails.

use crate::storage::btree::BtreeError;
use crate::storage::{Record, TransactionError};
use crate::testing::{rec, reopen, temp_database};

#[test]
fn test_commit_after_rejected_updates() {
    let (dir, db) = temp_database();
    let mut tx = db.update_transaction();
    for i in 0..20 {
        tx.add(1, rec(&[&format!("{i:02}"), "v0"])).unwrap();
    }
    tx.commit().unwrap();

    let mut tx = db.update_transaction();
    let big = Record::from_fields([vec![b'x'; 2000]]);
    let err = tx.update(1, &rec(&["03"]), big).unwrap_err();
    assert!(matches!(err, TransactionError::Btree(BtreeError::KeyTooLarge { .. })));
    let err = tx.update(1, &rec(&["04"]), rec(&["05", "taken"])).unwrap_err();
    assert!(matches!(err, TransactionError::Btree(BtreeError::DuplicateKey(_))));
    assert_eq!(tx.get(1, &rec(&["03"])).unwrap(), Some(rec(&["03", "v0"])));
    tx.update(1, &rec(&["06"]), rec(&["06", "v1"])).unwrap();
    tx.commit().unwrap();

    let report = db.check().unwrap();
    assert_eq!(report.records, 20);
    assert_eq!(report.log.updates, 1);

    let db = reopen(&dir, db);
    let tx = db.read_transaction();
    assert_eq!(tx.get(1, &rec(&["03"])).unwrap(), Some(rec(&["03", "v0"])));
    assert_eq!(tx.get(1, &rec(&["06"])).unwrap(), Some(rec(&["06", "v1"])));
    db.check().unwrap();
}

#[test]
fn test_rejected_add_does_not_create_table() {
    let (_dir, db) = temp_database();
    let mut tx = db.update_transaction();
    tx.add(1, rec(&["a"])).unwrap();
    let big = Record::from_fields([vec![b'y'; 1500]]);
    assert!(tx.add(2, big).is_err());
    tx.commit().unwrap();

    assert_eq!(db.read_transaction().tables(), vec![1]);
    assert_eq!(db.check().unwrap().tables, 1);
}
