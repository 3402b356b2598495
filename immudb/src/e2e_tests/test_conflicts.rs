//! Concurrent transactions from the same snapshot.

use crate::storage::TransactionError;
use crate::testing::{rec, temp_database};

fn seeded(n: usize) -> (tempfile::TempDir, crate::storage::Database) {
    let (dir, db) = temp_database();
    let mut tx = db.update_transaction();
    for i in 0..n {
        tx.add(1, rec(&[&format!("{i:03}"), "v0"])).unwrap();
    }
    tx.commit().unwrap();
    (dir, db)
}

#[test]
fn test_changes_to_different_leaves_merge() {
    let (_dir, db) = seeded(100);
    let mut a = db.update_transaction();
    let mut b = db.update_transaction();
    a.update(1, &rec(&["000"]), rec(&["000", "a"])).unwrap();
    b.update(1, &rec(&["099"]), rec(&["099", "b"])).unwrap();
    a.commit().unwrap();
    b.commit().unwrap();

    let tx = db.read_transaction();
    assert_eq!(tx.get(1, &rec(&["000"])).unwrap(), Some(rec(&["000", "a"])));
    assert_eq!(tx.get(1, &rec(&["099"])).unwrap(), Some(rec(&["099", "b"])));
    assert_eq!(tx.count(1).unwrap(), 100);
    db.check().unwrap();
}

#[test]
fn test_changes_to_the_same_leaf_conflict() {
    let (_dir, db) = seeded(100);
    let mut a = db.update_transaction();
    let mut b = db.update_transaction();
    a.update(1, &rec(&["050"]), rec(&["050", "a"])).unwrap();
    b.update(1, &rec(&["050"]), rec(&["050", "b"])).unwrap();
    a.commit().unwrap();
    let err = b.commit().unwrap_err();
    assert!(matches!(err, TransactionError::Conflict(_)), "{err}");
    assert!(err.is_conflict());

    // The loser retries from a fresh snapshot.
    let mut b = db.update_transaction();
    b.update(1, &rec(&["050"]), rec(&["050", "b"])).unwrap();
    b.commit().unwrap();
    assert_eq!(
        db.read_transaction().get(1, &rec(&["050"])).unwrap(),
        Some(rec(&["050", "b"]))
    );
    db.check().unwrap();
}

#[test]
fn test_concurrent_root_splits_conflict() {
    // A single full leaf is the root.
    let (_dir, db) = seeded(4);
    let mut a = db.update_transaction();
    let mut b = db.update_transaction();
    a.add(1, rec(&["100"])).unwrap();
    b.add(1, rec(&["200"])).unwrap();
    a.commit().unwrap();
    let err = b.commit().unwrap_err();
    assert!(
        matches!(err, TransactionError::TableConflict { tblnum: 1 }),
        "{err}"
    );
    assert_eq!(db.read_transaction().count(1).unwrap(), 5);
}

#[test]
fn test_concurrent_table_creation_conflicts() {
    let (_dir, db) = seeded(1);
    let mut a = db.update_transaction();
    let mut b = db.update_transaction();
    a.add(9, rec(&["x"])).unwrap();
    b.add(9, rec(&["y"])).unwrap();
    a.commit().unwrap();
    let err = b.commit().unwrap_err();
    assert!(matches!(err, TransactionError::TableConflict { tblnum: 9 }), "{err}");
}

#[test]
fn test_different_tables_do_not_conflict() {
    let (_dir, db) = seeded(1);
    let mut a = db.update_transaction();
    let mut b = db.update_transaction();
    a.add(2, rec(&["x"])).unwrap();
    b.add(3, rec(&["y"])).unwrap();
    a.commit().unwrap();
    b.commit().unwrap();
    let tx = db.read_transaction();
    assert_eq!(tx.tables(), vec![1, 2, 3]);
    db.check().unwrap();
}

#[test]
fn test_read_only_snapshot_is_unaffected_by_later_commits() {
    let (_dir, db) = seeded(100);
    let snapshot = db.read_transaction();
    for round in 0..5 {
        let mut tx = db.update_transaction();
        for i in (0..100).step_by(7) {
            let key = format!("{i:03}");
            tx.update(1, &rec(&[&key]), rec(&[&key, &format!("r{round}")])).unwrap();
        }
        tx.commit().unwrap();
    }
    let old = snapshot.range(1, &(..)).unwrap();
    assert_eq!(old.len(), 100);
    assert!(old.iter().all(|r| r.field(1) == b"v0"));
    assert_eq!(
        db.read_transaction().get(1, &rec(&["007"])).unwrap(),
        Some(rec(&["007", "r4"]))
    );
}
