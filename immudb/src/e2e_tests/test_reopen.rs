//! Commits survive closing and reopening.

use crate::storage::index_root::IndexRoot;
use crate::testing::{rec, reopen, temp_database, temp_database_with_clock, test_config};
use crate::storage::Database;

#[test]
fn test_commit_then_reopen() {
    let (dir, db) = temp_database();
    let mut tx = db.update_transaction();
    for i in 0..200 {
        tx.add(1, rec(&[&format!("{i:05}"), "payload"])).unwrap();
    }
    tx.commit().unwrap();

    let db = reopen(&dir, db);
    let tx = db.read_transaction();
    assert_eq!(tx.count(1).unwrap(), 200);
    assert_eq!(
        tx.get(1, &rec(&["00137"])).unwrap(),
        Some(rec(&["00137", "payload"]))
    );
    let range = tx.range(1, &(rec(&["00010"])..=rec(&["00012"]))).unwrap();
    assert_eq!(range.len(), 3);
}

#[test]
fn test_timestamps_increase_even_when_clock_goes_back() {
    let (dir, db, clock) = temp_database_with_clock(5000);
    let mut stamps = Vec::new();
    for i in 0..5 {
        if i == 3 {
            clock.set(10);
        }
        let mut tx = db.update_transaction();
        tx.add(1, rec(&[&format!("{i}")])).unwrap();
        stamps.push(tx.commit().unwrap().unwrap().timestamp);
    }
    assert_eq!(stamps, vec![5000, 5001, 5002, 5003, 5004]);

    let last = IndexRoot::find_last(db.index_store()).unwrap().unwrap();
    assert_eq!(last.root.timestamp, 5004);
    let db = reopen(&dir, db);
    assert_eq!(db.timestamp(), 5004);
}

#[test]
fn test_many_small_commits() {
    let (dir, db) = temp_database();
    for i in 0..100 {
        let mut tx = db.update_transaction();
        tx.add(2, rec(&[&format!("{i:03}")])).unwrap();
        if i > 0 {
            tx.update(2, &rec(&[&format!("{:03}", i - 1)]), rec(&[&format!("{:03}", i - 1), "seen"]))
                .unwrap();
        }
        tx.commit().unwrap();
    }
    drop(db);
    let db = Database::open(dir.path(), test_config()).unwrap();
    let tx = db.read_transaction();
    assert_eq!(tx.count(2).unwrap(), 100);
    assert_eq!(tx.get(2, &rec(&["050"])).unwrap(), Some(rec(&["050", "seen"])));
    assert_eq!(tx.get(2, &rec(&["099"])).unwrap(), Some(rec(&["099"])));
    db.check().unwrap();
}
