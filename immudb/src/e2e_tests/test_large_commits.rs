//! Commits near the chunk size.

use crate::storage::mmap::MB;
use crate::storage::{StorageError, TransactionError};
use crate::testing::{rec, reopen, temp_database};
use crate::tools::rebuild;

#[test]
fn test_segments_skip_to_the_next_chunk() {
    let (dir, db) = temp_database();
    let value = "z".repeat(100_000);
    for batch in 0..4 {
        let mut tx = db.update_transaction();
        for i in 0..3 {
            tx.add(1, rec(&[&format!("{batch}-{i}"), &value])).unwrap();
        }
        tx.commit().unwrap();
    }
    // 300 KB per commit: the fourth does not fit in the first chunk.
    assert!(db.data_store().end() > MB + 300_000);

    let db = reopen(&dir, db);
    assert_eq!(db.read_transaction().count(1).unwrap(), 12);
    drop(db);

    let report = rebuild(dir.path(), crate::testing::test_config()).unwrap();
    assert_eq!(report.commits, 4);
    assert_eq!(report.records, 12);
}

#[test]
fn test_commit_larger_than_a_chunk_fails_cleanly() {
    let (_dir, db) = temp_database();
    let value = "y".repeat(200_000);
    let mut tx = db.update_transaction();
    for i in 0..6 {
        tx.add(1, rec(&[&format!("{i}"), &value])).unwrap();
    }
    let err = tx.commit().unwrap_err();
    assert!(
        matches!(err, TransactionError::Storage(StorageError::TooLarge)),
        "{err}"
    );
    assert_eq!(db.data_store().end(), 0);
    assert_eq!(db.read_transaction().count(1).unwrap(), 0);

    let mut tx = db.update_transaction();
    tx.add(1, rec(&["small"])).unwrap();
    tx.commit().unwrap();
    assert_eq!(db.read_transaction().count(1).unwrap(), 1);
}
