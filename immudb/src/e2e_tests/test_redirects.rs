//! Leaf changes reach readers through redirections instead of rewritten
//! ancestors.

use crate::storage::index_root::IndexRoot;
use crate::testing::{rec, reopen, temp_database};

fn root_of(db: &crate::storage::Database, tblnum: u16) -> IndexRoot {
    let found = IndexRoot::find_last(db.index_store()).unwrap().unwrap();
    assert!(found.root.table(tblnum).is_some());
    found.root
}

#[test]
fn test_leaf_change_keeps_tree_root() {
    let (_dir, db) = temp_database();
    let mut tx = db.update_transaction();
    for i in 0..200 {
        tx.add(1, rec(&[&format!("{i:03}"), "v"])).unwrap();
    }
    tx.commit().unwrap();
    let before = root_of(&db, 1);
    assert!(before.table(1).unwrap().levels >= 2);
    assert_eq!(before.redirects, None);

    let mut tx = db.update_transaction();
    tx.update(1, &rec(&["123"]), rec(&["123", "changed"])).unwrap();
    tx.commit().unwrap();
    let after = root_of(&db, 1);
    assert_eq!(after.table(1), before.table(1));
    assert!(after.redirects.is_some());
    assert_eq!(
        db.read_transaction().get(1, &rec(&["123"])).unwrap(),
        Some(rec(&["123", "changed"]))
    );
}

#[test]
fn test_reads_follow_repeated_redirections() {
    let (dir, db) = temp_database();
    let mut tx = db.update_transaction();
    for i in 0..64 {
        tx.add(1, rec(&[&format!("{i:02}")])).unwrap();
    }
    tx.commit().unwrap();

    for round in 0..20 {
        let mut tx = db.update_transaction();
        tx.update(1, &rec(&["40"]), rec(&["40", &format!("{round}")])).unwrap();
        tx.commit().unwrap();
        assert_eq!(
            db.read_transaction().get(1, &rec(&["40"])).unwrap(),
            Some(rec(&["40", &format!("{round}")]))
        );
    }
    let db = reopen(&dir, db);
    let tx = db.read_transaction();
    assert_eq!(tx.get(1, &rec(&["40"])).unwrap(), Some(rec(&["40", "19"])));
    assert_eq!(tx.count(1).unwrap(), 64);
    db.check().unwrap();
}

#[test]
fn test_splits_below_redirected_nodes() {
    let (dir, db) = temp_database();
    let mut tx = db.update_transaction();
    for i in (0..1000).step_by(100) {
        tx.add(1, rec(&[&format!("{i:04}")])).unwrap();
    }
    tx.commit().unwrap();

    // Fill the gaps one commit at a time so leaves split under parents that
    // were stored in earlier commits.
    for i in 1..100 {
        let mut tx = db.update_transaction();
        tx.add(1, rec(&[&format!("{:04}", 500 + i)])).unwrap();
        tx.add(1, rec(&[&format!("{i:04}")])).unwrap();
        tx.commit().unwrap();
    }
    let tx = db.read_transaction();
    let keys: Vec<_> = tx
        .range(1, &(..))
        .unwrap()
        .iter()
        .map(|r| r.field(0).to_vec())
        .collect();
    assert_eq!(keys.len(), 10 + 2 * 99);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    db.check().unwrap();

    let db = reopen(&dir, db);
    assert_eq!(db.check().unwrap().records, 208);
}
