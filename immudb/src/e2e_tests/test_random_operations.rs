//! Random operations checked against an in-memory model.

use rand::SeedableRng;
use rand::rngs::StdRng;

use super::helpers::{Model, assert_matches, random_ops};
use crate::testing::{reopen, temp_database};

#[test]
fn test_random_operations_match_model() {
    let (dir, mut db) = temp_database();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model = Model::new();

    for round in 0..40 {
        let mut tx = db.update_transaction();
        random_ops(&mut tx, &mut model, &mut rng, 25);
        tx.commit().expect("commit");
        assert_matches(&db, &model);
        if round % 10 == 9 {
            db = reopen(&dir, db);
            assert_matches(&db, &model);
        }
    }
    let report = db.check().expect("check");
    let total: usize = model.values().map(std::collections::BTreeMap::len).sum();
    assert_eq!(report.records, total);
}

#[test]
fn test_aborted_transactions_leave_no_trace() {
    let (dir, db) = temp_database();
    let mut rng = StdRng::seed_from_u64(7);
    let mut model = Model::new();

    let mut tx = db.update_transaction();
    random_ops(&mut tx, &mut model, &mut rng, 100);
    tx.commit().expect("commit");
    let data_end = db.data_store().end();

    for _ in 0..5 {
        let mut scratch = model.clone();
        let mut tx = db.update_transaction();
        random_ops(&mut tx, &mut scratch, &mut rng, 50);
        tx.abort();
    }
    assert_eq!(db.data_store().end(), data_end);
    assert_matches(&db, &model);
    let db = reopen(&dir, db);
    assert_matches(&db, &model);
}
