//! Common helpers for end-to-end tests.

use std::collections::BTreeMap;

use rand::Rng;
use rand::rngs::StdRng;

use crate::storage::{Database, Record, TransactionError, UpdateTransaction};
use crate::testing::rec;

/// Expected contents: table number to field 0 to record.
pub type Model = BTreeMap<u16, BTreeMap<Vec<u8>, Record>>;

/// Assert that `db` holds exactly the records in `model`.
pub fn assert_matches(db: &Database, model: &Model) {
    let tx = db.read_transaction();
    for (tblnum, records) in model {
        let got = tx.range(*tblnum, &(..)).expect("range");
        let want: Vec<Record> = records.values().cloned().collect();
        assert_eq!(got, want, "table {tblnum}");
    }
    for tblnum in tx.tables() {
        if !model.contains_key(&tblnum) {
            assert_eq!(tx.count(tblnum).expect("count"), 0, "table {tblnum}");
        }
    }
}

/// Apply `ops` random adds, updates and removes to `tx` and `model`.
pub fn random_ops(tx: &mut UpdateTransaction, model: &mut Model, rng: &mut StdRng, ops: usize) {
    for _ in 0..ops {
        let tblnum = rng.random_range(1..=3u16);
        let table = model.entry(tblnum).or_default();
        let key = format!("key{:04}", rng.random_range(0..400u32));
        let value = format!("value{}", rng.random::<u32>());
        let exists = table.contains_key(key.as_bytes());
        match rng.random_range(0..10u32) {
            0..=5 if !exists => {
                let record = rec(&[&key, &value]);
                tx.add(tblnum, record.clone()).expect("add");
                table.insert(key.into_bytes(), record);
            }
            0..=5 => {
                let err = tx.add(tblnum, rec(&[&key])).unwrap_err();
                assert!(matches!(err, TransactionError::Btree(_)), "{err}");
            }
            6..=7 if exists => {
                let record = rec(&[&key, &value]);
                tx.update(tblnum, &rec(&[&key]), record.clone()).expect("update");
                table.insert(key.into_bytes(), record);
            }
            8..=9 if exists => {
                tx.remove(tblnum, &rec(&[&key])).expect("remove");
                table.remove(key.as_bytes());
            }
            _ => {
                let err = tx.remove(tblnum, &rec(&[&key])).unwrap_err();
                assert!(matches!(err, TransactionError::NotFound { .. }), "{err}");
            }
        }
    }
}
