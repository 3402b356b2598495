//! Dump, check, rebuild and compact on one database.

use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::tempdir;

use super::helpers::{Model, assert_matches, random_ops};
use crate::storage::Database;
use crate::testing::test_config;
use crate::tools::{check_log, compact, dump, rebuild};

#[test]
fn test_tools_agree_on_one_history() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let db = Database::create(&src, test_config()).unwrap();
    let mut rng = StdRng::seed_from_u64(2024);
    let mut model = Model::new();
    for _ in 0..15 {
        let mut tx = db.update_transaction();
        random_ops(&mut tx, &mut model, &mut rng, 40);
        tx.commit().unwrap();
    }
    let live: usize = model.values().map(std::collections::BTreeMap::len).sum();

    let log = check_log(db.data_store()).unwrap();
    assert!(log.is_ok(), "{:?}", log.issues);
    assert_eq!(log.committed, 15);
    assert_eq!(log.live, live);

    let mut out = Vec::new();
    let summary = dump(db.data_store(), &mut out).unwrap();
    assert_eq!(summary.committed, 15);
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.matches(" type=u").count(), 15);
    drop(db);

    let rebuilt = rebuild(&src, test_config()).unwrap();
    assert_eq!(rebuilt.records, live);
    let db = Database::open(&src, test_config()).unwrap();
    assert_matches(&db, &model);
    drop(db);

    let compacted = compact(&src, &dst, test_config()).unwrap();
    assert_eq!(compacted.records, live);
    let db = Database::open(&dst, test_config()).unwrap();
    assert_matches(&db, &model);
    let log = check_log(db.data_store()).unwrap();
    assert_eq!((log.adds, log.updates, log.removes), (live, 0, 0));
}
