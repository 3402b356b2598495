//! Crashes simulated by cutting the store files back to what a commit in
//! progress would have left behind.

use std::fs::OpenOptions;
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::tempdir;

use super::helpers::{Model, assert_matches, random_ops};
use crate::storage::{DATA_FILE, Database, INDEX_FILE};
use crate::testing::{temp_database, test_config};

/// Store lengths and contents after one commit.
struct Point {
    data_end: u64,
    index_end: u64,
    model: Model,
}

fn copy_prefix(from: &Path, to: &Path, name: &str, len: u64) {
    std::fs::copy(from.join(name), to.join(name)).unwrap();
    let file = OpenOptions::new().write(true).open(to.join(name)).unwrap();
    file.set_len(len).unwrap();
}

fn history() -> (tempfile::TempDir, Vec<Point>) {
    let (dir, db) = temp_database();
    let mut rng = StdRng::seed_from_u64(99);
    let mut model = Model::new();
    let mut points = vec![Point {
        data_end: 0,
        index_end: 0,
        model: model.clone(),
    }];
    for _ in 0..6 {
        let mut tx = db.update_transaction();
        random_ops(&mut tx, &mut model, &mut rng, 30);
        tx.commit().unwrap();
        points.push(Point {
            data_end: db.data_store().end(),
            index_end: db.index_store().end(),
            model: model.clone(),
        });
    }
    drop(db);
    (dir, points)
}

#[test]
fn test_every_durable_prefix_recovers() {
    let (dir, points) = history();
    for (k, data_point) in points.iter().enumerate() {
        // The index may lag the data log by any number of commits.
        for index_point in &points[..=k] {
            let copy = tempdir().unwrap();
            copy_prefix(dir.path(), copy.path(), DATA_FILE, data_point.data_end);
            copy_prefix(dir.path(), copy.path(), INDEX_FILE, index_point.index_end);

            let db = Database::open(copy.path(), test_config()).unwrap();
            assert_matches(&db, &data_point.model);
            db.check().unwrap();
        }
    }
}

#[test]
fn test_torn_data_tail_loses_only_the_last_commit() {
    let (dir, points) = history();
    let last = points.len() - 1;
    let start = points[last - 1].data_end;
    let torn = start + (points[last].data_end - start) / 2 / 8 * 8;
    let copy = tempdir().unwrap();
    copy_prefix(dir.path(), copy.path(), DATA_FILE, torn);
    copy_prefix(dir.path(), copy.path(), INDEX_FILE, points[last - 1].index_end);

    let db = Database::open(copy.path(), test_config()).unwrap();
    assert!(db.recovery_report().data_discarded > 0);
    assert_matches(&db, &points[last - 1].model);
    assert_eq!(db.data_store().end(), start);
}

#[test]
fn test_nodes_without_root_are_discarded() {
    let (dir, points) = history();
    let last = points.len() - 1;
    // Data commit complete, index cut inside the last commit's nodes.
    let prev = points[last - 1].index_end;
    let cut = prev + (points[last].index_end - prev) / 2 / 8 * 8;
    let copy = tempdir().unwrap();
    copy_prefix(dir.path(), copy.path(), DATA_FILE, points[last].data_end);
    copy_prefix(dir.path(), copy.path(), INDEX_FILE, cut);

    let db = Database::open(copy.path(), test_config()).unwrap();
    let report = *db.recovery_report();
    assert_eq!(report.replayed, 1);
    assert!(report.index_discarded > 0 && report.index_discarded <= cut - prev);
    assert_matches(&db, &points[last].model);
}
