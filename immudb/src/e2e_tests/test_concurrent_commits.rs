//! Threads committing to the same table, retrying on conflict.

use std::thread;

use crate::storage::Database;
use crate::testing::{rec, temp_database};

const THREADS: usize = 4;
const PER_THREAD: usize = 25;

fn add_with_retry(db: &Database, key: &str) -> usize {
    for attempt in 1..=1000 {
        let mut tx = db.update_transaction();
        tx.add(1, rec(&[key])).unwrap();
        match tx.commit() {
            Ok(_) => return attempt,
            Err(e) if e.is_conflict() => {}
            Err(e) => panic!("commit failed: {e}"),
        }
    }
    panic!("no progress adding {key}");
}

#[test]
fn test_threads_make_progress() {
    let (_dir, db) = temp_database();
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let db = db.clone();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|i| add_with_retry(&db, &format!("t{t}-{i:02}")))
                    .sum::<usize>()
            })
        })
        .collect();
    let attempts: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(attempts >= THREADS * PER_THREAD);

    let tx = db.read_transaction();
    assert_eq!(tx.count(1).unwrap(), THREADS * PER_THREAD);
    db.check().unwrap();
}

#[test]
fn test_readers_run_alongside_writers() {
    let (_dir, db) = temp_database();
    let writer = {
        let db = db.clone();
        thread::spawn(move || {
            for i in 0..50 {
                add_with_retry(&db, &format!("{i:03}"));
            }
        })
    };
    let mut last = 0;
    while !writer.is_finished() {
        let n = db.read_transaction().count(1).unwrap();
        assert!(n >= last);
        last = n;
    }
    writer.join().unwrap();
    assert_eq!(db.read_transaction().count(1).unwrap(), 50);
}
