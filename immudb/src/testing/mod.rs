//! Helpers shared by unit and scenario tests.

use std::sync::Arc;

use tempfile::{TempDir, tempdir};

use crate::config::DatabaseConfig;
use crate::storage::address::{Address, Ref};
use crate::storage::commit::{CommitBuilder, CommitType};
use crate::storage::mmap::{MB, Storage};
use crate::storage::record::Record;
use crate::storage::time::ManualTimeSource;
use crate::storage::transaction::TxIndex;
use crate::storage::Database;

/// Small chunks and nodes so tests split trees and cross chunk boundaries.
pub fn test_config() -> DatabaseConfig {
    DatabaseConfig {
        sync_on_commit: false,
        max_node_keys: 4,
        chunk_size: MB,
    }
}

/// A record of string fields.
pub fn rec(fields: &[&str]) -> Record {
    Record::from_fields(fields.iter().map(|f| f.as_bytes()))
}

/// A new database in a temporary directory that lives as long as the
/// returned guard.
pub fn temp_database() -> (TempDir, Database) {
    let dir = tempdir().expect("create temp dir");
    let db = Database::create(dir.path(), test_config()).expect("create database");
    (dir, db)
}

/// Like [`temp_database`], stamping commits from a manual clock.
pub fn temp_database_with_clock(start: u32) -> (TempDir, Database, Arc<ManualTimeSource>) {
    let dir = tempdir().expect("create temp dir");
    let clock = Arc::new(ManualTimeSource::new(start));
    let db = Database::open_with_clock(dir.path(), test_config(), Arc::clone(&clock) as _)
        .expect("create database");
    (dir, db, clock)
}

/// Close `db` and open it again, running recovery.
pub fn reopen(dir: &TempDir, db: Database) -> Database {
    drop(db);
    Database::open(dir.path(), test_config()).expect("reopen database")
}

/// Address of the data record currently stored under `key`.
pub fn record_address(db: &Database, tblnum: u16, key: &str) -> Address {
    let state = db.current();
    let index = TxIndex::new(db.index_store(), &state, db.config().max_node_keys);
    index
        .get(tblnum, &rec(&[key]))
        .expect("index lookup")
        .and_then(Ref::address)
        .expect("stored record")
}

fn build(adds: &[(u16, Record)], updates: &[(Address, u16, Record)]) -> CommitBuilder {
    let mut cb = CommitBuilder::new(CommitType::Update);
    for (tblnum, record) in adds {
        cb.add(*tblnum, record);
    }
    for (from, tblnum, record) in updates {
        cb.update(*from, *tblnum, record);
    }
    cb
}

/// Append a timestamped segment to the data log without touching the index,
/// as if the process died after the timestamp was written.
pub fn write_log_only_commit(
    db: &Database,
    adds: &[(u16, Record)],
    updates: &[(Address, u16, Record)],
    timestamp: u32,
) -> Address {
    let written = build(adds, updates)
        .write(db.data_store())
        .expect("write segment");
    written
        .finish(db.data_store(), timestamp)
        .expect("write timestamp");
    written.adr
}

/// Append a segment that never got its timestamp.
pub fn write_torn_commit(db: &Database, adds: &[(u16, Record)]) -> Address {
    build(adds, &[])
        .write(db.data_store())
        .expect("write segment")
        .adr
}

/// Append `n` bytes of non-zero junk, as left by a write cut short.
pub fn append_garbage(stor: &Storage, n: u64) {
    let adr = stor.alloc(n).expect("alloc");
    #[allow(clippy::cast_possible_truncation)]
    let len = n as usize;
    stor.write(adr, &vec![0xAB; len]).expect("write garbage");
}
