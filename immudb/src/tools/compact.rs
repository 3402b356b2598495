//! Copy the live records of a database into a new one.
//!
//! The new data log holds no replaced or removed records and the new index
//! no redirections. Records are loaded with bulk commits, each kept well
//! below the chunk size.

use std::path::Path;

use crate::config::DatabaseConfig;
use crate::storage::database::DATA_FILE;
use crate::storage::{Database, DatabaseError};
use crate::tools::ToolError;

/// Result of [`compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactReport {
    pub tables: usize,
    pub records: usize,
    pub commits: usize,
    pub src_bytes: u64,
    pub dst_bytes: u64,
}

/// Data bytes per bulk commit, as a fraction of the chunk size.
const BATCH_DIVISOR: u64 = 4;

/// Space a record takes in a segment beyond its own length.
const ENTRY_OVERHEAD: u64 = 16;

/// Copy every live record of the database in `src` into a new database in
/// `dst`.
pub fn compact(src: &Path, dst: &Path, config: DatabaseConfig) -> Result<CompactReport, ToolError> {
    if dst.join(DATA_FILE).exists() {
        return Err(DatabaseError::AlreadyExists(dst.to_path_buf()).into());
    }
    let from = Database::open(src, config)?;
    let to = Database::create(dst, config)?;
    let batch_limit = config.chunk_size / BATCH_DIVISOR;

    let snapshot = from.read_transaction();
    let mut report = CompactReport {
        tables: 0,
        records: 0,
        commits: 0,
        src_bytes: from.data_store().end() + from.index_store().end(),
        dst_bytes: 0,
    };
    let mut tx = to.bulk_transaction();
    let mut pending = 0;
    for tblnum in snapshot.tables() {
        let records = snapshot.range(tblnum, &(..))?;
        if records.is_empty() {
            continue;
        }
        report.tables += 1;
        for record in records {
            let size = record.len() as u64 + ENTRY_OVERHEAD;
            if pending > 0 && pending + size > batch_limit {
                tx.commit()?;
                report.commits += 1;
                tx = to.bulk_transaction();
                pending = 0;
            }
            tx.add(tblnum, record)?;
            pending += size;
            report.records += 1;
        }
    }
    if tx.commit()?.is_some() {
        report.commits += 1;
    }
    to.sync()?;
    report.dst_bytes = to.data_store().end() + to.index_store().end();

    tracing::info!(
        src = %src.display(),
        dst = %dst.display(),
        tables = report.tables,
        records = report.records,
        commits = report.commits,
        src_bytes = report.src_bytes,
        dst_bytes = report.dst_bytes,
        "compacted database"
    );
    Ok(report)
}
