//! Bringing both stores back to a consistent state on open.
//!
//! The last valid index root describes the trees as of some commit and how
//! much of the data log they cover. Index bytes past that root belong to a
//! commit that never finished and are discarded. Committed segments past the
//! covered length were timestamped before the crash, so their changes are
//! replayed into the trees and a root is written for each. A torn segment at
//! the tail of the data log is discarded.

use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::storage::address::{Address, Ref};
use crate::storage::btree::BtreeError;
use crate::storage::commit::{CommitType, DataRecord};
use crate::storage::database::DatabaseError;
use crate::storage::index_root::IndexRoot;
use crate::storage::mmap::Storage;
use crate::storage::processor::{CommitHandler, process_log};
use crate::storage::transaction::{DbState, TxIndex, index_key};

/// What recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Bytes discarded from the end of the index store.
    pub index_discarded: u64,
    /// Committed segments applied to the trees.
    pub replayed: usize,
    /// Complete segments without a timestamp.
    pub aborted: usize,
    /// Bytes of torn segment discarded from the end of the data log.
    pub data_discarded: u64,
}

impl From<BtreeError> for DatabaseError {
    fn from(e: BtreeError) -> Self {
        Self::Transaction(e.into())
    }
}

struct Replay {
    index: TxIndex,
    timestamp: u32,
}

/// Applies committed segments to the trees, one index root per segment.
struct Replayer<'a> {
    index: &'a Arc<Storage>,
    max_keys: usize,
    state: DbState,
    current: Option<Replay>,
}

impl Replayer<'_> {
    fn tx(&mut self, adr: Address) -> Result<&mut TxIndex, DatabaseError> {
        self.current
            .as_mut()
            .map(|r| &mut r.index)
            .ok_or_else(|| DatabaseError::Corruption(format!("entry at {adr} outside a commit")))
    }

    fn remove(&mut self, from: Address, rec: &DataRecord) -> Result<(), DatabaseError> {
        let key = index_key(&rec.record);
        let tx = self.tx(from)?;
        let removed = tx
            .with_tree(rec.tblnum, false, |t| t.remove(&key))?
            .flatten();
        if removed != Some(Ref::Adr(from)) {
            return Err(DatabaseError::Corruption(format!(
                "log drops record {from} of table {} which the index does not hold",
                rec.tblnum
            )));
        }
        Ok(())
    }

    fn insert(&mut self, adr: Address, rec: &DataRecord) -> Result<(), DatabaseError> {
        let key = index_key(&rec.record);
        self.tx(adr)?
            .with_tree(rec.tblnum, true, |t| t.insert(key, Ref::Adr(adr)))?;
        Ok(())
    }
}

impl CommitHandler for Replayer<'_> {
    type Error = DatabaseError;

    fn on_timestamp(&mut self, _commit: Address, timestamp: u32) -> Result<(), DatabaseError> {
        self.current = Some(Replay {
            index: TxIndex::new(self.index, &self.state, self.max_keys),
            timestamp,
        });
        Ok(())
    }

    fn on_type(&mut self, kind: CommitType) -> Result<(), DatabaseError> {
        tracing::trace!(?kind, "replaying commit");
        Ok(())
    }

    fn on_add(&mut self, adr: Address, rec: DataRecord) -> Result<(), DatabaseError> {
        self.insert(adr, &rec)
    }

    fn on_update(
        &mut self,
        from_adr: Address,
        from: DataRecord,
        to_adr: Address,
        to: DataRecord,
    ) -> Result<(), DatabaseError> {
        let key = index_key(&to.record);
        if from.tblnum != to.tblnum || index_key(&from.record) != key {
            self.remove(from_adr, &from)?;
            return self.insert(to_adr, &to);
        }
        let prev = self
            .tx(to_adr)?
            .with_tree(to.tblnum, false, |t| t.update_data(&key, Ref::Adr(to_adr)))?
            .flatten();
        if prev != Some(Ref::Adr(from_adr)) {
            return Err(DatabaseError::Corruption(format!(
                "update at {to_adr} replaces {from_adr} which the index does not hold"
            )));
        }
        Ok(())
    }

    fn on_remove(&mut self, adr: Address, rec: DataRecord) -> Result<(), DatabaseError> {
        self.remove(adr, &rec)
    }

    fn on_after(&mut self, commit: Address, size: u32) -> Result<(), DatabaseError> {
        let Some(mut replay) = self.current.take() else {
            return Ok(());
        };
        replay.index.intrefs.start_store();
        let stored = replay.index.store()?;
        let data_size = commit.offset() + u64::from(size);
        let (root, state) = stored.finish(Some(commit), data_size, replay.timestamp);
        let adr = root.write(self.index)?;
        tracing::debug!(%commit, root = %adr, timestamp = replay.timestamp, "replayed commit");
        self.state = state;
        Ok(())
    }
}

/// Recover `data` and `index` and return the state to publish.
pub(crate) fn recover(
    data: &Arc<Storage>,
    index: &Arc<Storage>,
    config: &DatabaseConfig,
) -> Result<(DbState, RecoveryReport), DatabaseError> {
    let mut report = RecoveryReport::default();

    let index_end = index.end();
    let state = match IndexRoot::find_last(index)? {
        Some(found) => {
            if found.end < index_end {
                tracing::warn!(
                    valid = found.end,
                    end = index_end,
                    "discarding incomplete index changes"
                );
                index.truncate_tail(found.end)?;
                report.index_discarded = index_end - found.end;
            }
            DbState::from_root(index, &found.root)
        }
        None => {
            if index_end > 0 {
                tracing::warn!(end = index_end, "index store holds no valid root");
                index.truncate_tail(0)?;
                report.index_discarded = index_end;
            }
            DbState::default()
        }
    };

    let data_end = data.end();
    if state.data_size > data_end {
        return Err(DatabaseError::Corruption(format!(
            "index covers {} bytes of a {data_end} byte data log",
            state.data_size
        )));
    }
    if state.data_size == data_end {
        return Ok((state, report));
    }

    let from = state.data_size;
    let mut replayer = Replayer {
        index,
        max_keys: config.max_node_keys,
        state,
        current: None,
    };
    let summary = process_log(data, from, data_end, &mut replayer)?;
    report.replayed = summary.committed;
    report.aborted = summary.aborted;
    if summary.truncated && summary.end < data_end {
        tracing::warn!(
            valid = summary.end,
            end = data_end,
            "discarding torn commit at end of data log"
        );
        data.truncate_tail(summary.end)?;
        report.data_discarded = data_end - summary.end;
    }
    if report.replayed > 0 {
        index.sync()?;
        tracing::info!(
            replayed = report.replayed,
            aborted = report.aborted,
            "replayed commits missing from the index"
        );
    }
    Ok((replayer.state, report))
}
