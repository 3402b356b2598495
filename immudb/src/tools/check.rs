//! Consistency check of the data log.
//!
//! Every committed segment must pass its checksum, and every update or
//! remove must target a record that is live at that point: added by an
//! earlier commit and not yet replaced or removed.

use std::collections::HashSet;
use std::fmt;

use crate::storage::address::Address;
use crate::storage::commit::DataRecord;
use crate::storage::mmap::Storage;
use crate::storage::processor::{CommitHandler, ProcessError, process_log};

/// A problem found in a log that could still be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogIssue {
    /// An update entry in `commit` replaces a record that is not live.
    DanglingUpdate { commit: Address, target: Address },
    /// A remove entry in `commit` drops a record that is not live.
    DanglingRemove { commit: Address, target: Address },
    /// The log ends in an incomplete segment at `end`.
    TornTail { end: u64 },
}

impl fmt::Display for LogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanglingUpdate { commit, target } => {
                write!(f, "commit {commit} updates {target}, which is not live")
            }
            Self::DanglingRemove { commit, target } => {
                write!(f, "commit {commit} removes {target}, which is not live")
            }
            Self::TornTail { end } => write!(f, "incomplete commit at offset {end}"),
        }
    }
}

/// Result of [`check_log`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogCheck {
    pub committed: usize,
    pub aborted: usize,
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
    /// Records live after the last commit.
    pub live: usize,
    pub issues: Vec<LogIssue>,
}

impl LogCheck {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Default)]
struct Checker {
    live: HashSet<Address>,
    commit: Option<Address>,
    report: LogCheck,
}

impl Checker {
    fn commit(&self, at: Address) -> Address {
        self.commit.unwrap_or(at)
    }
}

impl CommitHandler for Checker {
    type Error = ProcessError;

    fn on_timestamp(&mut self, commit: Address, _: u32) -> Result<(), ProcessError> {
        self.commit = Some(commit);
        Ok(())
    }

    fn on_add(&mut self, adr: Address, _: DataRecord) -> Result<(), ProcessError> {
        self.report.adds += 1;
        self.live.insert(adr);
        Ok(())
    }

    fn on_update(
        &mut self,
        from_adr: Address,
        _: DataRecord,
        to_adr: Address,
        _: DataRecord,
    ) -> Result<(), ProcessError> {
        self.report.updates += 1;
        if !self.live.remove(&from_adr) {
            let commit = self.commit(to_adr);
            self.report.issues.push(LogIssue::DanglingUpdate {
                commit,
                target: from_adr,
            });
        }
        self.live.insert(to_adr);
        Ok(())
    }

    fn on_remove(&mut self, adr: Address, _: DataRecord) -> Result<(), ProcessError> {
        self.report.removes += 1;
        if !self.live.remove(&adr) {
            let commit = self.commit(adr);
            self.report
                .issues
                .push(LogIssue::DanglingRemove { commit, target: adr });
        }
        Ok(())
    }
}

/// Check the whole log.
pub fn check_log(stor: &Storage) -> Result<LogCheck, ProcessError> {
    check_log_until(stor, stor.end())
}

/// Check the log up to offset `until`.
pub fn check_log_until(stor: &Storage, until: u64) -> Result<LogCheck, ProcessError> {
    let mut checker = Checker::default();
    let summary = process_log(stor, 0, until, &mut checker)?;
    let mut report = checker.report;
    report.committed = summary.committed;
    report.aborted = summary.aborted;
    report.live = checker.live.len();
    if summary.truncated && summary.end < until {
        report.issues.push(LogIssue::TornTail { end: summary.end });
    }
    for issue in &report.issues {
        tracing::warn!(%issue, "log check");
    }
    Ok(report)
}
