//! Administrative tools built on [`CommitProcessor`](crate::storage::CommitProcessor).

pub mod check;
pub mod compact;
pub mod dump;
pub mod rebuild;

use std::fmt;

use crate::storage::{DatabaseError, ProcessError, TransactionError};

pub use check::{LogCheck, LogIssue, check_log, check_log_until};
pub use compact::{CompactReport, compact};
pub use dump::dump;
pub use rebuild::{RebuildReport, rebuild};

/// Errors from running a tool.
#[derive(Debug)]
pub enum ToolError {
    Process(ProcessError),
    Database(DatabaseError),
    Io(std::io::Error),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(e) => write!(f, "{e}"),
            Self::Database(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Process(e) => Some(e),
            Self::Database(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<ProcessError> for ToolError {
    fn from(e: ProcessError) -> Self {
        Self::Process(e)
    }
}

impl From<DatabaseError> for ToolError {
    fn from(e: DatabaseError) -> Self {
        Self::Database(e)
    }
}

impl From<TransactionError> for ToolError {
    fn from(e: TransactionError) -> Self {
        Self::Database(e.into())
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
