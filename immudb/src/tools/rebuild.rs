//! Rebuild the index store from the data log.

use std::path::Path;

use crate::config::DatabaseConfig;
use crate::storage::database::{DATA_FILE, INDEX_FILE};
use crate::storage::{Database, DatabaseError, StorageError};
use crate::tools::ToolError;

/// Result of [`rebuild`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildReport {
    pub commits: usize,
    pub tables: usize,
    pub records: usize,
}

/// Discard `index.imdb` in `dir` and replay every commit into a new one.
pub fn rebuild(dir: &Path, config: DatabaseConfig) -> Result<RebuildReport, ToolError> {
    if !dir.join(DATA_FILE).exists() {
        return Err(DatabaseError::NotFound(dir.to_path_buf()).into());
    }
    let index = dir.join(INDEX_FILE);
    if index.exists() {
        std::fs::remove_file(&index).map_err(StorageError::from).map_err(DatabaseError::from)?;
        tracing::info!(path = %index.display(), "removed index");
    }

    let db = Database::open(dir, config)?;
    db.sync()?;
    let report = db.check()?;
    let out = RebuildReport {
        commits: db.recovery_report().replayed,
        tables: report.tables,
        records: report.records,
    };
    tracing::info!(
        commits = out.commits,
        tables = out.tables,
        records = out.records,
        "rebuilt index"
    );
    Ok(out)
}
