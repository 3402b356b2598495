//! High-level database interface.
//!
//! A database is a directory holding two stores: the data log
//! (`data.imdb`), an append-only sequence of commit segments, and the index
//! (`index.imdb`), holding tree nodes, redirection trie nodes and one index
//! root per commit.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::{ConfigError, DatabaseConfig};
use crate::storage::commit::CommitType;
use crate::storage::io::StorageError;
use crate::storage::mmap::{OpenMode, Storage};
use crate::storage::processor::ProcessError;
use crate::storage::recovery::{self, RecoveryReport};
use crate::storage::time::{SystemTimeSource, TimeSource};
use crate::storage::transaction::{DbState, ReadTransaction, TransactionError, UpdateTransaction};
use crate::tools::check::{LogCheck, check_log_until};

/// File name of the data log.
pub const DATA_FILE: &str = "data.imdb";

/// File name of the index store.
pub const INDEX_FILE: &str = "index.imdb";

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    dir: PathBuf,
    config: DatabaseConfig,
    data: Arc<Storage>,
    index: Arc<Storage>,
    state: RwLock<Arc<DbState>>,
    commit_lock: Mutex<()>,
    clock: Arc<dyn TimeSource>,
    recovery: RecoveryReport,
}

/// A database instance.
///
/// Cloning is cheap; clones share the open stores. Any number of
/// transactions may run at once from any thread. Commits are serialized.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Create a new database in `dir`, creating the directory if needed.
    ///
    /// Fails if `dir` already holds a data log.
    pub fn create(dir: &Path, config: DatabaseConfig) -> Result<Self, DatabaseError> {
        if dir.join(DATA_FILE).exists() {
            return Err(DatabaseError::AlreadyExists(dir.to_path_buf()));
        }
        std::fs::create_dir_all(dir).map_err(StorageError::from)?;
        Self::open_with_clock(dir, config, Arc::new(SystemTimeSource))
    }

    /// Open an existing database, recovering from an interrupted commit.
    pub fn open(dir: &Path, config: DatabaseConfig) -> Result<Self, DatabaseError> {
        if !dir.join(DATA_FILE).exists() {
            return Err(DatabaseError::NotFound(dir.to_path_buf()));
        }
        Self::open_with_clock(dir, config, Arc::new(SystemTimeSource))
    }

    /// Open an existing database or create a new one if it doesn't exist.
    pub fn open_or_create(dir: &Path, config: DatabaseConfig) -> Result<Self, DatabaseError> {
        if dir.join(DATA_FILE).exists() {
            Self::open(dir, config)
        } else {
            Self::create(dir, config)
        }
    }

    /// Open or create, stamping commits from `clock`.
    pub fn open_with_clock(
        dir: &Path,
        config: DatabaseConfig,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, DatabaseError> {
        config.validate()?;
        std::fs::create_dir_all(dir).map_err(StorageError::from)?;
        let data = Arc::new(Storage::open_with(
            &dir.join(DATA_FILE),
            OpenMode::ReadWrite,
            config.chunk_size,
        )?);
        let index = Arc::new(Storage::open_with(
            &dir.join(INDEX_FILE),
            OpenMode::ReadWrite,
            config.chunk_size,
        )?);
        let (state, report) = recovery::recover(&data, &index, &config)?;
        tracing::info!(
            dir = %dir.display(),
            tables = state.tables.len(),
            timestamp = state.timestamp,
            data_size = state.data_size,
            replayed = report.replayed,
            "opened database"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                config,
                data,
                index,
                state: RwLock::new(Arc::new(state)),
                commit_lock: Mutex::new(()),
                clock,
                recovery: report,
            }),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// What recovery did when the database was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.inner.recovery
    }

    /// Timestamp of the last commit, 0 for a new database.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        self.current().timestamp
    }

    #[must_use]
    pub fn read_transaction(&self) -> ReadTransaction {
        ReadTransaction::new(self.clone())
    }

    #[must_use]
    pub fn update_transaction(&self) -> UpdateTransaction {
        UpdateTransaction::new(self.clone(), CommitType::Update)
    }

    /// An update transaction written as a bulk load commit.
    #[must_use]
    pub fn bulk_transaction(&self) -> UpdateTransaction {
        UpdateTransaction::new(self.clone(), CommitType::Bulk)
    }

    /// An update transaction written as a schema change commit.
    #[must_use]
    pub fn schema_transaction(&self) -> UpdateTransaction {
        UpdateTransaction::new(self.clone(), CommitType::Schema)
    }

    /// Flush both stores. Only needed when commits do not sync.
    pub fn sync(&self) -> Result<(), DatabaseError> {
        self.inner.data.sync()?;
        self.inner.index.sync()?;
        Ok(())
    }

    /// Verify the data log and every tree against it.
    pub fn check(&self) -> Result<CheckReport, DatabaseError> {
        let tx = self.read_transaction();
        let log = check_log_until(&self.inner.data, tx.data_size())?;
        if let Some(issue) = log.issues.first() {
            return Err(DatabaseError::Corruption(issue.to_string()));
        }
        let tables = tx.tables().len();
        let records = tx.check()?;
        if records != log.live {
            return Err(DatabaseError::Corruption(format!(
                "index holds {records} records, log has {} live",
                log.live
            )));
        }
        tracing::info!(tables, records, commits = log.committed, "check passed");
        Ok(CheckReport { tables, records, log })
    }

    pub(crate) fn current(&self) -> Arc<DbState> {
        let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&state)
    }

    pub(crate) fn publish(&self, state: DbState) {
        let mut current = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(state);
    }

    pub(crate) fn commit_lock(&self) -> &Mutex<()> {
        &self.inner.commit_lock
    }

    pub(crate) fn clock(&self) -> &dyn TimeSource {
        self.inner.clock.as_ref()
    }

    #[must_use]
    pub fn data_store(&self) -> &Arc<Storage> {
        &self.inner.data
    }

    #[must_use]
    pub fn index_store(&self) -> &Arc<Storage> {
        &self.inner.index
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.inner.dir)
            .field("timestamp", &self.timestamp())
            .finish_non_exhaustive()
    }
}

/// Result of [`Database::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub tables: usize,
    pub records: usize,
    pub log: LogCheck,
}

/// Errors that can occur during database operations.
#[derive(Debug)]
pub enum DatabaseError {
    Storage(StorageError),
    Config(ConfigError),
    /// The data log could not be replayed.
    Process(ProcessError),
    Transaction(TransactionError),
    AlreadyExists(PathBuf),
    NotFound(PathBuf),
    /// The stores disagree with each other.
    Corruption(String),
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Process(e) => write!(f, "log error: {e}"),
            Self::Transaction(e) => write!(f, "transaction error: {e}"),
            Self::AlreadyExists(dir) => write!(f, "database already exists: {}", dir.display()),
            Self::NotFound(dir) => write!(f, "no database in {}", dir.display()),
            Self::Corruption(msg) => write!(f, "database corrupt: {msg}"),
        }
    }
}

impl std::error::Error for DatabaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Process(e) => Some(e),
            Self::Transaction(e) => Some(e),
            Self::AlreadyExists(_) | Self::NotFound(_) | Self::Corruption(_) => None,
        }
    }
}

impl From<StorageError> for DatabaseError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConfigError> for DatabaseError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ProcessError> for DatabaseError {
    fn from(e: ProcessError) -> Self {
        Self::Process(e)
    }
}

impl From<TransactionError> for DatabaseError {
    fn from(e: TransactionError) -> Self {
        Self::Transaction(e)
    }
}
