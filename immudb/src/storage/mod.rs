//! Append-only storage engine.
//!
//! # Files
//!
//! A database directory holds two chunked, memory-mapped stores that are
//! only ever appended to:
//!
//! - `data.imdb`: the commit log. Each commit is one checksummed segment of
//!   add, update and remove entries. Data records live here and their
//!   addresses never change.
//! - `index.imdb`: B-tree nodes, redirection trie nodes and one index root
//!   per commit naming the current root of every tree.
//!
//! # Redirections
//!
//! Changing a leaf would normally mean rewriting every node up to the root.
//! Instead the new leaf is reached through a redirection from the old leaf's
//! address, kept in a persistent trie, and only nodes that really change
//! (a parent gaining a key on split) are rewritten.
//!
//! # Usage
//!
//! ```ignore
//! let db = Database::open_or_create(dir, DatabaseConfig::default())?;
//! let mut tx = db.update_transaction();
//! tx.add(1, Record::from_fields(["key", "value"]))?;
//! tx.commit()?;
//! ```

pub mod address;
pub mod btree;
pub mod commit;
pub mod database;
pub mod index_root;
pub mod intrefs;
pub mod io;
pub mod mmap;
pub mod processor;
pub mod record;
mod recovery;
pub mod redirects;
pub mod time;
pub mod transaction;
pub mod trie;

pub use address::{Address, Ref};
pub use commit::{CommitType, DataRecord};
pub use database::{CheckReport, DATA_FILE, Database, DatabaseError, INDEX_FILE};
pub use io::StorageError;
pub use mmap::{OpenMode, Storage};
pub use processor::{CommitHandler, CommitProcessor, LogSummary, ProcessError, Segment, process_log};
pub use record::{Record, RecordError};
pub use recovery::RecoveryReport;
pub use transaction::{CommitInfo, ReadTransaction, TransactionError, UpdateTransaction};
