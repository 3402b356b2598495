// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! Append-only, memory-mapped storage for an embedded database.
//!
//! Records are appended to a commit log and indexed by copy-on-write
//! B-trees. A crash at any point leaves a prefix of the commits, which is
//! brought back on the next open.

pub mod config;
pub mod storage;
pub mod tools;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod testing;

pub use config::{DatabaseConfig, StoreConfig};
pub use storage::{
    Database, DatabaseError, ReadTransaction, Record, TransactionError, UpdateTransaction,
};
