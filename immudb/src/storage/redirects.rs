//! Node redirections.
//!
//! Updating a stored node of a copy-on-write tree would normally mean
//! rewriting every ancestor up to the root. Instead the old node address is
//! redirected to the new node and readers follow the redirection. The set of
//! redirections is a [`PersistentTrie`] so that each transaction can work on
//! its own copy and commits can be merged cheaply.

use std::fmt;
use std::sync::Arc;

use crate::storage::address::{Address, Ref};
use crate::storage::io::StorageError;
use crate::storage::mmap::Storage;
use crate::storage::trie::PersistentTrie;

/// Two transactions redirected the same node to different places.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub from: Address,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "concurrent modification of index node {}", self.from)
    }
}

impl std::error::Error for Conflict {}

/// Errors from [`Redirects::merge`].
#[derive(Debug)]
pub enum MergeError {
    Conflict(Conflict),
    Storage(StorageError),
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(c) => write!(f, "{c}"),
            Self::Storage(e) => write!(f, "storage error during merge: {e}"),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Conflict(c) => Some(c),
            Self::Storage(e) => Some(e),
        }
    }
}

impl From<StorageError> for MergeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// A transaction's working set of redirections.
#[derive(Debug, Clone)]
pub struct Redirects {
    original: PersistentTrie,
    redirs: PersistentTrie,
}

impl Redirects {
    /// Start from the committed snapshot `redirs`.
    #[must_use]
    pub fn new(redirs: PersistentTrie) -> Self {
        Self {
            original: redirs.clone(),
            redirs,
        }
    }

    /// Where `from` currently lives, following chained redirections.
    /// Unredirected refs map to themselves.
    pub fn get(&self, from: Ref) -> Result<Ref, StorageError> {
        let mut cur = from;
        while let Ref::Adr(adr) = cur {
            match self.redirs.get(adr.raw())? {
                None => break,
                Some(Ref::Adr(next)) if next <= adr => {
                    return Err(StorageError::Corruption(format!(
                        "redirect from {adr} to earlier {next}"
                    )));
                }
                Some(next) => cur = next,
            }
        }
        Ok(cur)
    }

    /// Redirect the stored node at `from` to `to`.
    ///
    /// # Panics
    ///
    /// Panics if `from` is an intref; only stored nodes are redirected.
    pub fn put(&mut self, from: Ref, to: Ref) -> Result<(), StorageError> {
        let from = from.expect_address("redirect");
        self.redirs = self.redirs.with(from.raw(), to)?;
        Ok(())
    }

    /// Redirect `from` and every address its chain passes through to `to`.
    ///
    /// A node copied into a transaction is then reached in one step from any
    /// pointer to it, and a concurrent copy of the same node conflicts on
    /// every link.
    pub fn put_chain(&mut self, from: Ref, to: Ref) -> Result<(), StorageError> {
        let mut links = Vec::new();
        let mut cur = from;
        while let Ref::Adr(adr) = cur {
            links.push(adr);
            match self.redirs.get(adr.raw())? {
                None => break,
                Some(Ref::Adr(next)) if next <= adr => {
                    return Err(StorageError::Corruption(format!(
                        "redirect from {adr} to earlier {next}"
                    )));
                }
                Some(next) => cur = next,
            }
        }
        for adr in links {
            self.redirs = self.redirs.with(adr.raw(), to)?;
        }
        Ok(())
    }

    /// True if this transaction added redirections.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        !self.redirs.same_root(&self.original)
    }

    /// Fold this transaction's redirections into `current`, the latest
    /// committed set.
    ///
    /// Fails with a [`Conflict`] if a node this transaction redirected was
    /// redirected somewhere else by a commit since the snapshot was taken.
    pub fn merge(&mut self, current: &PersistentTrie) -> Result<(), MergeError> {
        if current.same_root(&self.original) {
            return Ok(());
        }

        let mut merged = current.clone();
        let original = &self.original;
        let mut conflict = None;
        self.redirs.traverse_changes(original, |key, mine| {
            if conflict.is_some() {
                return Ok(());
            }
            let theirs = current.get(key)?;
            if theirs != original.get(key)? && theirs != Some(mine) {
                conflict = Address::from_raw(key).map(|from| Conflict { from });
                return Ok(());
            }
            merged = merged.with(key, mine)?;
            Ok(())
        })?;
        if let Some(c) = conflict {
            tracing::warn!(from = %c.from, "redirect merge conflict");
            return Err(MergeError::Conflict(c));
        }

        self.redirs = merged;
        self.original = current.clone();
        Ok(())
    }

    /// Persist the working set, returning its root address.
    pub fn store<F>(
        &mut self,
        stor: &Arc<Storage>,
        translate: F,
    ) -> Result<Option<Address>, StorageError>
    where
        F: Fn(Ref) -> Address,
    {
        let (root, stored) = self.redirs.store(stor, translate)?;
        self.redirs = stored;
        Ok(root)
    }

    #[must_use]
    pub const fn trie(&self) -> &PersistentTrie {
        &self.redirs
    }
}
