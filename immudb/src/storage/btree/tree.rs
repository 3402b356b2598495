//! Copy-on-write B-tree operations.
//!
//! A [`Btree`] walks nodes through a [`NodeSource`] and changes them through
//! a [`NodeStore`]. The store decides how a stored node becomes writable: a
//! transaction copies it into its intref table and redirects the old address
//! to the copy, so parents never need rewriting unless they change too.
//!
//! Keys are unique. Nodes split when they exceed the configured maximum
//! number of keys; a root split adds a level. Removal never merges nodes.

use std::borrow::Cow;
use std::fmt;
use std::ops::{Bound, RangeBounds};

use crate::storage::address::Ref;
use crate::storage::btree::node::{MAX_KEY_SIZE, NodeError, NodeKey, NodeKind, TreeNode};
use crate::storage::io::StorageError;
use crate::storage::record::Record;

/// Default maximum keys per node.
pub const DEFAULT_MAX_NODE_KEYS: usize = 64;

/// Root and height of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeInfo {
    pub root: Ref,
    /// Level of the root; 0 when the root is a leaf.
    pub levels: u8,
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BtreeError {
    /// Node decoding error.
    Node(NodeError),
    /// Storage error.
    Storage(StorageError),
    /// Key already present.
    DuplicateKey(Record),
    /// Key exceeds [`MAX_KEY_SIZE`].
    KeyTooLarge { len: usize },
    /// Structural inconsistency found while walking the tree.
    Corrupt(String),
}

impl fmt::Display for BtreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::DuplicateKey(key) => write!(f, "duplicate key {key:?}"),
            Self::KeyTooLarge { len } => {
                write!(f, "key of {len} bytes exceeds maximum of {MAX_KEY_SIZE}")
            }
            Self::Corrupt(msg) => write!(f, "corrupt tree: {msg}"),
        }
    }
}

impl std::error::Error for BtreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Node(e) => Some(e),
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NodeError> for BtreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<StorageError> for BtreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Read access to nodes.
pub trait NodeSource {
    /// The node `ptr` refers to, after following redirects.
    fn node(&self, ptr: Ref, level: u8) -> Result<Cow<'_, TreeNode>, BtreeError>;
}

/// Write access to nodes.
pub trait NodeStore: NodeSource {
    /// Make the node `ptr` refers to writable, returning the intref of the
    /// writable copy.
    fn modify(&mut self, ptr: Ref, level: u8) -> Result<Ref, BtreeError>;

    /// A writable node previously returned by `modify` or `add_node`.
    fn node_mut(&mut self, r: Ref) -> &mut TreeNode;

    /// Register a new node.
    fn add_node(&mut self, node: TreeNode) -> Ref;
}

impl<T: NodeSource + ?Sized> NodeSource for &T {
    fn node(&self, ptr: Ref, level: u8) -> Result<Cow<'_, TreeNode>, BtreeError> {
        (**self).node(ptr, level)
    }
}

impl<T: NodeSource + ?Sized> NodeSource for &mut T {
    fn node(&self, ptr: Ref, level: u8) -> Result<Cow<'_, TreeNode>, BtreeError> {
        (**self).node(ptr, level)
    }
}

impl<T: NodeStore + ?Sized> NodeStore for &mut T {
    fn modify(&mut self, ptr: Ref, level: u8) -> Result<Ref, BtreeError> {
        (**self).modify(ptr, level)
    }

    fn node_mut(&mut self, r: Ref) -> &mut TreeNode {
        (**self).node_mut(r)
    }

    fn add_node(&mut self, node: TreeNode) -> Ref {
        (**self).add_node(node)
    }
}

/// One B-tree, viewed through a node source.
pub struct Btree<S> {
    src: S,
    info: TreeInfo,
    max_keys: usize,
}

impl<S: NodeSource> Btree<S> {
    /// # Panics
    ///
    /// Panics if `max_keys` is less than 4.
    pub fn new(src: S, info: TreeInfo, max_keys: usize) -> Self {
        assert!(max_keys >= 4, "max_keys must be at least 4");
        Self {
            src,
            info,
            max_keys,
        }
    }

    /// Current root and height, reflecting any root splits.
    #[must_use]
    pub const fn info(&self) -> TreeInfo {
        self.info
    }

    fn child(node: &TreeNode, i: usize) -> Result<Ref, BtreeError> {
        node.keys
            .get(i)
            .and_then(|k| k.child)
            .ok_or_else(|| BtreeError::Corrupt("interior key without child".to_string()))
    }

    /// Pointers to the interior nodes on the path to `key`'s leaf, and the
    /// leaf pointer itself.
    fn descend(&self, key: &Record) -> Result<(Vec<Ref>, Ref), BtreeError> {
        let mut path = Vec::with_capacity(usize::from(self.info.levels));
        let mut ptr = self.info.root;
        for level in (1..=self.info.levels).rev() {
            let node = self.src.node(ptr, level)?;
            let i = node.search(key).ok_or_else(|| {
                BtreeError::Corrupt(format!("interior node at level {level} has no minimal key"))
            })?;
            let child = Self::child(&node, i)?;
            path.push(ptr);
            ptr = child;
        }
        Ok((path, ptr))
    }

    /// The data reference for `key`.
    pub fn get(&self, key: &Record) -> Result<Option<Ref>, BtreeError> {
        let (_, leaf) = self.descend(key)?;
        let node = self.src.node(leaf, 0)?;
        Ok(node.find(key).ok().and_then(|i| node.keys[i].data))
    }

    /// Keys within `range` with their data references, in key order.
    pub fn range<R>(&self, range: &R) -> Result<Vec<(Record, Ref)>, BtreeError>
    where
        R: RangeBounds<Record>,
    {
        let mut out = Vec::new();
        self.scan(self.info.root, self.info.levels, range, &mut out)?;
        Ok(out)
    }

    fn scan<R: RangeBounds<Record>>(
        &self,
        ptr: Ref,
        level: u8,
        range: &R,
        out: &mut Vec<(Record, Ref)>,
    ) -> Result<(), BtreeError> {
        let node = self.src.node(ptr, level)?;
        if node.is_leaf() {
            for k in &node.keys {
                if let Some(data) = k.data.filter(|_| range.contains(&k.key)) {
                    out.push((k.key.clone(), data));
                }
            }
            return Ok(());
        }
        for (i, k) in node.keys.iter().enumerate() {
            let below_end = match range.end_bound() {
                Bound::Included(end) => k.key <= *end,
                Bound::Excluded(end) => k.key < *end,
                Bound::Unbounded => true,
            };
            if !below_end {
                break;
            }
            let before_start = match (range.start_bound(), node.keys.get(i + 1)) {
                (Bound::Included(start) | Bound::Excluded(start), Some(next)) => next.key <= *start,
                _ => false,
            };
            if before_start {
                continue;
            }
            self.scan(Self::child(&node, i)?, level - 1, range, out)?;
        }
        Ok(())
    }

    /// Number of keys.
    pub fn count(&self) -> Result<usize, BtreeError> {
        self.range(&(..)).map(|v| v.len())
    }

    /// Verify ordering, separator bounds and levels. Returns the number of
    /// keys.
    pub fn check(&self) -> Result<usize, BtreeError> {
        self.check_node(self.info.root, self.info.levels, None, None)
    }

    fn check_node(
        &self,
        ptr: Ref,
        level: u8,
        lo: Option<&Record>,
        hi: Option<&Record>,
    ) -> Result<usize, BtreeError> {
        let node = self.src.node(ptr, level)?;
        if node.kind != NodeKind::at_level(level) {
            return Err(BtreeError::Corrupt(format!("node {ptr:?} has wrong level")));
        }
        for pair in node.keys.windows(2) {
            if pair[0].key >= pair[1].key {
                return Err(BtreeError::Corrupt(format!("keys out of order in {ptr:?}")));
            }
        }
        let first = if node.is_leaf() { 0 } else { 1 };
        for k in node.keys.iter().skip(first) {
            if lo.is_some_and(|lo| k.key < *lo) || hi.is_some_and(|hi| k.key >= *hi) {
                return Err(BtreeError::Corrupt(format!(
                    "key {:?} outside separator bounds in {ptr:?}",
                    k.key
                )));
            }
        }
        if node.is_leaf() {
            if node.keys.iter().any(|k| k.data.is_none()) {
                return Err(BtreeError::Corrupt(format!("leaf key without data in {ptr:?}")));
            }
            return Ok(node.keys.len());
        }

        if node.keys.first().is_none_or(|k| !k.key.is_empty()) {
            return Err(BtreeError::Corrupt(format!("interior {ptr:?} has no minimal key")));
        }
        let mut count = 0;
        for i in 0..node.keys.len() {
            let child_lo = if i == 0 { lo } else { Some(&node.keys[i].key) };
            let child_hi = node.keys.get(i + 1).map(|k| &k.key).or(hi);
            count += self.check_node(Self::child(&node, i)?, level - 1, child_lo, child_hi)?;
        }
        Ok(count)
    }
}

/// Fails if `key` is too large to be stored in a node.
pub fn check_key(key: &Record) -> Result<(), BtreeError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(BtreeError::KeyTooLarge { len: key.len() });
    }
    Ok(())
}

impl<S: NodeStore> Btree<S> {
    /// Add `key` with its data reference.
    pub fn insert(&mut self, key: Record, data: Ref) -> Result<(), BtreeError> {
        check_key(&key)?;
        let (mut path, leaf) = self.descend(&key)?;
        let pos = match self.src.node(leaf, 0)?.find(&key) {
            Ok(_) => return Err(BtreeError::DuplicateKey(key)),
            Err(pos) => pos,
        };

        let leaf = self.src.modify(leaf, 0)?;
        let node = self.src.node_mut(leaf);
        node.keys.insert(pos, NodeKey::leaf(key, data));
        node.resolved = false;
        if node.keys.len() <= self.max_keys {
            return Ok(());
        }

        let (mut sep, mut right) = self.split(leaf);
        let mut level = 1;
        while let Some(parent) = path.pop() {
            let parent = self.src.modify(parent, level)?;
            let node = self.src.node_mut(parent);
            let pos = node.search(&sep).map_or(0, |i| i + 1);
            node.keys.insert(pos, NodeKey::interior(sep, right));
            node.resolved = false;
            if node.keys.len() <= self.max_keys {
                return Ok(());
            }
            (sep, right) = self.split(parent);
            level += 1;
        }

        let root = TreeNode {
            kind: NodeKind::Interior { level },
            keys: vec![
                NodeKey::interior(Record::empty(), self.info.root),
                NodeKey::interior(sep, right),
            ],
            resolved: false,
        };
        self.info.root = self.src.add_node(root);
        self.info.levels = level;
        tracing::trace!(levels = level, "split root");
        Ok(())
    }

    /// Move the upper half of writable node `r` into a new node. Returns
    /// the separator and the new node.
    fn split(&mut self, r: Ref) -> (Record, Ref) {
        let node = self.src.node_mut(r);
        let mid = node.keys.len() / 2;
        let mut keys = node.keys.split_off(mid);
        let sep = keys[0].key.clone();
        if !node.is_leaf() {
            keys[0].key = Record::empty();
        }
        let right = TreeNode {
            kind: node.kind,
            keys,
            resolved: false,
        };
        (sep, self.src.add_node(right))
    }

    /// Remove `key`, returning its data reference.
    pub fn remove(&mut self, key: &Record) -> Result<Option<Ref>, BtreeError> {
        let (_, leaf) = self.descend(key)?;
        let Ok(pos) = self.src.node(leaf, 0)?.find(key) else {
            return Ok(None);
        };
        let leaf = self.src.modify(leaf, 0)?;
        let node = self.src.node_mut(leaf);
        node.resolved = false;
        Ok(node.keys.remove(pos).data)
    }

    /// Point `key` at a new data record, returning the previous reference.
    pub fn update_data(&mut self, key: &Record, data: Ref) -> Result<Option<Ref>, BtreeError> {
        let (_, leaf) = self.descend(key)?;
        let Ok(pos) = self.src.node(leaf, 0)?.find(key) else {
            return Ok(None);
        };
        let leaf = self.src.modify(leaf, 0)?;
        let node = self.src.node_mut(leaf);
        node.resolved = false;
        Ok(node.keys[pos].data.replace(data))
    }
}
