//! B-tree node types and serialization.
//!
//! A stored node is a [`Record`] whose fields are key records, one per key.
//! Each key record is the key's own fields followed by the data reference
//! (4 bytes, or empty for none) and, in interior nodes, the child pointer
//! (4 bytes). The level of a node is not stored; it is known from the path
//! used to reach it.
//!
//! In an interior node `keys[0]` always holds the empty (minimal) key, so
//! every search key finds a child.

use std::borrow::Cow;
use std::fmt;

use crate::storage::address::{Address, Ref};
use crate::storage::intrefs::IntRefs;
use crate::storage::io::StorageError;
use crate::storage::mmap::Storage;
use crate::storage::record::{Record, RecordError};
use crate::storage::redirects::Redirects;

/// Maximum encoded size of a key.
pub const MAX_KEY_SIZE: usize = 1024;

/// Upper bound on the space one key takes in a stored node: the key, its
/// two references and the offsets of both records.
pub const MAX_NODE_KEY_SIZE: usize = 2 * MAX_KEY_SIZE + 32;

/// Errors when decoding a node.
#[derive(Debug)]
pub enum NodeError {
    /// Record format error.
    Record(RecordError),
    /// Reference field is neither empty nor 4 bytes.
    BadRef { at: Address },
    /// Interior node key is missing its child pointer.
    MissingChild { at: Address },
    /// Storage error while reading the node.
    Storage(StorageError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record(e) => write!(f, "bad node record: {e}"),
            Self::BadRef { at } => write!(f, "bad reference in node at {at}"),
            Self::MissingChild { at } => write!(f, "interior node at {at} missing child pointer"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Record(e) => Some(e),
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RecordError> for NodeError {
    fn from(e: RecordError) -> Self {
        Self::Record(e)
    }
}

impl From<StorageError> for NodeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Leaf or interior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    /// `level` is at least 1; its children are at `level - 1`.
    Interior { level: u8 },
}

impl NodeKind {
    #[must_use]
    pub const fn at_level(level: u8) -> Self {
        if level == 0 {
            Self::Leaf
        } else {
            Self::Interior { level }
        }
    }

    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::Leaf => 0,
            Self::Interior { level } => level,
        }
    }
}

/// One key of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeKey {
    pub key: Record,
    /// Data record, for leaf keys.
    pub data: Option<Ref>,
    /// Child node, for interior keys.
    pub child: Option<Ref>,
}

impl NodeKey {
    #[must_use]
    pub const fn leaf(key: Record, data: Ref) -> Self {
        Self {
            key,
            data: Some(data),
            child: None,
        }
    }

    #[must_use]
    pub const fn interior(key: Record, child: Ref) -> Self {
        Self {
            key,
            data: None,
            child: Some(child),
        }
    }

    fn encode(&self, interior: bool) -> Record {
        let data = ref_bytes(self.data);
        let child = ref_bytes(self.child);
        let mut fields: Vec<&[u8]> = self.key.fields().collect();
        fields.push(&data);
        if interior {
            fields.push(&child);
        }
        Record::from_fields(fields)
    }

    fn decode(rec: &Record, interior: bool, at: Address) -> Result<Self, NodeError> {
        let n = rec.count();
        let tail = if interior { 2 } else { 1 };
        if n < tail {
            return Err(NodeError::MissingChild { at });
        }
        let data = decode_ref(rec.field(n - tail), at)?;
        let child = if interior {
            Some(decode_ref(rec.field(n - 1), at)?.ok_or(NodeError::MissingChild { at })?)
        } else {
            None
        };
        Ok(Self {
            key: rec.prefix(n - tail),
            data,
            child,
        })
    }
}

fn ref_bytes(r: Option<Ref>) -> Vec<u8> {
    match r {
        None => Vec::new(),
        Some(r) => r.expect_address("node encode").raw().to_be_bytes().to_vec(),
    }
}

fn decode_ref(field: &[u8], at: Address) -> Result<Option<Ref>, NodeError> {
    match field.len() {
        0 => Ok(None),
        4 => {
            let raw = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
            Address::from_raw(raw)
                .map(|adr| Some(Ref::Adr(adr)))
                .ok_or(NodeError::BadRef { at })
        }
        _ => Err(NodeError::BadRef { at }),
    }
}

/// A B-tree node, either decoded from the store or built in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub kind: NodeKind,
    pub keys: Vec<NodeKey>,
    /// True while the node is unchanged from its stored form, so every
    /// reference in it is an address.
    pub resolved: bool,
}

impl TreeNode {
    #[must_use]
    pub const fn empty_leaf() -> Self {
        Self {
            kind: NodeKind::Leaf,
            keys: Vec::new(),
            resolved: false,
        }
    }

    #[must_use]
    pub const fn level(&self) -> u8 {
        self.kind.level()
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf)
    }

    /// Read the node stored at `adr`.
    pub fn read(stor: &Storage, adr: Address, level: u8) -> Result<Self, NodeError> {
        Self::decode(stor.buffer(adr)?, NodeKind::at_level(level), adr)
    }

    /// Decode a node from the start of `buf`.
    pub fn decode(buf: &[u8], kind: NodeKind, at: Address) -> Result<Self, NodeError> {
        let rec = Record::decode(buf)?;
        let interior = !matches!(kind, NodeKind::Leaf);
        let keys = rec
            .fields()
            .map(|field| NodeKey::decode(&Record::decode(field)?, interior, at))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            kind,
            keys,
            resolved: true,
        })
    }

    /// Encode the node. Every reference must be an address.
    #[must_use]
    pub fn encode(&self) -> Record {
        let interior = !self.is_leaf();
        let keys: Vec<Record> = self.keys.iter().map(|k| k.encode(interior)).collect();
        Record::from_fields(keys.iter().map(Record::as_bytes))
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.encode().len()
    }

    /// Position of the last key less than or equal to `key`.
    ///
    /// For an interior node this is the child to descend into. `None` means
    /// every key is greater (only possible in a leaf).
    #[must_use]
    pub fn search(&self, key: &Record) -> Option<usize> {
        self.keys
            .partition_point(|k| k.key <= *key)
            .checked_sub(1)
    }

    /// Position of `key` in a leaf, or where it would be inserted.
    pub fn find(&self, key: &Record) -> Result<usize, usize> {
        self.keys.binary_search_by(|k| k.key.cmp(key))
    }

    /// Resolve every reference to its final address. Child pointers go
    /// through `redirects` first; data references point into the data log,
    /// which redirections never cover. Both then go through `intrefs` for
    /// transaction-local objects. A resolved node holds no intrefs, so only
    /// its child pointers can change.
    ///
    /// Keys whose references do not change are borrowed unchanged.
    ///
    /// # Panics
    ///
    /// Panics if a reference is an intref with no recorded address, which
    /// means a child was not stored before its parent.
    pub fn translate<'a, T>(
        &'a self,
        redirects: &Redirects,
        intrefs: &IntRefs<T>,
    ) -> Result<Vec<Cow<'a, NodeKey>>, StorageError> {
        let mut out = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            let data = if self.resolved {
                key.data
            } else {
                key.data.map(|d| Ref::Adr(intrefs.resolve(d)))
            };
            let child = key
                .child
                .map(|c| translate_ref(c, redirects, intrefs))
                .transpose()?;
            if data == key.data && child == key.child {
                out.push(Cow::Borrowed(key));
            } else {
                out.push(Cow::Owned(NodeKey {
                    key: key.key.clone(),
                    data,
                    child,
                }));
            }
        }
        Ok(out)
    }

    /// Translate, encode, allocate and write the node.
    pub fn store<T>(
        &self,
        stor: &Storage,
        redirects: &Redirects,
        intrefs: &IntRefs<T>,
    ) -> Result<Address, StorageError> {
        let keys = self.translate(redirects, intrefs)?;
        let node = Self {
            kind: self.kind,
            keys: keys.into_iter().map(Cow::into_owned).collect(),
            resolved: true,
        };
        let rec = node.encode();
        let adr = stor.alloc(rec.len() as u64)?;
        stor.write(adr, rec.as_bytes())?;
        Ok(adr)
    }
}

fn translate_ref<T>(
    r: Ref,
    redirects: &Redirects,
    intrefs: &IntRefs<T>,
) -> Result<Ref, StorageError> {
    let r = redirects.get(r)?;
    Ok(Ref::Adr(intrefs.resolve(r)))
}
