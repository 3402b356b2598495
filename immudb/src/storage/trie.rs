//! Persistent (immutable, structurally shared) radix trie keyed by `u32`.
//!
//! Each level consumes 5 bits of the key, low bits first, so a node has up to
//! 32 slots. An entry lives at the shallowest level where its key prefix is
//! unique; a collision pushes both entries one level down. [`PersistentTrie::with`]
//! copies only the nodes on the path to the change, so any previously held
//! trie is unaffected.
//!
//! Nodes are either in memory or stored. A stored node is decoded from the
//! store each time it is visited.
//!
//! ```text
//! [bitmap u32][entry_bits u32] then per set bitmap bit, ascending:
//!     entry: [key u32][value u32]
//!     child: [adr u32][0 u32]
//! ```

use std::sync::Arc;

use crate::storage::address::{Address, Ref};
use crate::storage::io::{StorageError, get_u32};
use crate::storage::mmap::Storage;

const BITS: u32 = 5;
const MASK: u32 = (1 << BITS) - 1;
const HEADER: usize = 8;
const SLOT: usize = 8;

#[derive(Clone)]
enum NodeRef {
    Mem(Arc<Node>),
    Stored(Address),
}

impl NodeRef {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Mem(a), Self::Mem(b)) => Arc::ptr_eq(a, b),
            (Self::Stored(a), Self::Stored(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Clone)]
enum Slot {
    Entry { key: u32, value: Ref },
    Child(NodeRef),
}

#[derive(Clone, Default)]
struct Node {
    bitmap: u32,
    entry_bits: u32,
    slots: Vec<Slot>,
}

impl Node {
    fn pos(&self, bit: u32) -> usize {
        (self.bitmap & ((1 << bit) - 1)).count_ones() as usize
    }

    fn slot(&self, bit: u32) -> Option<&Slot> {
        if self.bitmap & (1 << bit) == 0 {
            None
        } else {
            self.slots.get(self.pos(bit))
        }
    }

    fn set(&mut self, bit: u32, slot: Slot) {
        let pos = self.pos(bit);
        match slot {
            Slot::Entry { .. } => self.entry_bits |= 1 << bit,
            Slot::Child(_) => self.entry_bits &= !(1 << bit),
        }
        if self.bitmap & (1 << bit) == 0 {
            self.bitmap |= 1 << bit;
            self.slots.insert(pos, slot);
        } else {
            self.slots[pos] = slot;
        }
    }

    fn decode(buf: &[u8], adr: Address) -> Result<Self, StorageError> {
        let corrupt = || StorageError::Corruption(format!("bad trie node at {adr}"));
        let bitmap = get_u32(buf, 0).ok_or_else(corrupt)?;
        let entry_bits = get_u32(buf, 4).ok_or_else(corrupt)?;
        if entry_bits & !bitmap != 0 || bitmap == 0 {
            return Err(corrupt());
        }
        let mut slots = Vec::with_capacity(bitmap.count_ones() as usize);
        for bit in 0..32 {
            if bitmap & (1 << bit) == 0 {
                continue;
            }
            let at = HEADER + slots.len() * SLOT;
            let a = get_u32(buf, at).ok_or_else(corrupt)?;
            let b = get_u32(buf, at + 4).ok_or_else(corrupt)?;
            let slot = if entry_bits & (1 << bit) == 0 {
                Slot::Child(NodeRef::Stored(Address::from_raw(a).ok_or_else(corrupt)?))
            } else {
                Slot::Entry {
                    key: a,
                    value: Ref::Adr(Address::from_raw(b).ok_or_else(corrupt)?),
                }
            };
            slots.push(slot);
        }
        Ok(Self {
            bitmap,
            entry_bits,
            slots,
        })
    }

    fn encoded_len(&self) -> usize {
        HEADER + self.slots.len() * SLOT
    }
}

/// Immutable map from `u32` keys to [`Ref`] values.
#[derive(Clone, Default)]
pub struct PersistentTrie {
    root: Option<NodeRef>,
    stor: Option<Arc<Storage>>,
}

impl PersistentTrie {
    /// An empty in-memory trie.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A trie whose root is stored at `root` (or empty if `None`).
    #[must_use]
    pub fn load(stor: Arc<Storage>, root: Option<Address>) -> Self {
        Self {
            root: root.map(NodeRef::Stored),
            stor: Some(stor),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// True if both tries have the identical root (not merely equal content).
    #[must_use]
    pub fn same_root(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same(b),
            _ => false,
        }
    }

    /// The root address, if the whole trie is stored.
    #[must_use]
    pub fn stored_root(&self) -> Option<Address> {
        match &self.root {
            Some(NodeRef::Stored(adr)) => Some(*adr),
            _ => None,
        }
    }

    fn node(&self, r: &NodeRef) -> Result<Arc<Node>, StorageError> {
        match r {
            NodeRef::Mem(node) => Ok(Arc::clone(node)),
            NodeRef::Stored(adr) => {
                let stor = self.stor.as_ref().ok_or_else(|| {
                    StorageError::Corruption(format!("trie node {adr} without a store"))
                })?;
                Ok(Arc::new(Node::decode(stor.buffer(*adr)?, *adr)?))
            }
        }
    }

    /// Look up `key`.
    pub fn get(&self, key: u32) -> Result<Option<Ref>, StorageError> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        let mut node = self.node(root)?;
        let mut shift = 0;
        loop {
            let bit = (key >> shift) & MASK;
            let next = match node.slot(bit) {
                None => return Ok(None),
                Some(Slot::Entry { key: k, value }) => {
                    return Ok((*k == key).then_some(*value));
                }
                Some(Slot::Child(child)) => self.node(child)?,
            };
            node = next;
            shift += BITS;
        }
    }

    /// A new trie with `key` mapped to `value`.
    pub fn with(&self, key: u32, value: Ref) -> Result<Self, StorageError> {
        let root = self.with_node(self.root.as_ref(), key, value, 0)?;
        Ok(Self {
            root: Some(NodeRef::Mem(Arc::new(root))),
            stor: self.stor.clone(),
        })
    }

    fn with_node(
        &self,
        node: Option<&NodeRef>,
        key: u32,
        value: Ref,
        shift: u32,
    ) -> Result<Node, StorageError> {
        debug_assert!(shift < 32, "trie deeper than key width");
        let mut node = match node {
            Some(r) => (*self.node(r)?).clone(),
            None => Node::default(),
        };
        let bit = (key >> shift) & MASK;
        let slot = match node.slot(bit) {
            None => Slot::Entry { key, value },
            Some(Slot::Entry { key: k, .. }) if *k == key => Slot::Entry { key, value },
            Some(&Slot::Entry {
                key: other_key,
                value: other_value,
            }) => {
                let child = self.with_node(None, other_key, other_value, shift + BITS)?;
                let child = NodeRef::Mem(Arc::new(child));
                let child = self.with_node(Some(&child), key, value, shift + BITS)?;
                Slot::Child(NodeRef::Mem(Arc::new(child)))
            }
            Some(Slot::Child(child)) => {
                let child = self.with_node(Some(child), key, value, shift + BITS)?;
                Slot::Child(NodeRef::Mem(Arc::new(child)))
            }
        };
        node.set(bit, slot);
        Ok(node)
    }

    /// Persist all in-memory nodes, children before parents. Values are
    /// translated to addresses by `translate`.
    ///
    /// Returns the root address (`None` for an empty trie) and the trie
    /// rooted at it.
    pub fn store<F>(
        &self,
        stor: &Arc<Storage>,
        translate: F,
    ) -> Result<(Option<Address>, Self), StorageError>
    where
        F: Fn(Ref) -> Address,
    {
        let root = match &self.root {
            None => None,
            Some(r) => Some(Self::store_node(r, stor, &translate)?),
        };
        let trie = Self {
            root: root.map(NodeRef::Stored),
            stor: Some(Arc::clone(stor)),
        };
        Ok((root, trie))
    }

    fn store_node<F>(r: &NodeRef, stor: &Storage, translate: &F) -> Result<Address, StorageError>
    where
        F: Fn(Ref) -> Address,
    {
        let node = match r {
            NodeRef::Stored(adr) => return Ok(*adr),
            NodeRef::Mem(node) => node,
        };
        let mut buf = Vec::with_capacity(node.encoded_len());
        buf.extend_from_slice(&node.bitmap.to_be_bytes());
        buf.extend_from_slice(&node.entry_bits.to_be_bytes());
        for slot in &node.slots {
            match slot {
                Slot::Entry { key, value } => {
                    buf.extend_from_slice(&key.to_be_bytes());
                    buf.extend_from_slice(&translate(*value).raw().to_be_bytes());
                }
                Slot::Child(child) => {
                    let adr = Self::store_node(child, stor, translate)?;
                    buf.extend_from_slice(&adr.raw().to_be_bytes());
                    buf.extend_from_slice(&0u32.to_be_bytes());
                }
            }
        }
        let adr = stor.alloc(buf.len() as u64)?;
        stor.write(adr, &buf)?;
        Ok(adr)
    }

    /// Visit every entry of `self` whose value differs from (or is absent
    /// in) `base`. Subtrees shared with `base` are skipped.
    pub fn traverse_changes<F>(&self, base: &Self, mut visit: F) -> Result<(), StorageError>
    where
        F: FnMut(u32, Ref) -> Result<(), StorageError>,
    {
        let Some(root) = &self.root else {
            return Ok(());
        };
        match &base.root {
            Some(b) if root.same(b) => Ok(()),
            b => self.traverse_node(root, b.as_ref(), base, &mut visit),
        }
    }

    fn traverse_node<F>(
        &self,
        r: &NodeRef,
        base_ref: Option<&NodeRef>,
        base: &Self,
        visit: &mut F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(u32, Ref) -> Result<(), StorageError>,
    {
        let node = self.node(r)?;
        let base_node = base_ref.map(|b| base.node(b)).transpose()?;
        for bit in 0..32 {
            match node.slot(bit) {
                None => {}
                Some(&Slot::Entry { key, value }) => {
                    if base.get(key)? != Some(value) {
                        visit(key, value)?;
                    }
                }
                Some(Slot::Child(child)) => {
                    let base_child = match base_node.as_ref().and_then(|n| n.slot(bit)) {
                        Some(Slot::Child(c)) => Some(c),
                        _ => None,
                    };
                    if base_child.is_some_and(|c| c.same(child)) {
                        continue;
                    }
                    self.traverse_node(child, base_child, base, visit)?;
                }
            }
        }
        Ok(())
    }

    /// Visit every entry, in no particular order.
    pub fn for_each<F>(&self, mut visit: F) -> Result<(), StorageError>
    where
        F: FnMut(u32, Ref) -> Result<(), StorageError>,
    {
        self.traverse_changes(&Self::empty(), &mut visit)
    }
}

impl std::fmt::Debug for PersistentTrie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.root {
            None => write!(f, "PersistentTrie(empty)"),
            Some(NodeRef::Stored(adr)) => write!(f, "PersistentTrie({adr})"),
            Some(NodeRef::Mem(_)) => write!(f, "PersistentTrie(in memory)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mmap::{MB, OpenMode};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn adr(n: u32) -> Ref {
        Ref::Adr(Address::from_offset(u64::from(n) * 8))
    }

    fn changes(trie: &PersistentTrie, base: &PersistentTrie) -> Vec<(u32, Ref)> {
        let mut out = Vec::new();
        trie.traverse_changes(base, |k, v| {
            out.push((k, v));
            Ok(())
        })
        .unwrap();
        out.sort_by_key(|&(k, _)| k);
        out
    }

    #[test]
    fn test_get_returns_latest_value() {
        let t = PersistentTrie::empty()
            .with(1, adr(10))
            .unwrap()
            .with(33, adr(20))
            .unwrap()
            .with(1, adr(30))
            .unwrap();
        assert_eq!(t.get(1).unwrap(), Some(adr(30)));
        assert_eq!(t.get(33).unwrap(), Some(adr(20)));
        assert_eq!(t.get(65).unwrap(), None);
        assert_eq!(t.get(2).unwrap(), None);
    }

    #[test]
    fn test_old_roots_are_unaffected() {
        let t1 = PersistentTrie::empty().with(5, adr(1)).unwrap();
        let t2 = t1.with(5, adr(2)).unwrap();
        let t3 = t2.with(5 + 32, adr(3)).unwrap();
        assert_eq!(t1.get(5).unwrap(), Some(adr(1)));
        assert_eq!(t2.get(5).unwrap(), Some(adr(2)));
        assert_eq!(t2.get(37).unwrap(), None);
        assert_eq!(t3.get(5).unwrap(), Some(adr(2)));
        assert_eq!(t3.get(37).unwrap(), Some(adr(3)));
    }

    #[test]
    fn test_deep_collision() {
        // Keys agree in the low 30 bits and differ only in the top two.
        let a = 0x0012_3456;
        let b = a | 0x8000_0000;
        let t = PersistentTrie::empty()
            .with(a, adr(1))
            .unwrap()
            .with(b, adr(2))
            .unwrap();
        assert_eq!(t.get(a).unwrap(), Some(adr(1)));
        assert_eq!(t.get(b).unwrap(), Some(adr(2)));
        assert_eq!(t.get(a | 0x4000_0000).unwrap(), None);
    }

    #[test]
    fn test_random_with_matches_map() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut expected = HashMap::new();
        let mut trie = PersistentTrie::empty();
        let mut snapshots = Vec::new();
        for i in 0..2000 {
            let key = rng.random_range(1..5000u32);
            let value = adr(rng.random_range(1..1_000_000));
            trie = trie.with(key, value).unwrap();
            expected.insert(key, value);
            if i % 500 == 0 {
                snapshots.push((trie.clone(), expected.clone()));
            }
        }
        for (&k, &v) in &expected {
            assert_eq!(trie.get(k).unwrap(), Some(v));
        }
        for (snap, map) in &snapshots {
            for key in 1..5000 {
                assert_eq!(snap.get(key).unwrap(), map.get(&key).copied());
            }
        }
    }

    #[test]
    fn test_traverse_changes_visits_only_changes() {
        let mut base = PersistentTrie::empty();
        for k in 0..200 {
            base = base.with(k, adr(k + 1)).unwrap();
        }
        let changed = base
            .with(7, adr(999))
            .unwrap()
            .with(500, adr(501))
            .unwrap()
            .with(8, adr(9)) // same value as base
            .unwrap();
        assert_eq!(changes(&changed, &base), vec![(7, adr(999)), (500, adr(501))]);
        assert!(changes(&base, &base).is_empty());
        assert_eq!(changes(&base, &PersistentTrie::empty()).len(), 200);
    }

    #[test]
    fn test_store_and_reload() {
        let dir = tempdir().unwrap();
        let stor = Arc::new(
            Storage::open_with(&dir.path().join("t.imdb"), OpenMode::ReadWrite, MB).unwrap(),
        );

        let mut trie = PersistentTrie::empty();
        for k in 1..300 {
            trie = trie.with(k * 7, adr(k)).unwrap();
        }
        trie = trie.with(3, Ref::IntRef(0)).unwrap();
        let resolved = Address::from_offset(4000);
        let (root, stored) = trie
            .store(&stor, |r| match r {
                Ref::Adr(a) => a,
                Ref::IntRef(_) => resolved,
            })
            .unwrap();
        let root = root.unwrap();
        assert_eq!(stored.stored_root(), Some(root));

        let reloaded = PersistentTrie::load(Arc::clone(&stor), Some(root));
        for k in 1..300 {
            assert_eq!(reloaded.get(k * 7).unwrap(), Some(adr(k)));
        }
        assert_eq!(reloaded.get(3).unwrap(), Some(Ref::Adr(resolved)));

        // Only the path to the change is rewritten on the next store.
        let end = stor.end();
        let next = reloaded.with(14, adr(77)).unwrap();
        assert_eq!(changes(&next, &reloaded), vec![(14, adr(77))]);
        let (root2, _) = next.store(&stor, |r| r.expect_address("test")).unwrap();
        assert_ne!(root2, Some(root));
        assert!(stor.end() - end < 1024);
        let again = PersistentTrie::load(Arc::clone(&stor), root2);
        assert_eq!(again.get(14).unwrap(), Some(adr(77)));
        assert_eq!(again.get(21).unwrap(), Some(adr(3)));
    }

    #[test]
    fn test_same_root() {
        let empty = PersistentTrie::empty();
        assert!(empty.same_root(&PersistentTrie::empty()));
        let t = empty.with(1, adr(1)).unwrap();
        assert!(t.same_root(&t.clone()));
        assert!(!t.same_root(&t.with(1, adr(1)).unwrap()));
        assert!(!t.same_root(&empty));
    }
}
