//! Read and update transactions.
//!
//! A transaction starts from the published [`DbState`]: the root of every
//! tree and the committed redirections. Reads go through the transaction's
//! own redirections and intrefs, so an update transaction sees its own
//! changes and nobody else's.
//!
//! Changing a stored node copies it into the transaction's intref table and
//! redirects the stored address (and every address on its redirection
//! chain) to the copy. Parents are only copied when they change too.
//!
//! Commit, under the database's commit lock:
//!
//! 1. Merge tree roots and redirections with the latest committed state.
//!    A tree whose root changed both here and in a concurrent commit, or a
//!    node redirected differently by both, is a conflict.
//! 2. Write the data segment with a zero timestamp; new data records get
//!    their addresses.
//! 3. Store new nodes leaves first, then the redirections trie.
//! 4. Write the timestamp into the data segment and flush the data log.
//! 5. Write the index root and flush the index store.
//! 6. Publish the new state.
//!
//! A crash before step 4 leaves an aborted segment and unreferenced nodes.
//! A crash after it is repaired on open by replaying the segment.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeBounds;
use std::sync::Arc;

use crate::storage::address::{Address, Ref};
use crate::storage::btree::{
    Btree, BtreeError, NodeSource, NodeStore, TreeInfo, TreeNode, check_key,
};
use crate::storage::commit::{CommitBuilder, CommitType, DataRecord, MAX_TBLNUM};
use crate::storage::database::{Database, lock};
use crate::storage::index_root::{IndexRoot, TableRoot};
use crate::storage::intrefs::IntRefs;
use crate::storage::io::StorageError;
use crate::storage::mmap::Storage;
use crate::storage::record::Record;
use crate::storage::redirects::{Conflict, MergeError, Redirects};
use crate::storage::time::next_timestamp;
use crate::storage::trie::PersistentTrie;

/// Committed state that new transactions start from.
#[derive(Debug, Clone, Default)]
pub struct DbState {
    /// Every reference is an address.
    pub tables: BTreeMap<u16, TreeInfo>,
    pub redirects: PersistentTrie,
    pub last_commit: Option<Address>,
    /// Length of the data log covered by the index.
    pub data_size: u64,
    pub timestamp: u32,
}

impl DbState {
    #[must_use]
    pub fn from_root(index: &Arc<Storage>, root: &IndexRoot) -> Self {
        let tables = root
            .tables
            .iter()
            .map(|t| {
                let info = TreeInfo {
                    root: Ref::Adr(t.root),
                    levels: t.levels,
                };
                (t.tblnum, info)
            })
            .collect();
        Self {
            tables,
            redirects: PersistentTrie::load(Arc::clone(index), root.redirects),
            last_commit: root.last_commit,
            data_size: root.data_size,
            timestamp: root.timestamp,
        }
    }
}

/// Errors from transaction operations.
#[derive(Debug)]
pub enum TransactionError {
    Storage(StorageError),
    Btree(BtreeError),
    /// A concurrent commit redirected a node this transaction changed.
    Conflict(Conflict),
    /// A concurrent commit changed the root of a tree this transaction
    /// changed the root of.
    TableConflict { tblnum: u16 },
    /// No record with the key in the table.
    NotFound { tblnum: u16 },
    InvalidTable(u16),
}

impl TransactionError {
    /// True if retrying the transaction from a fresh snapshot may succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::TableConflict { .. })
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Btree(e) => write!(f, "index error: {e}"),
            Self::Conflict(c) => write!(f, "{c}"),
            Self::TableConflict { tblnum } => {
                write!(f, "concurrent change to the root of table {tblnum}")
            }
            Self::NotFound { tblnum } => write!(f, "record not found in table {tblnum}"),
            Self::InvalidTable(t) => write!(f, "invalid table number {t}"),
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Btree(e) => Some(e),
            Self::Conflict(c) => Some(c),
            Self::TableConflict { .. } | Self::NotFound { .. } | Self::InvalidTable(_) => None,
        }
    }
}

impl From<StorageError> for TransactionError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<BtreeError> for TransactionError {
    fn from(e: BtreeError) -> Self {
        Self::Btree(e)
    }
}

impl From<MergeError> for TransactionError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::Conflict(c) => Self::Conflict(c),
            MergeError::Storage(e) => Self::Storage(e),
        }
    }
}

/// The index key of a record: its first field.
#[must_use]
pub fn index_key(record: &Record) -> Record {
    record.prefix(1)
}

/// A transaction-local object.
#[derive(Debug)]
pub(crate) enum Pending {
    Node(TreeNode),
    Data(DataRecord),
}

fn load_node<'a>(
    index: &Storage,
    redirects: &Redirects,
    intrefs: &'a IntRefs<Pending>,
    ptr: Ref,
    level: u8,
) -> Result<Cow<'a, TreeNode>, BtreeError> {
    match redirects.get(ptr)? {
        r @ Ref::IntRef(_) => match intrefs.int_to_ref(r) {
            Pending::Node(node) => Ok(Cow::Borrowed(node)),
            Pending::Data(_) => Err(BtreeError::Corrupt(format!("{r:?} is not a node"))),
        },
        Ref::Adr(adr) => Ok(Cow::Owned(TreeNode::read(index, adr, level)?)),
    }
}

/// Read access to a transaction's nodes.
pub(crate) struct NodeView<'a> {
    index: &'a Storage,
    redirects: &'a Redirects,
    intrefs: &'a IntRefs<Pending>,
}

impl NodeSource for NodeView<'_> {
    fn node(&self, ptr: Ref, level: u8) -> Result<Cow<'_, TreeNode>, BtreeError> {
        load_node(self.index, self.redirects, self.intrefs, ptr, level)
    }
}

/// Copy-on-write access to a transaction's nodes.
pub(crate) struct NodeWriter<'a> {
    index: &'a Storage,
    redirects: &'a mut Redirects,
    intrefs: &'a mut IntRefs<Pending>,
}

impl NodeSource for NodeWriter<'_> {
    fn node(&self, ptr: Ref, level: u8) -> Result<Cow<'_, TreeNode>, BtreeError> {
        load_node(self.index, &*self.redirects, &*self.intrefs, ptr, level)
    }
}

impl NodeStore for NodeWriter<'_> {
    fn modify(&mut self, ptr: Ref, level: u8) -> Result<Ref, BtreeError> {
        match self.redirects.get(ptr)? {
            r @ Ref::IntRef(_) => Ok(r),
            Ref::Adr(adr) => {
                let node = TreeNode::read(self.index, adr, level)?;
                let copy = self.intrefs.ref_to_int(Pending::Node(node));
                self.redirects.put_chain(ptr, copy)?;
                Ok(copy)
            }
        }
    }

    fn node_mut(&mut self, r: Ref) -> &mut TreeNode {
        match self.intrefs.int_to_ref_mut(r) {
            Pending::Node(node) => node,
            Pending::Data(_) => panic!("{r:?} is not a node"),
        }
    }

    fn add_node(&mut self, node: TreeNode) -> Ref {
        self.intrefs.ref_to_int(Pending::Node(node))
    }
}

/// The persisted result of [`TxIndex::store`].
pub(crate) struct StoredIndex {
    pub tables: Vec<TableRoot>,
    pub redirects_root: Option<Address>,
    pub redirects: PersistentTrie,
}

impl StoredIndex {
    /// The index root describing this state, and the state itself.
    pub fn finish(
        self,
        last_commit: Option<Address>,
        data_size: u64,
        timestamp: u32,
    ) -> (IndexRoot, DbState) {
        let tables = self
            .tables
            .iter()
            .map(|t| {
                let info = TreeInfo {
                    root: Ref::Adr(t.root),
                    levels: t.levels,
                };
                (t.tblnum, info)
            })
            .collect();
        let state = DbState {
            tables,
            redirects: self.redirects,
            last_commit,
            data_size,
            timestamp,
        };
        let root = IndexRoot {
            tables: self.tables,
            redirects: self.redirects_root,
            last_commit,
            data_size,
            timestamp,
        };
        (root, state)
    }
}

/// A transaction's view of, and changes to, the trees.
pub(crate) struct TxIndex {
    index: Arc<Storage>,
    max_keys: usize,
    /// Tree roots as of the last merge.
    base_tables: BTreeMap<u16, TreeInfo>,
    tables: BTreeMap<u16, TreeInfo>,
    redirects: Redirects,
    pub(crate) intrefs: IntRefs<Pending>,
}

impl TxIndex {
    pub fn new(index: &Arc<Storage>, state: &DbState, max_keys: usize) -> Self {
        Self {
            index: Arc::clone(index),
            max_keys,
            base_tables: state.tables.clone(),
            tables: state.tables.clone(),
            redirects: Redirects::new(state.redirects.clone()),
            intrefs: IntRefs::new(),
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = u16> + '_ {
        self.tables.keys().copied()
    }

    fn tree(&self, tblnum: u16) -> Option<Btree<NodeView<'_>>> {
        let info = *self.tables.get(&tblnum)?;
        let view = NodeView {
            index: &self.index,
            redirects: &self.redirects,
            intrefs: &self.intrefs,
        };
        Some(Btree::new(view, info, self.max_keys))
    }

    pub fn get(&self, tblnum: u16, key: &Record) -> Result<Option<Ref>, BtreeError> {
        self.tree(tblnum).map_or(Ok(None), |t| t.get(key))
    }

    pub fn range<R>(&self, tblnum: u16, range: &R) -> Result<Vec<(Record, Ref)>, BtreeError>
    where
        R: RangeBounds<Record>,
    {
        self.tree(tblnum).map_or_else(|| Ok(Vec::new()), |t| t.range(range))
    }

    /// Verify the structure of one tree. Returns its key count.
    pub fn check(&self, tblnum: u16) -> Result<usize, BtreeError> {
        self.tree(tblnum).map_or(Ok(0), |t| t.check())
    }

    /// Run `f` on the tree for `tblnum`, creating an empty tree first if
    /// `create` is set. `None` if there is no such tree.
    ///
    /// A tree created here is kept only if `f` succeeds.
    pub fn with_tree<R, F>(&mut self, tblnum: u16, create: bool, f: F) -> Result<Option<R>, BtreeError>
    where
        F: FnOnce(&mut Btree<NodeWriter<'_>>) -> Result<R, BtreeError>,
    {
        // Every node of a new tree is registered after this mark.
        let mark = self.intrefs.len();
        let (info, created) = match self.tables.get(&tblnum) {
            Some(info) => (*info, false),
            None if create => {
                let root = self.intrefs.ref_to_int(Pending::Node(TreeNode::empty_leaf()));
                (TreeInfo { root, levels: 0 }, true)
            }
            None => return Ok(None),
        };
        let writer = NodeWriter {
            index: &self.index,
            redirects: &mut self.redirects,
            intrefs: &mut self.intrefs,
        };
        let mut tree = Btree::new(writer, info, self.max_keys);
        let result = f(&mut tree);
        let after = tree.info();
        match result {
            Ok(out) => {
                self.tables.insert(tblnum, after);
                Ok(Some(out))
            }
            Err(e) => {
                if created {
                    self.intrefs.truncate(mark);
                }
                Err(e)
            }
        }
    }

    /// Fold in commits made since this transaction started.
    pub fn merge(&mut self, current: &DbState) -> Result<(), TransactionError> {
        let mut tables = current.tables.clone();
        for (&tblnum, &info) in &self.tables {
            let base = self.base_tables.get(&tblnum);
            if base == Some(&info) {
                continue;
            }
            if current.tables.get(&tblnum) != base {
                tracing::warn!(tblnum, "tree root merge conflict");
                return Err(TransactionError::TableConflict { tblnum });
            }
            tables.insert(tblnum, info);
        }
        self.redirects.merge(&current.redirects)?;
        self.tables = tables;
        self.base_tables = current.tables.clone();
        Ok(())
    }

    /// Store every new node, children first, then the redirections.
    ///
    /// # Panics
    ///
    /// Panics unless `intrefs.start_store` was called and every data intref
    /// referenced from a leaf has its address.
    pub fn store(&mut self) -> Result<StoredIndex, StorageError> {
        let mut nodes: Vec<(u8, Ref)> = self
            .intrefs
            .iter()
            .filter_map(|(r, p)| match p {
                Pending::Node(node) => Some((node.level(), r)),
                Pending::Data(_) => None,
            })
            .collect();
        nodes.sort_by_key(|&(level, _)| level);
        let count = nodes.len();
        for (_, r) in nodes {
            let Pending::Node(node) = self.intrefs.int_to_ref(r) else {
                continue;
            };
            debug_assert!(!node.resolved, "unchanged node {r:?} copied into the transaction");
            let adr = node.store(&self.index, &self.redirects, &self.intrefs)?;
            self.intrefs.set_adr(r, adr);
        }

        let intrefs = &self.intrefs;
        let redirects_root = self.redirects.store(&self.index, |r| intrefs.resolve(r))?;

        let mut tables = Vec::with_capacity(self.tables.len());
        for (&tblnum, info) in &self.tables {
            let root = intrefs.resolve(self.redirects.get(info.root)?);
            tables.push(TableRoot {
                tblnum,
                root,
                levels: info.levels,
            });
        }
        tracing::debug!(nodes = count, tables = tables.len(), "stored index changes");
        Ok(StoredIndex {
            tables,
            redirects_root,
            redirects: self.redirects.trie().clone(),
        })
    }
}

/// What a commit changes in the data log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// A data intref added by this transaction.
    Add(Ref),
    Update { from: Address, to: Ref },
    Remove(Address),
}

fn fetch(data: &Storage, intrefs: &IntRefs<Pending>, r: Ref) -> Result<Record, TransactionError> {
    match r {
        Ref::IntRef(_) => match intrefs.int_to_ref(r) {
            Pending::Data(rec) => Ok(rec.record.clone()),
            Pending::Node(_) => Err(BtreeError::Corrupt(format!("{r:?} is not a record")).into()),
        },
        Ref::Adr(adr) => Ok(DataRecord::read(data, adr)?.record),
    }
}

fn check_table(tblnum: u16) -> Result<(), TransactionError> {
    if (1..=MAX_TBLNUM).contains(&tblnum) {
        Ok(())
    } else {
        Err(TransactionError::InvalidTable(tblnum))
    }
}

/// A read-only snapshot.
pub struct ReadTransaction {
    db: Database,
    state: Arc<DbState>,
    index: TxIndex,
}

impl ReadTransaction {
    pub(crate) fn new(db: Database) -> Self {
        let state = db.current();
        let index = TxIndex::new(db.index_store(), &state, db.config().max_node_keys);
        Self { db, state, index }
    }

    /// Timestamp of the commit this snapshot was taken after.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        self.state.timestamp
    }

    /// Length of the data log this snapshot covers.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.state.data_size
    }

    /// Table numbers with a tree, ascending.
    #[must_use]
    pub fn tables(&self) -> Vec<u16> {
        self.index.tables().collect()
    }

    /// The record whose first field matches `key`'s.
    pub fn get(&self, tblnum: u16, key: &Record) -> Result<Option<Record>, TransactionError> {
        self.index
            .get(tblnum, &index_key(key))?
            .map(|r| fetch(self.db.data_store(), &self.index.intrefs, r))
            .transpose()
    }

    /// Records with index keys in `range`, in key order.
    pub fn range<R>(&self, tblnum: u16, range: &R) -> Result<Vec<Record>, TransactionError>
    where
        R: RangeBounds<Record>,
    {
        self.index
            .range(tblnum, range)?
            .into_iter()
            .map(|(_, r)| fetch(self.db.data_store(), &self.index.intrefs, r))
            .collect()
    }

    pub fn count(&self, tblnum: u16) -> Result<usize, TransactionError> {
        Ok(self.index.range(tblnum, &(..))?.len())
    }

    /// Check every tree and the records it references. Returns the number
    /// of records.
    pub fn check(&self) -> Result<usize, TransactionError> {
        let data = self.db.data_store();
        let mut total = 0;
        for tblnum in self.index.tables() {
            let count = self.index.check(tblnum)?;
            for (key, r) in self.index.range(tblnum, &(..))? {
                let adr = r.address().ok_or_else(|| {
                    BtreeError::Corrupt(format!("table {tblnum} references an intref"))
                })?;
                let rec = DataRecord::read(data, adr)?;
                if rec.tblnum != tblnum || index_key(&rec.record) != key {
                    return Err(StorageError::Corruption(format!(
                        "table {tblnum} key {key:?} references {adr} holding table {} key {:?}",
                        rec.tblnum,
                        index_key(&rec.record)
                    ))
                    .into());
                }
            }
            total += count;
        }
        Ok(total)
    }
}

/// Summary of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub timestamp: u32,
    /// The data segment, absent if only the index changed.
    pub segment: Option<Address>,
    pub index_root: Address,
}

/// A transaction that can change records.
///
/// Each table has one unique index on the first field of its records.
pub struct UpdateTransaction {
    db: Database,
    kind: CommitType,
    index: TxIndex,
    actions: Vec<Action>,
}

impl UpdateTransaction {
    pub(crate) fn new(db: Database, kind: CommitType) -> Self {
        let state = db.current();
        let index = TxIndex::new(db.index_store(), &state, db.config().max_node_keys);
        Self {
            db,
            kind,
            index,
            actions: Vec::new(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> CommitType {
        self.kind
    }

    /// True if nothing has been changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.index.intrefs.is_empty()
    }

    #[must_use]
    pub fn tables(&self) -> Vec<u16> {
        self.index.tables().collect()
    }

    pub fn get(&self, tblnum: u16, key: &Record) -> Result<Option<Record>, TransactionError> {
        self.index
            .get(tblnum, &index_key(key))?
            .map(|r| fetch(self.db.data_store(), &self.index.intrefs, r))
            .transpose()
    }

    pub fn range<R>(&self, tblnum: u16, range: &R) -> Result<Vec<Record>, TransactionError>
    where
        R: RangeBounds<Record>,
    {
        self.index
            .range(tblnum, range)?
            .into_iter()
            .map(|(_, r)| fetch(self.db.data_store(), &self.index.intrefs, r))
            .collect()
    }

    /// Add a record. Its first field must be unique within the table. The
    /// table is created by its first record.
    pub fn add(&mut self, tblnum: u16, record: Record) -> Result<(), TransactionError> {
        check_table(tblnum)?;
        let key = index_key(&record);
        check_key(&key)?;
        if self.index.get(tblnum, &key)?.is_some() {
            return Err(BtreeError::DuplicateKey(key).into());
        }
        let r = self
            .index
            .intrefs
            .ref_to_int(Pending::Data(DataRecord::new(tblnum, record)));
        self.index.with_tree(tblnum, true, |t| t.insert(key, r))?;
        self.actions.push(Action::Add(r));
        Ok(())
    }

    /// Replace the record with `key` by `record`. The new record may have a
    /// different key.
    ///
    /// Nothing is changed if the update fails.
    pub fn update(&mut self, tblnum: u16, key: &Record, record: Record) -> Result<(), TransactionError> {
        check_table(tblnum)?;
        let old_key = index_key(key);
        let new_key = index_key(&record);
        let old = self
            .index
            .get(tblnum, &old_key)?
            .ok_or(TransactionError::NotFound { tblnum })?;
        let rekey = new_key != old_key;
        if rekey {
            check_key(&new_key)?;
            if self.index.get(tblnum, &new_key)?.is_some() {
                return Err(BtreeError::DuplicateKey(new_key).into());
            }
        }

        let rec = Pending::Data(DataRecord::new(tblnum, record));
        match old {
            Ref::IntRef(_) => {
                if rekey {
                    self.index.with_tree(tblnum, false, |t| {
                        t.remove(&old_key)?;
                        t.insert(new_key, old)
                    })?;
                }
                self.index.intrefs.update(old, rec);
            }
            Ref::Adr(from) => {
                let to = self.index.intrefs.ref_to_int(rec);
                self.index.with_tree(tblnum, false, |t| {
                    if rekey {
                        t.remove(&old_key)?;
                        t.insert(new_key, to)
                    } else {
                        t.update_data(&old_key, to)?;
                        Ok(())
                    }
                })?;
                self.actions.push(Action::Update { from, to });
            }
        }
        Ok(())
    }

    /// Remove the record with `key`.
    pub fn remove(&mut self, tblnum: u16, key: &Record) -> Result<(), TransactionError> {
        check_table(tblnum)?;
        let old = self
            .index
            .with_tree(tblnum, false, |t| t.remove(&index_key(key)))?
            .flatten()
            .ok_or(TransactionError::NotFound { tblnum })?;
        match old {
            Ref::Adr(adr) => self.actions.push(Action::Remove(adr)),
            Ref::IntRef(_) => {
                let pos = self.actions.iter().position(|a| match *a {
                    Action::Add(r) | Action::Update { to: r, .. } => r == old,
                    Action::Remove(_) => false,
                });
                if let Some(pos) = pos {
                    match self.actions[pos] {
                        Action::Update { from, .. } => self.actions[pos] = Action::Remove(from),
                        _ => {
                            self.actions.remove(pos);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Make the changes durable and visible. `None` if there was nothing to
    /// commit.
    pub fn commit(self) -> Result<Option<CommitInfo>, TransactionError> {
        let Self {
            db,
            kind,
            mut index,
            actions,
        } = self;
        if actions.is_empty() && index.intrefs.is_empty() {
            return Ok(None);
        }

        let _guard = lock(db.commit_lock());
        let current = db.current();
        index.merge(&current)?;
        index.intrefs.start_store();

        let data = db.data_store();
        let written = if actions.is_empty() {
            None
        } else {
            let mut cb = CommitBuilder::new(kind);
            let mut added = Vec::new();
            for action in &actions {
                match *action {
                    Action::Add(r) => {
                        if let Pending::Data(rec) = index.intrefs.int_to_ref(r) {
                            added.push((r, cb.add(rec.tblnum, &rec.record)));
                        }
                    }
                    Action::Update { from, to } => {
                        if let Pending::Data(rec) = index.intrefs.int_to_ref(to) {
                            added.push((to, cb.update(from, rec.tblnum, &rec.record)));
                        }
                    }
                    Action::Remove(adr) => cb.remove(adr),
                }
            }
            let written = cb.write(data)?;
            for (r, entry) in added {
                index.intrefs.set_adr(r, written.record_adr(entry));
            }
            Some(written)
        };

        let stored = index.store()?;

        let timestamp = next_timestamp(db.clock(), current.timestamp);
        let sync = db.config().sync_on_commit;
        if let Some(w) = &written {
            w.finish(data, timestamp)?;
        }
        if sync {
            data.sync()?;
        }

        let segment = written.map(|w| w.adr);
        let (root, state) = stored.finish(
            segment.or(current.last_commit),
            data.end(),
            timestamp,
        );
        let index_store = db.index_store();
        let index_root = root.write(index_store)?;
        if sync {
            index_store.sync()?;
        }
        db.publish(state);

        tracing::debug!(
            timestamp,
            actions = actions.len(),
            index_root = %index_root,
            "committed"
        );
        Ok(Some(CommitInfo {
            timestamp,
            segment,
            index_root,
        }))
    }

    /// Discard the changes.
    pub fn abort(self) {
        tracing::debug!(actions = self.actions.len(), "aborted transaction");
    }
}
