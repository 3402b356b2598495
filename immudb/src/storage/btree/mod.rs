//! Copy-on-write B-trees over the index store.
//!
//! Nodes are records of key records. A leaf key holds a data record
//! reference; an interior key holds a child reference, and the first key of
//! an interior node is always empty so every search finds a child. Trees
//! grow at the root, which is the only way their height changes.
//!
//! The tree code never touches the store directly: it reads nodes through a
//! [`NodeSource`] and gets writable copies through a [`NodeStore`], which is
//! where transactions hook in copy-on-write and redirections.

mod node;
mod tree;

pub use node::{MAX_KEY_SIZE, MAX_NODE_KEY_SIZE, NodeError, NodeKey, NodeKind, TreeNode};
pub use tree::{
    Btree, BtreeError, DEFAULT_MAX_NODE_KEYS, NodeSource, NodeStore, TreeInfo, check_key,
};
