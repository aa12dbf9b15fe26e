//! Concurrent B+Tree over pluggable node storage.
//!
//! ```text
//!            [Root] fixed handle, one child
//!               |
//!            [Branch]  keys: k1 k2      children: c0 c1 c2
//!           /    |    \
//!      [Leaf] [Leaf] [Leaf]  ordered (key, value) entries
//! ```
//!
//! Traversals lock-couple node pins top-down: a child is pinned before its
//! parent is released. Inserts split full nodes on the way down and removes
//! refill minimal nodes on the way down, so no operation ever walks back up.
//! Every structural change runs inside a node transaction and becomes
//! visible only when it commits.

mod alternate;
mod bplus;
mod bulk;
mod cache;
mod insert;
mod iter;
mod node;
mod options;
mod pin;
mod recovery;
mod remove;
mod root;
mod search;
mod strategy;
mod transaction;

pub use alternate::AlternateLookup;
pub use bplus::BPlusTree;
pub use bulk::BulkInsertOptions;
pub use iter::{Keys, TreeIter, Values};
pub use node::{Node, NodeKind, NodeSerializer};
pub use options::TreeOptions;
pub use recovery::FileEntries;
pub use strategy::{
    AddIfAbsent, CreateOrUpdateValue, CreateValue, InsertResult, InsertValue, InsertionInfo,
    RemoveAny, RemoveIf, RemoveValue, UpdateInfo, UpdateValue, UpdateWith,
};

use std::fmt::Debug;

/// Bounds every tree key satisfies.
pub trait TreeKey: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> TreeKey for T {}

/// Bounds every tree value satisfies.
pub trait TreeValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> TreeValue for T {}
