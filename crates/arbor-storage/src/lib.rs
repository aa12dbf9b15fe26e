//! Storage engine for Arbor.
//!
//! This crate provides:
//! - A transacted compound file holding many handle-addressed payloads
//! - Node storage over memory or the compound file, with a write-back cache
//! - A concurrent B+Tree with pluggable ordering, a transaction log and
//!   bulk loading
//!
//! ```
//! use arbor_common::TreeConfig;
//! use arbor_storage::{BPlusTree, TreeOptions};
//!
//! let tree: BPlusTree<u64, String> = BPlusTree::new(TreeOptions::ordered(TreeConfig::default()))?;
//! tree.add(2, "two".to_string())?;
//! tree.add(1, "one".to_string())?;
//! let keys: Vec<u64> = tree.keys().collect::<arbor_common::Result<_>>()?;
//! assert_eq!(keys, vec![1, 2]);
//! # Ok::<(), arbor_common::ArborError>(())
//! ```

pub mod compound;
pub mod store;
pub mod tree;

pub use compound::{CompoundFileConfig, FIRST_IDENTITY, LoadingRule, TransactedCompoundFile};
pub use store::{BTreeFileStore, BTreeMemoryStore, NodeStorage, StorageCache};
pub use tree::{
    AddIfAbsent, AlternateLookup, BPlusTree, BulkInsertOptions, CreateOrUpdateValue, CreateValue,
    FileEntries, InsertResult, InsertValue, InsertionInfo, Keys, Node, NodeKind, NodeSerializer,
    RemoveAny, RemoveIf, RemoveValue, TreeIter, TreeKey, TreeOptions, TreeValue, UpdateInfo,
    UpdateValue, UpdateWith, Values,
};
