//! Node storage backends.
//!
//! A [`NodeStorage`] maps [`StorageHandle`]s to materialized nodes. The tree
//! only talks to this trait, so the same engine runs over memory, over a
//! transacted compound file, or over either behind a write-back cache.

mod cache;
mod file;
mod memory;

pub use cache::StorageCache;
pub use file::BTreeFileStore;
pub use memory::BTreeMemoryStore;

use arbor_common::{ArborError, Result, StorageHandle};

/// Handle-addressed store of tree nodes.
pub trait NodeStorage<N>: Send + Sync {
    /// Returns the root handle and whether the store holds no root node yet.
    fn open_root(&self) -> Result<(StorageHandle, bool)>;

    /// Discards every node.
    fn reset(&self) -> Result<()>;

    /// Loads a node. `Ok(None)` means the handle holds nothing.
    fn try_get_node(&self, handle: StorageHandle) -> Result<Option<N>>;

    /// Allocates a handle for a new node.
    fn create(&self) -> Result<StorageHandle>;

    /// Releases a handle and its node.
    fn destroy(&self, handle: StorageHandle) -> Result<()>;

    /// Stores `node` under `handle`.
    fn update(&self, handle: StorageHandle, node: &N) -> Result<()>;

    /// Returns true when `commit` and `rollback` are meaningful.
    fn is_transactable(&self) -> bool {
        false
    }

    /// Makes every change since the last commit durable.
    fn commit(&self) -> Result<()> {
        Ok(())
    }

    /// Reverts to the last commit.
    fn rollback(&self) -> Result<()> {
        Err(ArborError::InvalidOperation(
            "the storage does not support rollback".to_string(),
        ))
    }
}
