//! In-memory node storage.

use super::NodeStorage;
use arbor_common::{Result, StorageHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Node storage kept entirely in RAM.
///
/// Nodes are held as-is without serialization. Nothing survives a drop and
/// there is no rollback.
pub struct BTreeMemoryStore<N> {
    /// Root handle, fixed for the life of the store.
    root: StorageHandle,
    /// Node map.
    nodes: RwLock<HashMap<StorageHandle, N>>,
    /// Next handle id to hand out.
    next_id: AtomicU32,
}

impl<N> BTreeMemoryStore<N> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            root: StorageHandle::new(0),
            nodes: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Returns the number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

impl<N> Default for BTreeMemoryStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Clone + Send + Sync> NodeStorage<N> for BTreeMemoryStore<N> {
    fn open_root(&self) -> Result<(StorageHandle, bool)> {
        let is_new = !self.nodes.read().contains_key(&self.root);
        Ok((self.root, is_new))
    }

    fn reset(&self) -> Result<()> {
        self.nodes.write().clear();
        Ok(())
    }

    fn try_get_node(&self, handle: StorageHandle) -> Result<Option<N>> {
        Ok(self.nodes.read().get(&handle).cloned())
    }

    fn create(&self) -> Result<StorageHandle> {
        Ok(StorageHandle::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn destroy(&self, handle: StorageHandle) -> Result<()> {
        self.nodes.write().remove(&handle);
        Ok(())
    }

    fn update(&self, handle: StorageHandle, node: &N) -> Result<()> {
        self.nodes.write().insert(handle, node.clone());
        Ok(())
    }
}
