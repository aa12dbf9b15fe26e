//! Write-back cache in front of another node store.

use super::NodeStorage;
use arbor_collections::{LurchTable, LurchTableOrder};
use arbor_common::{ArborError, Result, StorageHandle};
use parking_lot::Mutex;
use tracing::debug;

/// Caches nodes and defers their writes to the inner store.
///
/// Reads go through an access-ordered table. Updates land in a
/// modification-ordered dirty table whose overflow is written through to the
/// inner store oldest first. `commit` drains the dirty table before
/// committing the inner store.
pub struct StorageCache<N> {
    store: Box<dyn NodeStorage<N>>,
    cache: LurchTable<StorageHandle, N>,
    dirty: LurchTable<StorageHandle, N>,
    /// Serializes write-through against commit and cache misses.
    flush_lock: Mutex<()>,
}

impl<N: Clone + Send + Sync> StorageCache<N> {
    /// Wraps `store`, keeping up to `size_limit` nodes in each table.
    pub fn new(store: Box<dyn NodeStorage<N>>, size_limit: usize) -> Self {
        let limit = size_limit.max(1);
        Self {
            store,
            cache: LurchTable::new(LurchTableOrder::Access, limit),
            dirty: LurchTable::new(LurchTableOrder::Modified, limit),
            flush_lock: Mutex::new(()),
        }
    }

    /// Number of nodes waiting to be written.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Writes every dirty node to the inner store.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        self.flush_locked()
    }

    fn flush_locked(&self) -> Result<()> {
        let pending = self.dirty.drain();
        let count = pending.len();
        for (handle, node) in pending {
            self.store.update(handle, &node)?;
        }
        if count > 0 {
            debug!(nodes = count, "Flushed storage cache");
        }
        Ok(())
    }

    fn clear_tables(&self) {
        self.cache.clear();
        self.dirty.clear();
    }
}

impl<N: Clone + Send + Sync> NodeStorage<N> for StorageCache<N> {
    fn open_root(&self) -> Result<(StorageHandle, bool)> {
        self.store.open_root()
    }

    fn reset(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        self.clear_tables();
        self.store.reset()
    }

    fn try_get_node(&self, handle: StorageHandle) -> Result<Option<N>> {
        if let Some(node) = self.cache.get(&handle) {
            return Ok(Some(node));
        }
        let _guard = self.flush_lock.lock();
        let found = match self.dirty.get(&handle) {
            Some(node) => Some(node),
            None => self.store.try_get_node(handle)?,
        };
        if let Some(node) = &found {
            self.cache.insert(handle, node.clone());
        }
        Ok(found)
    }

    fn create(&self) -> Result<StorageHandle> {
        self.store.create()
    }

    fn destroy(&self, handle: StorageHandle) -> Result<()> {
        let _guard = self.flush_lock.lock();
        self.dirty.remove(&handle);
        self.cache.remove(&handle);
        self.store.destroy(handle)
    }

    fn update(&self, handle: StorageHandle, node: &N) -> Result<()> {
        let _guard = self.flush_lock.lock();
        self.cache.insert(handle, node.clone());
        for (evicted, value) in self.dirty.insert(handle, node.clone()) {
            self.store.update(evicted, &value)?;
        }
        Ok(())
    }

    fn is_transactable(&self) -> bool {
        self.store.is_transactable()
    }

    fn commit(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        self.flush_locked()?;
        self.store.commit()
    }

    fn rollback(&self) -> Result<()> {
        if !self.store.is_transactable() {
            return Err(ArborError::InvalidOperation(
                "the storage does not support rollback".to_string(),
            ));
        }
        let _guard = self.flush_lock.lock();
        self.clear_tables();
        self.store.rollback()
    }
}
