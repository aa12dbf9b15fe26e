//! Unit of work for structural and value changes.

use super::bplus::BPlusTree;
use super::node::{Node, NodeKind};
use super::pin::NodePin;
use super::{TreeKey, TreeValue};
use arbor_common::{ArborError, Result, StorageHandle};
use arbor_wal::{TransactionLogger, TransactionToken};
use std::sync::Arc;
use tracing::warn;

/// Collects node writes, allocations, frees and log operations so they are
/// applied together.
///
/// Nodes created through the transaction are allocated immediately; if the
/// transaction is dropped without committing they are destroyed again and
/// any pending log operations are rolled back. Modified pins stay private to
/// their holder until [`commit`](Self::commit) publishes them.
pub(crate) struct NodeTransaction<'t, K: TreeKey, V: TreeValue> {
    tree: &'t BPlusTree<K, V>,
    created: Vec<StorageHandle>,
    destroyed: Vec<NodePin<K, V>>,
    released: Vec<StorageHandle>,
    token: Option<TransactionToken>,
    delta: isize,
    /// False for staged writes, which reach neither the log nor the count.
    tracked: bool,
    done: bool,
}

impl<'t, K: TreeKey, V: TreeValue> NodeTransaction<'t, K, V> {
    pub(crate) fn new(tree: &'t BPlusTree<K, V>) -> Self {
        Self {
            tree,
            created: Vec::new(),
            destroyed: Vec::new(),
            released: Vec::new(),
            token: None,
            delta: 0,
            tracked: true,
            done: false,
        }
    }

    /// A transaction for nodes no reader can reach yet, such as a subtree
    /// being bulk loaded. Value changes are neither logged nor counted.
    pub(crate) fn staged(tree: &'t BPlusTree<K, V>) -> Self {
        let mut trans = Self::new(tree);
        trans.tracked = false;
        trans
    }

    /// Allocates a handle and write-pins a new node of `kind` under it.
    pub(crate) fn create(&mut self, kind: NodeKind<K, V>) -> Result<NodePin<K, V>> {
        let handle = self.tree.storage.create()?;
        self.created.push(handle);
        Ok(self.tree.cache.create(Node::new(handle, kind)))
    }

    /// Frees the pinned node on commit.
    pub(crate) fn destroy(&mut self, pin: NodePin<K, V>) -> Result<()> {
        if !pin.is_write() {
            return Err(ArborError::Internal(format!(
                "node {} is not locked for writing",
                pin.handle()
            )));
        }
        self.destroyed.push(pin);
        Ok(())
    }

    /// Frees an unpinned node on commit. Only valid while the caller holds
    /// the call lock exclusively, so nobody else can reach the node.
    pub(crate) fn release(&mut self, handle: StorageHandle) {
        self.released.push(handle);
    }

    fn log(&self) -> Option<&'t Arc<dyn TransactionLogger<K, V>>> {
        if self.tracked {
            self.tree.log.as_ref()
        } else {
            None
        }
    }

    pub(crate) fn add_value(&mut self, key: &K, value: &V) -> Result<()> {
        self.delta += 1;
        if let Some(log) = self.log() {
            let token = self.token.get_or_insert_with(|| log.begin_transaction());
            log.add_value(token, key, value)?;
        }
        Ok(())
    }

    pub(crate) fn update_value(&mut self, key: &K, value: &V) -> Result<()> {
        if let Some(log) = self.log() {
            let token = self.token.get_or_insert_with(|| log.begin_transaction());
            log.update_value(token, key, value)?;
        }
        Ok(())
    }

    pub(crate) fn remove_value(&mut self, key: &K) -> Result<()> {
        self.delta -= 1;
        if let Some(log) = self.log() {
            let token = self.token.get_or_insert_with(|| log.begin_transaction());
            log.remove_value(token, key)?;
        }
        Ok(())
    }

    /// Writes every dirty pin, frees destroyed nodes and appends the log
    /// record, then publishes the pins to the cache.
    ///
    /// Pins are published only after storage accepted every write, so a
    /// failed commit leaves readers on the previous node versions.
    pub(crate) fn commit(mut self, pins: &mut [&mut NodePin<K, V>]) -> Result<()> {
        let tree = self.tree;
        for pin in pins.iter() {
            if pin.is_dirty() {
                tree.storage.update(pin.handle(), pin.shared())?;
            }
        }
        for pin in &self.destroyed {
            tree.storage.destroy(pin.handle())?;
        }
        for handle in &self.released {
            tree.storage.destroy(*handle)?;
        }
        if let (Some(log), Some(token)) = (&tree.log, self.token.as_mut()) {
            log.commit_transaction(token)?;
        }
        self.done = true;

        let retain = tree.cache.retains_nodes();
        for pin in pins.iter_mut() {
            if pin.is_dirty() {
                pin.publish(retain);
            }
        }
        for pin in self.destroyed.drain(..) {
            tree.cache.remove(pin.handle());
        }
        for handle in self.released.drain(..) {
            tree.cache.remove(handle);
        }
        if self.tracked && self.delta != 0 {
            tree.adjust_count(self.delta);
        }
        Ok(())
    }
}

impl<K: TreeKey, V: TreeValue> Drop for NodeTransaction<'_, K, V> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for handle in self.created.drain(..) {
            self.tree.cache.remove(handle);
            if let Err(e) = self.tree.storage.destroy(handle) {
                warn!(%handle, error = %e, "Failed to release node of abandoned transaction");
            }
        }
        if let (Some(log), Some(token)) = (&self.tree.log, self.token.as_mut()) {
            if let Err(e) = log.rollback_transaction(token) {
                warn!(error = %e, "Failed to roll back log transaction");
            }
        }
    }
}
