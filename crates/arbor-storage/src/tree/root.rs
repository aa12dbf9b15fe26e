//! Entry locks: the tree-wide call lock and the pinned root node.

use super::bplus::BPlusTree;
use super::node::{Node, NodeKind};
use super::pin::{LockMode, NodePin};
use super::{TreeKey, TreeValue};
use arbor_common::{ArborError, LockTimeout, Result, StorageHandle};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use tracing::debug;

/// Hold on the tree-wide call lock.
///
/// Ordinary operations share it. Whole-tree operations (commit, rollback,
/// clear, bulk loads) take it exclusively and so run with no other
/// operation in flight.
pub(crate) enum CallGuard<'t> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'t, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'t, ()>),
}

/// A pinned root node together with the call lock it was taken under.
///
/// Fields drop in declaration order, so the root pin is released before
/// the call lock.
pub(crate) struct RootLock<'t, K, V> {
    pin: Option<NodePin<K, V>>,
    _call: CallGuard<'t>,
}

impl<K, V> RootLock<'_, K, V> {
    /// Hands the root pin to the descent. The call lock stays held.
    pub(crate) fn take_pin(&mut self) -> Result<NodePin<K, V>> {
        self.pin
            .take()
            .ok_or_else(|| ArborError::Internal("root pin already taken".to_string()))
    }
}

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    pub(super) fn lock_call(&self, exclusive: bool) -> Result<CallGuard<'_>> {
        let timeout = self.timeout;
        let guard = match (exclusive, timeout) {
            (false, LockTimeout::Infinite) => Some(CallGuard::Shared(self.call_lock.read())),
            (false, LockTimeout::After(wait)) => {
                self.call_lock.try_read_for(wait).map(CallGuard::Shared)
            }
            (true, LockTimeout::Infinite) => Some(CallGuard::Exclusive(self.call_lock.write())),
            (true, LockTimeout::After(wait)) => {
                self.call_lock.try_write_for(wait).map(CallGuard::Exclusive)
            }
        };
        guard.ok_or(ArborError::LockTimeout {
            timeout_ms: timeout.as_millis(),
        })
    }

    /// Takes the call lock and pins the root in `mode`.
    pub(super) fn lock_root(&self, mode: LockMode, exclusive: bool) -> Result<RootLock<'_, K, V>> {
        let call = self.lock_call(exclusive)?;
        let pin = self.pin_root(mode)?;
        Ok(RootLock {
            pin: Some(pin),
            _call: call,
        })
    }

    /// Pins the root without touching the call lock. The caller must
    /// already hold it.
    pub(super) fn pin_root(&self, mode: LockMode) -> Result<NodePin<K, V>> {
        let pin = self.lock_node(self.root, mode)?;
        if !pin.node().is_root() {
            return Err(ArborError::corrupted(
                format!("node {}", self.root),
                "the root handle does not hold a root node",
            ));
        }
        Ok(pin)
    }

    pub(super) fn lock_node(&self, handle: StorageHandle, mode: LockMode) -> Result<NodePin<K, V>> {
        self.cache.lock(&*self.storage, handle, mode, self.timeout)
    }

    /// Handle of the top node under the root.
    pub(super) fn top_of(root: &NodePin<K, V>) -> Result<StorageHandle> {
        root.node().child(0).ok_or_else(|| {
            ArborError::corrupted(format!("node {}", root.handle()), "root has no child")
        })
    }

    /// Writes an empty leaf and a root pointing at it.
    ///
    /// Used when storage reports a new root and after a reset.
    pub(super) fn create_empty_root(&self) -> Result<()> {
        if self.read_only {
            return Err(ArborError::ReadOnly);
        }
        let top = self.storage.create()?;
        self.storage
            .update(top, &Arc::new(Node::empty_leaf(top)))?;
        self.storage.update(
            self.root,
            &Arc::new(Node::new(self.root, NodeKind::Root { child: top })),
        )?;
        if self.storage.is_transactable() {
            self.storage.commit()?;
        }
        self.cache.clear();
        debug!(root = %self.root, top = %top, "Created empty tree");
        Ok(())
    }
}
