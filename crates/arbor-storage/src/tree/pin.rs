//! Node locks held while a tree operation works on a node.

use super::node::Node;
use arbor_common::{ArborError, LockTimeout, Result, StorageHandle};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::sync::Arc;

/// What a cache slot remembers about its node.
pub(crate) struct SlotState<K, V> {
    node: Mutex<Option<Arc<Node<K, V>>>>,
}

impl<K, V> Default for SlotState<K, V> {
    fn default() -> Self {
        Self {
            node: Mutex::new(None),
        }
    }
}

/// Per-handle lock guarding the cached node.
pub(crate) type NodeSlot<K, V> = RwLock<SlotState<K, V>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Read,
    Write,
}

enum PinGuard<K, V> {
    Read(ArcRwLockReadGuard<RawRwLock, SlotState<K, V>>),
    Write(ArcRwLockWriteGuard<RawRwLock, SlotState<K, V>>),
}

impl<K, V> PinGuard<K, V> {
    fn acquire(slot: &Arc<NodeSlot<K, V>>, mode: LockMode, timeout: LockTimeout) -> Result<Self> {
        let guard = match (mode, timeout) {
            (LockMode::Read, LockTimeout::Infinite) => Some(PinGuard::Read(slot.read_arc())),
            (LockMode::Read, LockTimeout::After(wait)) => {
                slot.try_read_arc_for(wait).map(PinGuard::Read)
            }
            (LockMode::Write, LockTimeout::Infinite) => Some(PinGuard::Write(slot.write_arc())),
            (LockMode::Write, LockTimeout::After(wait)) => {
                slot.try_write_arc_for(wait).map(PinGuard::Write)
            }
        };
        guard.ok_or(ArborError::LockTimeout {
            timeout_ms: timeout.as_millis(),
        })
    }

    fn state(&self) -> &SlotState<K, V> {
        match self {
            PinGuard::Read(guard) => &**guard,
            PinGuard::Write(guard) => &**guard,
        }
    }
}

/// A locked node.
///
/// The pin owns a snapshot of the node. Under a write lock the snapshot can
/// be modified (clone-on-write); the change becomes visible to other pins
/// only once a [`NodeTransaction`](super::transaction::NodeTransaction)
/// commits it.
pub(crate) struct NodePin<K, V> {
    handle: StorageHandle,
    guard: PinGuard<K, V>,
    node: Arc<Node<K, V>>,
    dirty: bool,
}

impl<K, V> NodePin<K, V> {
    /// Locks `slot` and resolves its node, loading it with `load` when the
    /// slot holds none. Loaded nodes are remembered when `retain` is set.
    pub(crate) fn lock<F>(
        slot: &Arc<NodeSlot<K, V>>,
        handle: StorageHandle,
        mode: LockMode,
        timeout: LockTimeout,
        retain: bool,
        load: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Arc<Node<K, V>>>,
    {
        let guard = PinGuard::acquire(slot, mode, timeout)?;
        let cached = guard.state().node.lock().clone();
        let node = match cached {
            Some(node) => node,
            None => {
                let node = load()?;
                if node.handle() != handle {
                    return Err(ArborError::InvalidNodeHandle(format!(
                        "{} holds node {}",
                        handle,
                        node.handle()
                    )));
                }
                if retain {
                    *guard.state().node.lock() = Some(Arc::clone(&node));
                }
                node
            }
        };
        Ok(Self {
            handle,
            guard,
            node,
            dirty: false,
        })
    }

    /// Write-locks a fresh slot for a node that is not yet stored.
    pub(crate) fn create(slot: &Arc<NodeSlot<K, V>>, node: Node<K, V>) -> Self {
        Self {
            handle: node.handle(),
            guard: PinGuard::Write(slot.write_arc()),
            node: Arc::new(node),
            dirty: true,
        }
    }

    pub(crate) fn handle(&self) -> StorageHandle {
        self.handle
    }

    pub(crate) fn node(&self) -> &Node<K, V> {
        &self.node
    }

    pub(crate) fn shared(&self) -> &Arc<Node<K, V>> {
        &self.node
    }

    pub(crate) fn is_write(&self) -> bool {
        matches!(self.guard, PinGuard::Write(_))
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Makes the pinned node visible to later pins of the same slot.
    pub(crate) fn publish(&mut self, retain: bool) {
        if let PinGuard::Write(guard) = &mut self.guard {
            *guard.node.get_mut() = retain.then(|| Arc::clone(&self.node));
        }
        self.dirty = false;
    }
}

impl<K: Clone, V: Clone> NodePin<K, V> {
    /// Returns the pinned node for modification, copying it first if shared.
    pub(crate) fn node_mut(&mut self) -> Result<&mut Node<K, V>> {
        if !self.is_write() {
            return Err(ArborError::Internal(format!(
                "node {} is not locked for writing",
                self.handle
            )));
        }
        self.dirty = true;
        Ok(Arc::make_mut(&mut self.node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::node::NodeKind;
    use std::time::Duration;

    fn leaf(handle: StorageHandle, keys: &[i32]) -> Arc<Node<i32, i32>> {
        Arc::new(Node::new(
            handle,
            NodeKind::Leaf {
                entries: keys.iter().map(|k| (*k, *k)).collect(),
            },
        ))
    }

    #[test]
    fn test_lock_loads_once_when_retained() {
        let handle = StorageHandle::new(5);
        let slot: Arc<NodeSlot<i32, i32>> = Arc::new(RwLock::new(SlotState::default()));
        let pin = NodePin::lock(&slot, handle, LockMode::Read, LockTimeout::Infinite, true, || {
            Ok(leaf(handle, &[1, 2]))
        })
        .unwrap();
        assert_eq!(pin.node().count(), 2);
        drop(pin);

        let pin = NodePin::lock(&slot, handle, LockMode::Read, LockTimeout::Infinite, true, || {
            Err(ArborError::Internal("should not reload".to_string()))
        })
        .unwrap();
        assert_eq!(pin.node().count(), 2);
    }

    #[test]
    fn test_lock_rejects_mismatched_handle() {
        let slot: Arc<NodeSlot<i32, i32>> = Arc::new(RwLock::new(SlotState::default()));
        let err = NodePin::lock(
            &slot,
            StorageHandle::new(1),
            LockMode::Read,
            LockTimeout::Infinite,
            false,
            || Ok(leaf(StorageHandle::new(2), &[])),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ArborError::InvalidNodeHandle(_)));
    }

    #[test]
    fn test_write_pin_times_out_readers() {
        let handle = StorageHandle::new(9);
        let slot: Arc<NodeSlot<i32, i32>> = Arc::new(RwLock::new(SlotState::default()));
        let _writer = NodePin::create(&slot, Node::empty_leaf(handle));
        let err = NodePin::lock(
            &slot,
            handle,
            LockMode::Read,
            LockTimeout::After(Duration::from_millis(10)),
            true,
            || Ok(leaf(handle, &[])),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ArborError::LockTimeout { timeout_ms: 10 }));
    }

    #[test]
    fn test_modification_is_private_until_published() {
        let handle = StorageHandle::new(3);
        let slot: Arc<NodeSlot<i32, i32>> = Arc::new(RwLock::new(SlotState::default()));
        let original = leaf(handle, &[1]);
        let loaded = Arc::clone(&original);
        let mut pin = NodePin::lock(&slot, handle, LockMode::Write, LockTimeout::Infinite, true, || {
            Ok(loaded)
        })
        .unwrap();

        if let NodeKind::Leaf { entries } = pin.node_mut().unwrap().kind_mut() {
            entries.push((2, 2));
        }
        assert!(pin.is_dirty());
        assert_eq!(original.count(), 1);

        pin.publish(true);
        drop(pin);
        let pin = NodePin::lock(&slot, handle, LockMode::Read, LockTimeout::Infinite, true, || {
            Err(ArborError::Internal("unexpected load".to_string()))
        })
        .unwrap();
        assert_eq!(pin.node().count(), 2);
    }

    #[test]
    fn test_read_pin_cannot_modify() {
        let handle = StorageHandle::new(4);
        let slot: Arc<NodeSlot<i32, i32>> = Arc::new(RwLock::new(SlotState::default()));
        let mut pin = NodePin::lock(&slot, handle, LockMode::Read, LockTimeout::Infinite, true, || {
            Ok(leaf(handle, &[]))
        })
        .unwrap();
        assert!(matches!(pin.node_mut(), Err(ArborError::Internal(_))));
    }
}
