//! Node cache: one lock slot per handle plus a retention policy.

use super::node::Node;
use super::pin::{LockMode, NodePin, NodeSlot, SlotState};
use crate::store::NodeStorage;
use arbor_common::{ArborError, CachePolicy, LockTimeout, Result, StorageHandle};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const MIN_PURGE_THRESHOLD: usize = 64;

struct CacheState<K, V> {
    /// Every slot that may still be alive.
    slots: HashMap<StorageHandle, Weak<NodeSlot<K, V>>>,
    /// Slots pinned for the life of the cache.
    retained: HashMap<StorageHandle, Arc<NodeSlot<K, V>>>,
    /// Recently used slots, oldest first.
    history: VecDeque<(Instant, Arc<NodeSlot<K, V>>)>,
    /// Slot count that triggers a sweep of dead entries.
    purge_at: usize,
}

/// Hands out node pins and decides how long nodes stay materialized.
///
/// * `Full` keeps every slot and node it has seen.
/// * `Recent` keeps slots reachable through weak references and holds a
///   bounded history of strong ones, so a node is dropped only after it
///   ages out of the history and no pin holds it.
/// * `None` keeps only the lock table; every pin reloads from storage.
pub(crate) struct NodeCache<K, V> {
    policy: CachePolicy,
    min_history: usize,
    max_history: usize,
    keep_alive: Duration,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> NodeCache<K, V> {
    pub(crate) fn new(
        policy: CachePolicy,
        min_history: usize,
        max_history: usize,
        keep_alive: Duration,
    ) -> Self {
        Self {
            policy,
            min_history,
            max_history,
            keep_alive,
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                retained: HashMap::new(),
                history: VecDeque::new(),
                purge_at: MIN_PURGE_THRESHOLD,
            }),
        }
    }

    /// Returns true when pinned nodes are remembered between pins.
    pub(crate) fn retains_nodes(&self) -> bool {
        self.policy != CachePolicy::None
    }

    fn slot(&self, handle: StorageHandle, fresh: bool) -> Arc<NodeSlot<K, V>> {
        let mut state = self.state.lock();
        let existing = if fresh {
            None
        } else {
            state.slots.get(&handle).and_then(Weak::upgrade)
        };
        let slot = match existing {
            Some(slot) => slot,
            None => {
                let slot = Arc::new(RwLock::new(SlotState::default()));
                state.slots.insert(handle, Arc::downgrade(&slot));
                if fresh {
                    state.retained.remove(&handle);
                }
                slot
            }
        };

        match self.policy {
            CachePolicy::Full => {
                state
                    .retained
                    .entry(handle)
                    .or_insert_with(|| Arc::clone(&slot));
            }
            CachePolicy::Recent => {
                state.history.push_back((Instant::now(), Arc::clone(&slot)));
                self.trim_history(&mut state);
            }
            CachePolicy::None => {}
        }

        if state.slots.len() > state.purge_at {
            state.slots.retain(|_, slot| slot.strong_count() > 0);
            state.purge_at = (state.slots.len() * 2).max(MIN_PURGE_THRESHOLD);
        }
        slot
    }

    fn trim_history(&self, state: &mut CacheState<K, V>) {
        while state.history.len() > self.max_history {
            state.history.pop_front();
        }
        let now = Instant::now();
        while state.history.len() > self.min_history {
            match state.history.front() {
                Some((used, _)) if now.duration_since(*used) > self.keep_alive => {
                    state.history.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Locks the node stored under `handle`.
    pub(crate) fn lock(
        &self,
        storage: &dyn NodeStorage<Arc<Node<K, V>>>,
        handle: StorageHandle,
        mode: LockMode,
        timeout: LockTimeout,
    ) -> Result<NodePin<K, V>> {
        let slot = self.slot(handle, false);
        NodePin::lock(&slot, handle, mode, timeout, self.retains_nodes(), || {
            storage
                .try_get_node(handle)?
                .ok_or_else(|| ArborError::InvalidNodeHandle(handle.to_string()))
        })
    }

    /// Write-locks a new node that is not yet stored.
    pub(crate) fn create(&self, node: Node<K, V>) -> NodePin<K, V> {
        let slot = self.slot(node.handle(), true);
        NodePin::create(&slot, node)
    }

    /// Forgets a destroyed handle.
    pub(crate) fn remove(&self, handle: StorageHandle) {
        let mut state = self.state.lock();
        state.slots.remove(&handle);
        state.retained.remove(&handle);
    }

    /// Drops every slot. Outstanding pins keep their own slots alive.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        state.retained.clear();
        state.history.clear();
        state.purge_at = MIN_PURGE_THRESHOLD;
    }

    /// Number of slots with a live lock or a retained node.
    #[cfg(test)]
    pub(crate) fn live_slots(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}
