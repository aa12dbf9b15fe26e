//! Ordered iteration over tree entries.

use super::bplus::BPlusTree;
use super::{TreeKey, TreeValue};
use arbor_common::Result;
use std::collections::VecDeque;
use std::ops::Bound;

/// Ascending iterator over `(key, value)` pairs.
///
/// Entries are fetched one leaf at a time. No lock is held between
/// batches, so writers are never blocked by an idle iterator; in exchange
/// entries added to a leaf after it was read are not seen.
pub struct TreeIter<'t, K: TreeKey, V: TreeValue> {
    tree: &'t BPlusTree<K, V>,
    next: Option<Bound<K>>,
    buffer: VecDeque<(K, V)>,
    call_held: bool,
}

impl<'t, K: TreeKey, V: TreeValue> TreeIter<'t, K, V> {
    fn new(tree: &'t BPlusTree<K, V>, from: Bound<K>) -> Self {
        Self {
            tree,
            next: Some(from),
            buffer: VecDeque::new(),
            call_held: false,
        }
    }

    /// Iterates every entry for a caller that holds the call lock
    /// exclusively, such as a bulk load reading the contents it replaces.
    pub(super) fn under_call_lock(tree: &'t BPlusTree<K, V>) -> Self {
        Self {
            call_held: true,
            ..Self::new(tree, Bound::Unbounded)
        }
    }

    fn fill(&mut self) -> Result<()> {
        while let Some(from) = self.next.take() {
            let (batch, upper) = if self.call_held {
                self.tree.leaf_batch_locked(&from)?
            } else {
                self.tree.leaf_batch(&from)?
            };
            self.next = upper.map(Bound::Included);
            if !batch.is_empty() {
                self.buffer.extend(batch);
                return Ok(());
            }
        }
        Ok(())
    }
}

impl<K: TreeKey, V: TreeValue> Iterator for TreeIter<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.fill() {
                self.next = None;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Ascending iterator over keys.
pub struct Keys<'t, K: TreeKey, V: TreeValue>(TreeIter<'t, K, V>);

impl<K: TreeKey, V: TreeValue> Iterator for Keys<'_, K, V> {
    type Item = Result<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|entry| entry.map(|(key, _)| key))
    }
}

/// Values in ascending key order.
pub struct Values<'t, K: TreeKey, V: TreeValue>(TreeIter<'t, K, V>);

impl<K: TreeKey, V: TreeValue> Iterator for Values<'_, K, V> {
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|entry| entry.map(|(_, value)| value))
    }
}

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    /// Iterates every entry in key order.
    pub fn iter(&self) -> TreeIter<'_, K, V> {
        TreeIter::new(self, Bound::Unbounded)
    }

    /// Iterates entries with keys at or after `key`.
    pub fn iter_from(&self, key: K) -> TreeIter<'_, K, V> {
        TreeIter::new(self, Bound::Included(key))
    }

    /// Iterates entries with keys strictly after `key`.
    pub fn iter_after(&self, key: K) -> TreeIter<'_, K, V> {
        TreeIter::new(self, Bound::Excluded(key))
    }

    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys(self.iter())
    }

    pub fn values(&self) -> Values<'_, K, V> {
        Values(self.iter())
    }
}

impl<'t, K: TreeKey, V: TreeValue> IntoIterator for &'t BPlusTree<K, V> {
    type Item = Result<(K, V)>;
    type IntoIter = TreeIter<'t, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
