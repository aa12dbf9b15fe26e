//! Lookups, scans, in-place updates and structural validation.

use super::bplus::BPlusTree;
use super::node::NodeKind;
use super::pin::{LockMode, NodePin};
use super::strategy::UpdateValue;
use super::{TreeKey, TreeValue};
use arbor_common::{ArborError, KeyComparer, Result};
use std::cmp::Ordering;
use std::ops::Bound;

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    /// Descends from `pin` to the leaf whose range covers the probe.
    ///
    /// Each child is pinned before its parent is released.
    pub(super) fn seek_leaf<F>(
        &self,
        mut pin: NodePin<K, V>,
        mode: LockMode,
        probe: &F,
    ) -> Result<NodePin<K, V>>
    where
        F: Fn(&K) -> Ordering,
    {
        while !pin.node().is_leaf() {
            let index = pin.node().child_index(probe);
            let child = pin.node().child(index).ok_or_else(|| {
                ArborError::corrupted(format!("node {}", pin.handle()), "missing child")
            })?;
            pin = self.lock_node(child, mode)?;
        }
        Ok(pin)
    }

    /// Finds the entry matching `probe`.
    pub(super) fn find<F>(&self, probe: F) -> Result<Option<(K, V)>>
    where
        F: Fn(&K) -> Ordering,
    {
        let mut root = self.lock_root(LockMode::Read, false)?;
        let leaf = self.seek_leaf(root.take_pin()?, LockMode::Read, &probe)?;
        Ok(leaf
            .node()
            .find_entry(&probe)
            .ok()
            .map(|index| leaf.node().entries()[index].clone()))
    }

    /// Returns the value stored for `key`.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let found = self.find(|k| self.comparer.compare(k, key))?;
        Ok(found.map(|(_, value)| value))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.find(|k| self.comparer.compare(k, key))?.is_some())
    }

    /// Smallest entry, or `None` when empty.
    pub fn try_get_first(&self) -> Result<Option<(K, V)>> {
        self.edge_entry(false)
    }

    /// Largest entry, or `None` when empty.
    pub fn try_get_last(&self) -> Result<Option<(K, V)>> {
        self.edge_entry(true)
    }

    /// Smallest entry. Fails with `KeyNotFound` when empty.
    pub fn first(&self) -> Result<(K, V)> {
        self.try_get_first()?.ok_or(ArborError::KeyNotFound)
    }

    /// Largest entry. Fails with `KeyNotFound` when empty.
    pub fn last(&self) -> Result<(K, V)> {
        self.try_get_last()?.ok_or(ArborError::KeyNotFound)
    }

    fn edge_entry(&self, last: bool) -> Result<Option<(K, V)>> {
        let mut root = self.lock_root(LockMode::Read, false)?;
        let mut pin = root.take_pin()?;
        while !pin.node().is_leaf() {
            let index = if last { pin.node().count() - 1 } else { 0 };
            let child = pin.node().child(index).ok_or_else(|| {
                ArborError::corrupted(format!("node {}", pin.handle()), "missing child")
            })?;
            pin = self.lock_node(child, LockMode::Read)?;
        }
        let entries = pin.node().entries();
        let entry = if last { entries.last() } else { entries.first() };
        Ok(entry.cloned())
    }

    /// Snapshot of one leaf starting at `from`, plus the separator that
    /// bounds the leaf on the right (`None` for the last leaf).
    pub(super) fn leaf_batch(&self, from: &Bound<K>) -> Result<(Vec<(K, V)>, Option<K>)> {
        let _call = self.lock_call(false)?;
        self.leaf_batch_locked(from)
    }

    /// [`leaf_batch`](Self::leaf_batch) for a caller that already holds the
    /// call lock.
    pub(super) fn leaf_batch_locked(
        &self,
        from: &Bound<K>,
    ) -> Result<(Vec<(K, V)>, Option<K>)> {
        let mut pin = self.pin_root(LockMode::Read)?;
        let mut upper = None;
        while !pin.node().is_leaf() {
            let index = match from {
                Bound::Unbounded => 0,
                Bound::Included(key) | Bound::Excluded(key) => pin
                    .node()
                    .child_index(|k| self.comparer.compare(k, key)),
            };
            if let Ok((keys, _)) = pin.node().branch() {
                if let Some(separator) = keys.get(index) {
                    upper = Some(separator.clone());
                }
            }
            let child = pin.node().child(index).ok_or_else(|| {
                ArborError::corrupted(format!("node {}", pin.handle()), "missing child")
            })?;
            pin = self.lock_node(child, LockMode::Read)?;
        }

        let node = pin.node();
        let start = match from {
            Bound::Unbounded => 0,
            Bound::Included(key) => node
                .find_entry(|k| self.comparer.compare(k, key))
                .unwrap_or_else(|index| index),
            Bound::Excluded(key) => match node.find_entry(|k| self.comparer.compare(k, key)) {
                Ok(index) => index + 1,
                Err(index) => index,
            },
        };
        Ok((node.entries()[start..].to_vec(), upper))
    }

    /// Applies `strategy` to the entry for `key`. Returns true if the value
    /// changed.
    pub(super) fn update_with<S>(&self, key: &K, strategy: &mut S) -> Result<bool>
    where
        S: UpdateValue<K, V> + ?Sized,
    {
        self.ensure_writable()?;
        let probe = |k: &K| self.comparer.compare(k, key);
        let changed = {
            let mut root = self.lock_root(LockMode::Write, false)?;
            let mut leaf = self.seek_leaf(root.take_pin()?, LockMode::Write, &probe)?;
            let Ok(index) = leaf.node().find_entry(&probe) else {
                return Ok(false);
            };
            let (stored_key, mut value) = leaf.node().entries()[index].clone();
            if !strategy.update_value(&stored_key, &mut value)? {
                return Ok(false);
            }
            let mut trans = self.begin_transaction();
            leaf.node_mut()?.entries_mut()?[index].1 = value.clone();
            trans.update_value(&stored_key, &value)?;
            trans.commit(&mut [&mut leaf])?;
            true
        };
        self.after_write()?;
        Ok(changed)
    }

    /// Counts entries by walking every leaf. The caller holds the call lock
    /// or owns the tree exclusively.
    pub(super) fn count_values(&self) -> Result<usize> {
        let root = self.pin_root(LockMode::Read)?;
        let top = self.lock_node(Self::top_of(&root)?, LockMode::Read)?;
        drop(root);
        self.count_subtree(top)
    }

    fn count_subtree(&self, pin: NodePin<K, V>) -> Result<usize> {
        if pin.node().is_leaf() {
            return Ok(pin.node().count());
        }
        let (_, children) = pin.node().branch()?;
        let mut total = 0;
        for child in children {
            total += self.count_subtree(self.lock_node(*child, LockMode::Read)?)?;
        }
        Ok(total)
    }

    /// Checks node bounds, key ordering and that every leaf sits at the
    /// same depth.
    pub fn validate(&self) -> Result<()> {
        let _call = self.lock_call(false)?;
        let root = self.pin_root(LockMode::Read)?;
        let top = self.lock_node(Self::top_of(&root)?, LockMode::Read)?;
        drop(root);
        let mut leaf_depth = None;
        self.validate_node(top, None, None, 0, &mut leaf_depth)
    }

    fn validate_node(
        &self,
        pin: NodePin<K, V>,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        let node = pin.node();
        let fail = |reason: String| ArborError::corrupted(format!("node {}", pin.handle()), reason);
        let count = node.count();
        let maximum = self.limits.maximum(node);
        if count > maximum {
            return Err(fail(format!("{count} elements exceed the maximum {maximum}")));
        }
        let minimum = self.limits.minimum(node);
        if depth > 0 && count < minimum {
            return Err(fail(format!("{count} elements are below the minimum {minimum}")));
        }

        let in_range = |key: &K| {
            lower.is_none_or(|low| self.comparer.compare(key, low) != Ordering::Less)
                && upper.is_none_or(|high| self.comparer.compare(key, high) == Ordering::Less)
        };
        match node.kind() {
            NodeKind::Leaf { entries } => {
                if !is_ascending(&*self.comparer, entries.iter().map(|(k, _)| k)) {
                    return Err(fail("entries are not in ascending order".to_string()));
                }
                if !entries.iter().all(|(k, _)| in_range(k)) {
                    return Err(fail("entry outside the range of its parent".to_string()));
                }
                match *leaf_depth {
                    Some(expected) if expected != depth => {
                        return Err(fail(format!("leaf at depth {depth}, expected {expected}")));
                    }
                    Some(_) => {}
                    None => *leaf_depth = Some(depth),
                }
                Ok(())
            }
            NodeKind::Branch { keys, children } => {
                if children.is_empty() || keys.len() + 1 != children.len() {
                    return Err(fail(format!(
                        "{} separators for {} children",
                        keys.len(),
                        children.len()
                    )));
                }
                if !is_ascending(&*self.comparer, keys.iter()) {
                    return Err(fail("separators are not in ascending order".to_string()));
                }
                if !keys.iter().all(|k| in_range(k)) {
                    return Err(fail("separator outside the range of its parent".to_string()));
                }
                for (index, child) in children.iter().enumerate() {
                    let child_lower = if index == 0 { lower } else { Some(&keys[index - 1]) };
                    let child_upper = keys.get(index).or(upper);
                    let child = self.lock_node(*child, LockMode::Read)?;
                    self.validate_node(child, child_lower, child_upper, depth + 1, leaf_depth)?;
                }
                Ok(())
            }
            NodeKind::Root { .. } => Err(fail("root node below the top".to_string())),
        }
    }
}

fn is_ascending<'a, K: 'a>(
    comparer: &dyn KeyComparer<K>,
    keys: impl Iterator<Item = &'a K>,
) -> bool {
    let mut previous: Option<&K> = None;
    for key in keys {
        if previous.is_some_and(|p| comparer.compare(p, key) != Ordering::Less) {
            return false;
        }
        previous = Some(key);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::super::options::TreeOptions;
    use super::*;
    use arbor_common::TreeConfig;

    fn small_tree() -> BPlusTree<u32, u32> {
        let mut config = TreeConfig::default();
        config.minimum_value_nodes = 2;
        config.maximum_value_nodes = 4;
        config.minimum_child_nodes = 2;
        config.maximum_child_nodes = 4;
        BPlusTree::new(TreeOptions::ordered(config)).unwrap()
    }

    #[test]
    fn test_empty_tree_lookups() {
        let tree = small_tree();
        assert_eq!(tree.get(&1).unwrap(), None);
        assert!(!tree.contains_key(&1).unwrap());
        assert!(tree.try_get_first().unwrap().is_none());
        assert!(matches!(tree.last(), Err(ArborError::KeyNotFound)));
        assert_eq!(tree.count().unwrap(), 0);
        tree.validate().unwrap();
    }

    #[test]
    fn test_first_and_last_span_leaves() {
        let tree = small_tree();
        for i in (0..100).rev() {
            tree.add(i, i * 2).unwrap();
        }
        assert_eq!(tree.first().unwrap(), (0, 0));
        assert_eq!(tree.last().unwrap(), (99, 198));
        tree.validate().unwrap();
    }

    #[test]
    fn test_leaf_batch_walks_every_leaf() {
        let tree = small_tree();
        for i in 0..40 {
            tree.add(i, i).unwrap();
        }
        let mut from = Bound::Unbounded;
        let mut seen = Vec::new();
        loop {
            let (batch, upper) = tree.leaf_batch(&from).unwrap();
            assert!(batch.len() <= 4);
            seen.extend(batch.into_iter().map(|(k, _)| k));
            match upper {
                Some(key) => from = Bound::Included(key),
                None => break,
            }
        }
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_update_absent_key_is_noop() {
        let tree = small_tree();
        assert!(!tree.try_update(&3, 3).unwrap());
        tree.add(3, 3).unwrap();
        assert!(!tree.try_update(&3, 3).unwrap());
        assert!(tree.try_update(&3, 4).unwrap());
        assert_eq!(tree.get(&3).unwrap(), Some(4));
    }
}
