//! Insert path: top-down descent that splits full nodes ahead of itself.

use super::bplus::BPlusTree;
use super::node::NodeKind;
use super::pin::{LockMode, NodePin};
use super::strategy::{CreateOrUpdateValue, InsertResult};
use super::transaction::NodeTransaction;
use super::{TreeKey, TreeValue};
use arbor_common::{ArborError, Result};
use std::cmp::Ordering;

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    /// Creates or updates the entry for `key` as `strategy` decides.
    ///
    /// With `left_heavy`, splits leave the minimum in the right node, which
    /// packs nodes tightly when keys arrive in ascending order.
    pub(super) fn insert_with<S>(
        &self,
        key: &K,
        strategy: &mut S,
        left_heavy: bool,
    ) -> Result<InsertResult>
    where
        S: CreateOrUpdateValue<K, V> + ?Sized,
    {
        self.ensure_writable()?;
        let result = {
            let mut root = self.lock_root(LockMode::Write, false)?;
            self.insert_from(root.take_pin()?, key, strategy, left_heavy, false)?
        };
        if matches!(result, InsertResult::Inserted | InsertResult::Updated) {
            self.after_write()?;
        }
        Ok(result)
    }

    /// Insert descent starting at a write-pinned root. The caller holds the
    /// call lock.
    ///
    /// A `staged` insert goes into a subtree readers cannot reach yet, so
    /// its value changes skip the log and the entry count.
    pub(super) fn insert_from<S>(
        &self,
        root: NodePin<K, V>,
        key: &K,
        strategy: &mut S,
        left_heavy: bool,
        staged: bool,
    ) -> Result<InsertResult>
    where
        S: CreateOrUpdateValue<K, V> + ?Sized,
    {
        let mut current = self.lock_node(Self::top_of(&root)?, LockMode::Write)?;
        let mut parent = Some(root);
        let mut parent_index = 0;

        loop {
            let node = current.node();
            if node.count() >= self.limits.maximum(node) {
                let Some(parent_pin) = parent.as_mut() else {
                    return Err(ArborError::Internal(
                        "full node reached without its parent".to_string(),
                    ));
                };
                let mut trans = self.begin_transaction();
                if parent_pin.node().is_root() {
                    // Grow the tree: a new top branch adopts the full node.
                    let mut top = trans.create(NodeKind::Branch {
                        keys: Vec::new(),
                        children: vec![current.handle()],
                    })?;
                    match parent_pin.node_mut()?.kind_mut() {
                        NodeKind::Root { child } => *child = top.handle(),
                        _ => return Err(ArborError::Internal("expected the root".to_string())),
                    }
                    let (mut prev, mut next, _) =
                        self.split(&mut trans, current, &mut top, 0, left_heavy)?;
                    trans.commit(&mut [parent_pin, &mut top, &mut prev, &mut next])?;
                    current = top;
                    parent_index = 0;
                    continue;
                }

                let (mut prev, mut next, split_key) =
                    self.split(&mut trans, current, parent_pin, parent_index, left_heavy)?;
                trans.commit(&mut [parent_pin, &mut prev, &mut next])?;
                if self.comparer.compare(key, &split_key) == Ordering::Less {
                    current = prev;
                } else {
                    current = next;
                    parent_index += 1;
                }
                continue;
            }

            parent = None;
            if node.is_leaf() {
                return self.insert_at_leaf(current, key, strategy, staged);
            }
            let index = node.child_index(|k| self.comparer.compare(k, key));
            let child = node.child(index).ok_or_else(|| {
                ArborError::corrupted(format!("node {}", current.handle()), "missing child")
            })?;
            let child = self.lock_node(child, LockMode::Write)?;
            parent = Some(current);
            parent_index = index;
            current = child;
        }
    }

    fn insert_at_leaf<S>(
        &self,
        mut leaf: NodePin<K, V>,
        key: &K,
        strategy: &mut S,
        staged: bool,
    ) -> Result<InsertResult>
    where
        S: CreateOrUpdateValue<K, V> + ?Sized,
    {
        let begin = || {
            if staged {
                NodeTransaction::staged(self)
            } else {
                self.begin_transaction()
            }
        };
        match leaf.node().find_entry(|k| self.comparer.compare(k, key)) {
            Ok(index) => {
                let (stored_key, mut value) = leaf.node().entries()[index].clone();
                if !strategy.update_value(&stored_key, &mut value)? {
                    return Ok(InsertResult::Exists);
                }
                let mut trans = begin();
                leaf.node_mut()?.entries_mut()?[index].1 = value.clone();
                trans.update_value(&stored_key, &value)?;
                trans.commit(&mut [&mut leaf])?;
                Ok(InsertResult::Updated)
            }
            Err(index) => {
                let Some(value) = strategy.create_value(key)? else {
                    return Ok(InsertResult::NotFound);
                };
                let mut trans = begin();
                trans.add_value(key, &value)?;
                leaf.node_mut()?
                    .entries_mut()?
                    .insert(index, (key.clone(), value));
                trans.commit(&mut [&mut leaf])?;
                Ok(InsertResult::Inserted)
            }
        }
    }

    /// Replaces the full node `me`, the child at `index` of `parent`, with
    /// two new nodes and registers the separator in `parent`.
    ///
    /// Returns the left and right halves and the separator key.
    fn split(
        &self,
        trans: &mut NodeTransaction<'_, K, V>,
        me: NodePin<K, V>,
        parent: &mut NodePin<K, V>,
        index: usize,
        left_heavy: bool,
    ) -> Result<(NodePin<K, V>, NodePin<K, V>, K)> {
        let handle = me.handle();
        let node = me.node();
        let count = node.count();
        let take = if left_heavy {
            count - self.limits.minimum(node)
        } else {
            count >> 1
        };
        let (prev_kind, next_kind, split_key) = match node.kind() {
            NodeKind::Leaf { entries } => (
                NodeKind::Leaf {
                    entries: entries[..take].to_vec(),
                },
                NodeKind::Leaf {
                    entries: entries[take..].to_vec(),
                },
                entries[take].0.clone(),
            ),
            NodeKind::Branch { keys, children } => (
                NodeKind::Branch {
                    keys: keys[..take - 1].to_vec(),
                    children: children[..take].to_vec(),
                },
                NodeKind::Branch {
                    keys: keys[take..].to_vec(),
                    children: children[take..].to_vec(),
                },
                keys[take - 1].clone(),
            ),
            NodeKind::Root { .. } => {
                return Err(ArborError::Internal("the root cannot be split".to_string()));
            }
        };

        let prev = trans.create(prev_kind)?;
        let next = trans.create(next_kind)?;
        let (keys, children) = parent.node_mut()?.branch_mut()?;
        if children.get(index) != Some(&handle) {
            return Err(ArborError::Internal(format!(
                "node {handle} is not child {index} of its parent"
            )));
        }
        children[index] = prev.handle();
        keys.insert(index, split_key.clone());
        children.insert(index + 1, next.handle());
        trans.destroy(me)?;
        Ok((prev, next, split_key))
    }
}

#[cfg(test)]
mod tests {
    use super::super::options::TreeOptions;
    use super::*;
    use arbor_common::TreeConfig;
    use rand::seq::SliceRandom;
    use rand::{SeedableRng, rngs::StdRng};

    fn small_tree() -> BPlusTree<u32, u32> {
        let mut config = TreeConfig::default();
        config.minimum_value_nodes = 2;
        config.maximum_value_nodes = 4;
        config.minimum_child_nodes = 2;
        config.maximum_child_nodes = 4;
        BPlusTree::new(TreeOptions::ordered(config)).unwrap()
    }

    #[test]
    fn test_ascending_inserts_split_evenly() {
        let tree = small_tree();
        for i in 0..200 {
            tree.add(i, i).unwrap();
        }
        tree.validate().unwrap();
        assert_eq!(tree.count().unwrap(), 200);
        for i in 0..200 {
            assert_eq!(tree.get(&i).unwrap(), Some(i));
        }
    }

    #[test]
    fn test_random_inserts_keep_order() {
        let tree = small_tree();
        let mut keys: Vec<u32> = (0..500).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        for key in &keys {
            tree.add(*key, key + 1).unwrap();
        }
        tree.validate().unwrap();
        let scanned: Vec<u32> = tree.keys().collect::<Result<_>>().unwrap();
        assert_eq!(scanned, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_left_heavy_split_packs_nodes() {
        let mut config = TreeConfig::default();
        config.minimum_value_nodes = 2;
        config.maximum_value_nodes = 8;
        config.minimum_child_nodes = 2;
        config.maximum_child_nodes = 4;
        let tree: BPlusTree<u32, u32> = BPlusTree::new(TreeOptions::ordered(config)).unwrap();
        for i in 0..100 {
            let mut strategy = super::super::strategy::InsertValue::new(i, false);
            tree.insert_with(&i, &mut strategy, true).unwrap();
        }
        tree.validate().unwrap();

        let mut from = std::ops::Bound::Unbounded;
        let mut leaves = 0;
        loop {
            let (_, upper) = tree.leaf_batch(&from).unwrap();
            leaves += 1;
            match upper {
                Some(key) => from = std::ops::Bound::Included(key),
                None => break,
            }
        }
        // Each split keeps six entries on the left; even splits would keep four.
        assert!(leaves <= 18, "{leaves} leaves");
    }

    #[test]
    fn test_declined_create_leaves_tree_unchanged() {
        struct Decline;
        impl super::super::strategy::CreateValue<u32, u32> for Decline {
            fn create_value(&mut self, _key: &u32) -> Result<Option<u32>> {
                Ok(None)
            }
        }
        impl super::super::strategy::UpdateValue<u32, u32> for Decline {
            fn update_value(&mut self, _key: &u32, _value: &mut u32) -> Result<bool> {
                Ok(false)
            }
        }

        let tree = small_tree();
        let result = tree.insert_with(&1, &mut Decline, false).unwrap();
        assert_eq!(result, InsertResult::NotFound);
        assert_eq!(tree.count().unwrap(), 0);
    }
}
