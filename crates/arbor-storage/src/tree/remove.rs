//! Remove path: top-down descent that refills minimal nodes ahead of itself.

use super::bplus::BPlusTree;
use super::node::{Node, NodeKind};
use super::pin::{LockMode, NodePin};
use super::strategy::RemoveValue;
use super::{TreeKey, TreeValue};
use arbor_common::{ArborError, Result};
use std::mem;

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    /// Removes the entry for `key` if `strategy` agrees.
    pub(super) fn remove_with<S>(&self, key: &K, strategy: &mut S) -> Result<bool>
    where
        S: RemoveValue<K, V> + ?Sized,
    {
        self.ensure_writable()?;
        let removed = {
            let mut root = self.lock_root(LockMode::Write, false)?;
            self.remove_from(root.take_pin()?, key, strategy)?
        };
        if removed {
            self.after_write()?;
        }
        Ok(removed)
    }

    fn remove_from<S>(&self, root: NodePin<K, V>, key: &K, strategy: &mut S) -> Result<bool>
    where
        S: RemoveValue<K, V> + ?Sized,
    {
        let mut current = self.lock_node(Self::top_of(&root)?, LockMode::Write)?;
        // Held only while `current` is the top node, so the tree can shrink.
        let mut root = Some(root);

        loop {
            if current.node().is_leaf() {
                drop(root);
                return self.remove_at_leaf(current, key, strategy);
            }
            let index = current
                .node()
                .child_index(|k| self.comparer.compare(k, key));
            let handle = current.node().child(index).ok_or_else(|| {
                ArborError::corrupted(format!("node {}", current.handle()), "missing child")
            })?;
            let mut child = self.lock_node(handle, LockMode::Write)?;

            if child.node().count() <= self.limits.minimum(child.node()) {
                child = self.rebalance(&mut current, index, child)?;
                if let Some(root_pin) = root.as_mut() {
                    if current.node().count() == 1 {
                        // The top branch is down to one child: make that child the top.
                        let mut trans = self.begin_transaction();
                        match root_pin.node_mut()?.kind_mut() {
                            NodeKind::Root { child: top } => *top = child.handle(),
                            _ => return Err(ArborError::Internal("expected the root".to_string())),
                        }
                        trans.destroy(current)?;
                        trans.commit(&mut [root_pin])?;
                        current = child;
                        continue;
                    }
                }
            }

            root = None;
            current = child;
        }
    }

    fn remove_at_leaf<S>(&self, mut leaf: NodePin<K, V>, key: &K, strategy: &mut S) -> Result<bool>
    where
        S: RemoveValue<K, V> + ?Sized,
    {
        let Ok(index) = leaf.node().find_entry(|k| self.comparer.compare(k, key)) else {
            return Ok(false);
        };
        let (stored_key, value) = &leaf.node().entries()[index];
        if !strategy.remove_value(stored_key, value)? {
            return Ok(false);
        }
        let mut trans = self.begin_transaction();
        trans.remove_value(key)?;
        leaf.node_mut()?.entries_mut()?.remove(index);
        trans.commit(&mut [&mut leaf])?;
        Ok(true)
    }

    /// Brings `child`, the minimal child at `index` of `parent`, above its
    /// minimum by borrowing from a sibling or merging with one.
    ///
    /// Returns the pin to continue the descent with.
    fn rebalance(
        &self,
        parent: &mut NodePin<K, V>,
        index: usize,
        mut child: NodePin<K, V>,
    ) -> Result<NodePin<K, V>> {
        let (_, children) = parent.node().branch()?;
        let left = index.checked_sub(1).map(|i| children[i]);
        let right = children.get(index + 1).copied();

        let mut left = match left {
            Some(handle) => Some(self.lock_node(handle, LockMode::Write)?),
            None => None,
        };
        if let Some(left_pin) = left.as_mut() {
            if left_pin.node().count() > self.limits.minimum(left_pin.node()) {
                let mut trans = self.begin_transaction();
                rotate_right(
                    parent.node_mut()?,
                    index,
                    left_pin.node_mut()?,
                    child.node_mut()?,
                )?;
                trans.commit(&mut [parent, left_pin, &mut child])?;
                return Ok(child);
            }
        }

        let mut right = match right {
            Some(handle) => Some(self.lock_node(handle, LockMode::Write)?),
            None => None,
        };
        if let Some(right_pin) = right.as_mut() {
            if right_pin.node().count() > self.limits.minimum(right_pin.node()) {
                let mut trans = self.begin_transaction();
                rotate_left(
                    parent.node_mut()?,
                    index,
                    child.node_mut()?,
                    right_pin.node_mut()?,
                )?;
                trans.commit(&mut [parent, &mut child, right_pin])?;
                return Ok(child);
            }
        }

        let mut trans = self.begin_transaction();
        match (left, right) {
            (Some(mut left_pin), _) => {
                merge(parent.node_mut()?, index - 1, left_pin.node_mut()?, child.node())?;
                trans.destroy(child)?;
                trans.commit(&mut [parent, &mut left_pin])?;
                Ok(left_pin)
            }
            (None, Some(right_pin)) => {
                merge(parent.node_mut()?, index, child.node_mut()?, right_pin.node())?;
                trans.destroy(right_pin)?;
                trans.commit(&mut [parent, &mut child])?;
                Ok(child)
            }
            (None, None) => Err(ArborError::corrupted(
                format!("node {}", parent.handle()),
                "branch with a single child below the top",
            )),
        }
    }
}

/// Moves the last element of `left` to the front of `child`, the child at
/// `index` of `parent`.
fn rotate_right<K: Clone, V>(
    parent: &mut Node<K, V>,
    index: usize,
    left: &mut Node<K, V>,
    child: &mut Node<K, V>,
) -> Result<()> {
    let (separators, _) = parent.branch_mut()?;
    match (left.kind_mut(), child.kind_mut()) {
        (NodeKind::Leaf { entries: from }, NodeKind::Leaf { entries: to }) => {
            let moved = from.pop().ok_or_else(empty_sibling)?;
            separators[index - 1] = moved.0.clone();
            to.insert(0, moved);
        }
        (
            NodeKind::Branch { keys: from_keys, children: from_children },
            NodeKind::Branch { keys: to_keys, children: to_children },
        ) => {
            let moved_child = from_children.pop().ok_or_else(empty_sibling)?;
            let moved_key = from_keys.pop().ok_or_else(empty_sibling)?;
            let separator = mem::replace(&mut separators[index - 1], moved_key);
            to_keys.insert(0, separator);
            to_children.insert(0, moved_child);
        }
        _ => return Err(mismatched_siblings()),
    }
    Ok(())
}

/// Moves the first element of `right` to the end of `child`, the child at
/// `index` of `parent`.
fn rotate_left<K: Clone, V>(
    parent: &mut Node<K, V>,
    index: usize,
    child: &mut Node<K, V>,
    right: &mut Node<K, V>,
) -> Result<()> {
    let (separators, _) = parent.branch_mut()?;
    match (child.kind_mut(), right.kind_mut()) {
        (NodeKind::Leaf { entries: to }, NodeKind::Leaf { entries: from }) => {
            if from.len() < 2 {
                return Err(empty_sibling());
            }
            to.push(from.remove(0));
            separators[index] = from[0].0.clone();
        }
        (
            NodeKind::Branch { keys: to_keys, children: to_children },
            NodeKind::Branch { keys: from_keys, children: from_children },
        ) => {
            if from_keys.is_empty() {
                return Err(empty_sibling());
            }
            let moved_child = from_children.remove(0);
            let moved_key = from_keys.remove(0);
            let separator = mem::replace(&mut separators[index], moved_key);
            to_keys.push(separator);
            to_children.push(moved_child);
        }
        _ => return Err(mismatched_siblings()),
    }
    Ok(())
}

/// Appends `right` to `left` and drops the separator at `separator` (and
/// the child after it) from `parent`.
fn merge<K: Clone, V: Clone>(
    parent: &mut Node<K, V>,
    separator: usize,
    left: &mut Node<K, V>,
    right: &Node<K, V>,
) -> Result<()> {
    let (separators, children) = parent.branch_mut()?;
    match (left.kind_mut(), right.kind()) {
        (NodeKind::Leaf { entries: into }, NodeKind::Leaf { entries: from }) => {
            into.extend(from.iter().cloned());
        }
        (
            NodeKind::Branch { keys: into_keys, children: into_children },
            NodeKind::Branch { keys: from_keys, children: from_children },
        ) => {
            into_keys.push(separators[separator].clone());
            into_keys.extend(from_keys.iter().cloned());
            into_children.extend(from_children.iter().copied());
        }
        _ => return Err(mismatched_siblings()),
    }
    separators.remove(separator);
    children.remove(separator + 1);
    Ok(())
}

fn empty_sibling() -> ArborError {
    ArborError::Internal("sibling has nothing to lend".to_string())
}

fn mismatched_siblings() -> ArborError {
    ArborError::Internal("siblings differ in kind".to_string())
}
