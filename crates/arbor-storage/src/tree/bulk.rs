//! Bulk loading from an arbitrary (or pre-sorted) input stream.

use super::bplus::BPlusTree;
use super::iter::TreeIter;
use super::node::NodeKind;
use super::pin::LockMode;
use super::strategy::InsertValue;
use super::transaction::NodeTransaction;
use super::{TreeKey, TreeValue};
use arbor_collections::{
    DEFAULT_MEMORY_LIMIT, OrderedEnumeration, OrderedIter, merge, with_duplicate_handling,
};
use arbor_common::{
    ArborError, DuplicateHandling, FnComparer, KeyComparer, PairSerializer, Result, StorageHandle,
};
use arbor_wal::TransactionLogger;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`BPlusTree::bulk_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkInsertOptions {
    /// Skip sorting; the input is only checked for order.
    pub input_is_sorted: bool,
    /// How repeated keys are resolved, within the input and against the
    /// existing contents.
    pub duplicate_handling: DuplicateHandling,
    /// Commit the tree once loading finishes.
    pub commit_on_completion: bool,
    /// Discard the existing contents instead of merging with them.
    pub replace_contents: bool,
}

impl Default for BulkInsertOptions {
    fn default() -> Self {
        Self {
            input_is_sorted: false,
            duplicate_handling: DuplicateHandling::RaisesException,
            commit_on_completion: true,
            replace_contents: false,
        }
    }
}

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    /// Loads `items` into the tree and returns the resulting entry count.
    ///
    /// The input is sorted (paging through temp files when serializers are
    /// configured), merged with the existing entries unless
    /// `replace_contents` is set, and appended to fresh nodes with
    /// left-heavy splits. Existing entries count as earlier than the input
    /// for duplicate handling. With `DuplicateHandling::None` a repeated key
    /// fails with `DuplicateKey`.
    ///
    /// The new nodes replace the current ones only once every entry is in,
    /// so a failed load leaves the contents unchanged. Loaded entries are
    /// not written to the transaction log; without `commit_on_completion`
    /// they stay uncommitted until the next commit and a rollback discards
    /// them.
    pub fn bulk_insert<'s, I>(&'s self, items: I, options: &BulkInsertOptions) -> Result<usize>
    where
        I: IntoIterator<Item = (K, V)>,
        I::IntoIter: 's,
    {
        self.ensure_writable()?;
        let _call = self.lock_call(true)?;

        let comparer = Arc::clone(&self.comparer);
        let pairs: Arc<dyn KeyComparer<(K, V)>> =
            Arc::new(FnComparer(move |a: &(K, V), b: &(K, V)| comparer.compare(&a.0, &b.0)));
        let handling = options.duplicate_handling;

        let input: OrderedIter<'s, (K, V)> = if options.input_is_sorted {
            with_duplicate_handling(
                Box::new(items.into_iter().map(Ok)),
                Arc::clone(&pairs),
                handling,
            )
        } else {
            let mut sorter = OrderedEnumeration::new(Arc::clone(&pairs)).duplicate_handling(handling);
            if let (Some(keys), Some(values)) = (&self.key_serializer, &self.value_serializer) {
                sorter = sorter.with_serializer(
                    Arc::new(PairSerializer::new(Arc::clone(keys), Arc::clone(values))),
                    DEFAULT_MEMORY_LIMIT,
                );
            }
            sorter.sort(items)?
        };

        let merged = if options.replace_contents {
            input
        } else {
            let existing: OrderedIter<'s, (K, V)> = Box::new(TreeIter::under_call_lock(self));
            with_duplicate_handling(merge(Arc::clone(&pairs), existing, input), pairs, handling)
        };
        let loaded = self.load_ordered(merged)?;

        if options.commit_on_completion {
            self.commit_locked()?;
        }
        info!(
            entries = loaded,
            replaced = options.replace_contents,
            "Bulk insert complete"
        );
        Ok(loaded)
    }

    /// Rebuilds the contents from the current entries with every operation
    /// in `log` applied over them. The caller holds the call lock
    /// exclusively. Returns the resulting entry count.
    pub(super) fn merge_log_locked(&self, log: &dyn TransactionLogger<K, V>) -> Result<usize> {
        let existing: OrderedIter<'_, (K, V)> = Box::new(TreeIter::under_call_lock(self));
        let merged = log.merge_log(Arc::clone(&self.comparer), existing)?;
        self.load_ordered(merged)
    }

    /// Appends an ascending stream to a staging root, then makes the staged
    /// subtree the tree's contents. The caller holds the call lock
    /// exclusively.
    ///
    /// The stream may read the current contents while it is consumed; they
    /// are untouched until the swap.
    fn load_ordered(&self, entries: OrderedIter<'_, (K, V)>) -> Result<usize> {
        let staging = self.create_staging_root()?;
        let result = self
            .append_all(staging, entries)
            .and_then(|loaded| self.swap_in(staging).map(|()| loaded));
        match result {
            Ok(loaded) => {
                if let Some(count) = self.count.lock().as_mut() {
                    *count = loaded;
                }
                Ok(loaded)
            }
            Err(e) => {
                if let Err(cleanup) = self.discard_staging(staging) {
                    warn!(%staging, error = %cleanup, "Failed to release staged nodes");
                }
                Err(e)
            }
        }
    }

    fn create_staging_root(&self) -> Result<StorageHandle> {
        let mut trans = NodeTransaction::staged(self);
        let mut leaf = trans.create(NodeKind::Leaf {
            entries: Vec::new(),
        })?;
        let mut root = trans.create(NodeKind::Root {
            child: leaf.handle(),
        })?;
        let handle = root.handle();
        trans.commit(&mut [&mut root, &mut leaf])?;
        Ok(handle)
    }

    fn append_all(&self, staging: StorageHandle, entries: OrderedIter<'_, (K, V)>) -> Result<usize> {
        let mut loaded = 0;
        for entry in entries {
            let (key, value) = entry?;
            let root = self.lock_node(staging, LockMode::Write)?;
            self.insert_from(root, &key, &mut InsertValue::new(value, false), true, true)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Points the root at the staged subtree and frees the old nodes in one
    /// transaction.
    fn swap_in(&self, staging: StorageHandle) -> Result<()> {
        let mut root = self.pin_root(LockMode::Write)?;
        let old_nodes = self.subtree_handles(Self::top_of(&root)?)?;
        let staged = self.lock_node(staging, LockMode::Write)?;
        let top = Self::top_of(&staged)?;

        let mut trans = self.begin_transaction();
        match root.node_mut()?.kind_mut() {
            NodeKind::Root { child } => *child = top,
            _ => return Err(ArborError::Internal("expected the root".to_string())),
        }
        trans.destroy(staged)?;
        let released = old_nodes.len();
        for handle in old_nodes {
            trans.release(handle);
        }
        trans.commit(&mut [&mut root])?;
        debug!(%top, released, "Swapped in bulk loaded nodes");
        Ok(())
    }

    /// Frees a staging root and everything under it.
    fn discard_staging(&self, staging: StorageHandle) -> Result<()> {
        let top = Self::top_of(&self.lock_node(staging, LockMode::Read)?)?;
        let mut handles = self.subtree_handles(top)?;
        handles.push(staging);
        let mut trans = NodeTransaction::staged(self);
        for handle in handles {
            trans.release(handle);
        }
        trans.commit(&mut [])
    }

    /// Handles of `top` and every node below it, level by level. Leaves
    /// are named by their parents and never loaded.
    fn subtree_handles(&self, top: StorageHandle) -> Result<Vec<StorageHandle>> {
        let mut handles = Vec::new();
        let mut level = vec![top];
        while let Some(&first) = level.first() {
            handles.extend_from_slice(&level);
            if self.lock_node(first, LockMode::Read)?.node().is_leaf() {
                break;
            }
            let mut next = Vec::new();
            for handle in &level {
                let pin = self.lock_node(*handle, LockMode::Read)?;
                let (_, children) = pin.node().branch()?;
                next.extend_from_slice(children);
            }
            level = next;
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::super::options::TreeOptions;
    use super::*;
    use arbor_common::{CreatePolicy, PrimitiveSerializer, TreeConfig};
    use tempfile::tempdir;

    fn small_tree() -> BPlusTree<u32, String> {
        let mut config = TreeConfig::default();
        config.minimum_value_nodes = 2;
        config.maximum_value_nodes = 8;
        config.minimum_child_nodes = 2;
        config.maximum_child_nodes = 8;
        BPlusTree::new(TreeOptions::ordered(config)).unwrap()
    }

    #[test]
    fn test_bulk_insert_unsorted_input() {
        let tree = small_tree();
        let items: Vec<(u32, String)> = (0..500).rev().map(|i| (i, i.to_string())).collect();
        let loaded = tree.bulk_insert(items, &BulkInsertOptions::default()).unwrap();
        assert_eq!(loaded, 500);
        tree.validate().unwrap();
        assert_eq!(tree.first().unwrap().0, 0);
        assert_eq!(tree.last().unwrap().0, 499);
    }

    #[test]
    fn test_bulk_insert_merges_with_existing() {
        let tree = small_tree();
        for i in (0..100).step_by(2) {
            tree.add(i, "old".to_string()).unwrap();
        }
        let options = BulkInsertOptions {
            duplicate_handling: DuplicateHandling::LastValueWins,
            ..Default::default()
        };
        let items: Vec<(u32, String)> = (0..100).step_by(5).map(|i| (i, "new".to_string())).collect();
        let loaded = tree.bulk_insert(items, &options).unwrap();
        assert_eq!(loaded, 50 + 10);
        assert_eq!(tree.get(&10).unwrap(), Some("new".to_string()));
        assert_eq!(tree.get(&2).unwrap(), Some("old".to_string()));
        assert_eq!(tree.get(&5).unwrap(), Some("new".to_string()));
        tree.validate().unwrap();
    }

    #[test]
    fn test_bulk_insert_first_value_wins_keeps_existing() {
        let tree = small_tree();
        tree.add(1, "old".to_string()).unwrap();
        let options = BulkInsertOptions {
            duplicate_handling: DuplicateHandling::FirstValueWins,
            ..Default::default()
        };
        let items = vec![(1, "a".to_string()), (2, "b".to_string()), (2, "c".to_string())];
        tree.bulk_insert(items, &options).unwrap();
        assert_eq!(tree.get(&1).unwrap(), Some("old".to_string()));
        assert_eq!(tree.get(&2).unwrap(), Some("b".to_string()));
    }

    #[test]
    fn test_bulk_insert_duplicate_fails_without_changes() {
        let tree = small_tree();
        tree.add(7, "seven".to_string()).unwrap();
        let items = vec![(1, "a".to_string()), (7, "b".to_string())];
        let err = tree
            .bulk_insert(items, &BulkInsertOptions::default())
            .unwrap_err();
        assert!(matches!(err, ArborError::DuplicateKey(_)));
        assert_eq!(tree.count().unwrap(), 1);
        assert_eq!(tree.get(&7).unwrap(), Some("seven".to_string()));
    }

    #[test]
    fn test_bulk_insert_sorted_input_is_checked() {
        let tree = small_tree();
        let options = BulkInsertOptions {
            input_is_sorted: true,
            ..Default::default()
        };
        let items = vec![(1, String::new()), (3, String::new()), (2, String::new())];
        let err = tree.bulk_insert(items, &options).unwrap_err();
        assert!(matches!(err, ArborError::OrderViolation(_)));
    }

    #[test]
    fn test_bulk_insert_replace_contents() {
        let tree = small_tree();
        for i in 0..20 {
            tree.add(i, String::new()).unwrap();
        }
        tree.enable_count().unwrap();
        let options = BulkInsertOptions {
            replace_contents: true,
            input_is_sorted: true,
            ..Default::default()
        };
        let items: Vec<(u32, String)> = (100..110).map(|i| (i, String::new())).collect();
        tree.bulk_insert(items, &options).unwrap();
        assert_eq!(tree.count().unwrap(), 10);
        assert!(!tree.contains_key(&0).unwrap());
        assert_eq!(tree.first().unwrap().0, 100);
    }

    fn disk_tree(path: &std::path::Path) -> BPlusTree<u32, String> {
        let mut config = TreeConfig::with_file(path);
        config.create_policy = CreatePolicy::IfNeeded;
        config.minimum_value_nodes = 2;
        config.maximum_value_nodes = 8;
        config.minimum_child_nodes = 2;
        config.maximum_child_nodes = 8;
        config.file_block_size = 512;
        let options = TreeOptions::ordered(config)
            .with_serializers(Arc::new(PrimitiveSerializer), Arc::new(PrimitiveSerializer));
        BPlusTree::new(options).unwrap()
    }

    fn contents(tree: &BPlusTree<u32, String>) -> Vec<(u32, String)> {
        tree.iter().collect::<Result<_>>().unwrap()
    }

    #[test]
    fn test_repeated_key_without_handling_keeps_contents() {
        let tree = small_tree();
        for i in 0..10 {
            tree.add(i, i.to_string()).unwrap();
        }
        tree.enable_count().unwrap();
        let before = contents(&tree);

        let options = BulkInsertOptions {
            duplicate_handling: DuplicateHandling::None,
            ..Default::default()
        };
        let items = vec![(3, "a".to_string()), (3, "b".to_string())];
        let err = tree.bulk_insert(items, &options).unwrap_err();
        assert!(matches!(err, ArborError::DuplicateKey(ref k) if k == "3"));
        assert_eq!(tree.count().unwrap(), 10);
        assert_eq!(contents(&tree), before);
        tree.validate().unwrap();
    }

    #[test]
    fn test_unordered_sorted_input_keeps_contents() {
        let tree = small_tree();
        for i in 0..40 {
            tree.add(i, i.to_string()).unwrap();
        }
        let before = contents(&tree);

        let options = BulkInsertOptions {
            input_is_sorted: true,
            replace_contents: true,
            ..Default::default()
        };
        let items = (100..200).chain([150]).map(|i| (i, String::new()));
        let err = tree.bulk_insert(items, &options).unwrap_err();
        assert!(matches!(err, ArborError::OrderViolation(_)));
        assert_eq!(contents(&tree), before);
        tree.validate().unwrap();

        // The tree stays usable after the failed load.
        tree.add(1000, "x".to_string()).unwrap();
        assert_eq!(tree.count().unwrap(), 41);
    }

    #[test]
    fn test_bulk_insert_merges_large_input_streaming() {
        let dir = tempdir().unwrap();
        let tree = disk_tree(&dir.path().join("large.dat"));
        for i in (0..2_000).step_by(3) {
            tree.add(i, "old".to_string()).unwrap();
        }
        tree.commit().unwrap();

        let options = BulkInsertOptions {
            duplicate_handling: DuplicateHandling::LastValueWins,
            ..Default::default()
        };
        let items: Vec<(u32, String)> = (0..2_000).rev().map(|i| (i, "new".to_string())).collect();
        assert_eq!(tree.bulk_insert(items, &options).unwrap(), 2_000);
        tree.validate().unwrap();
        assert_eq!(tree.get(&0).unwrap(), Some("new".to_string()));
        assert_eq!(tree.get(&1_999).unwrap(), Some("new".to_string()));
    }

    #[test]
    fn test_uncommitted_bulk_insert_rolls_back_on_disk() {
        let dir = tempdir().unwrap();
        let tree = disk_tree(&dir.path().join("bulk.dat"));
        for i in 0..100 {
            tree.add(i, format!("v{i}")).unwrap();
        }
        tree.commit().unwrap();
        let before = contents(&tree);

        let options = BulkInsertOptions {
            commit_on_completion: false,
            replace_contents: true,
            ..Default::default()
        };
        let items: Vec<(u32, String)> = (500..600).map(|i| (i, String::new())).collect();
        assert_eq!(tree.bulk_insert(items, &options).unwrap(), 100);
        assert!(!tree.contains_key(&0).unwrap());
        assert!(tree.contains_key(&550).unwrap());

        tree.rollback().unwrap();
        assert_eq!(contents(&tree), before);
        tree.validate().unwrap();
    }

    #[test]
    fn test_failed_bulk_insert_on_disk_keeps_committed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("failed.dat");
        let before = {
            let tree = disk_tree(&path);
            for i in 0..50 {
                tree.add(i, format!("v{i}")).unwrap();
            }
            tree.commit().unwrap();
            let options = BulkInsertOptions {
                duplicate_handling: DuplicateHandling::None,
                replace_contents: true,
                ..Default::default()
            };
            let items = vec![(1, "a".to_string()), (1, "b".to_string())];
            assert!(tree.bulk_insert(items, &options).is_err());
            contents(&tree)
        };
        assert_eq!(before.len(), 50);

        let tree = disk_tree(&path);
        assert_eq!(contents(&tree), before);
    }
}
