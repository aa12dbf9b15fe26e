//! Opening storage and the transaction log, log recovery, and raw file
//! enumeration.

use super::bplus::{BPlusTree, TreeStorage};
use super::node::{Node, NodeKind, NodeSerializer};
use super::options::TreeOptions;
use super::{TreeKey, TreeValue};
use crate::compound::CompoundFileConfig;
use crate::store::{BTreeFileStore, BTreeMemoryStore, NodeStorage, StorageCache};
use arbor_common::{
    ArborError, CreatePolicy, ExistingLogAction, Result, StorageHandle, StorageType,
};
use arbor_wal::{TransactionLog, TransactionLogConfig, TransactionLogger};
use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds the node storage for `options`. Also reports whether a new data
/// file was created.
pub(super) fn create_storage<K: TreeKey, V: TreeValue>(
    options: &TreeOptions<K, V>,
) -> Result<(TreeStorage<K, V>, bool)> {
    let config = &options.config;
    if config.storage_type == StorageType::Memory {
        return Ok((Box::new(BTreeMemoryStore::new()), true));
    }

    let path = config
        .file_name
        .clone()
        .ok_or_else(|| ArborError::config("FileName", "disk storage requires a file name"))?;
    let mut exists = path.exists();
    if exists && !config.read_only && fs::metadata(&path)?.len() == 0 {
        // An empty file never held a tree; treat it as missing.
        fs::remove_file(&path)?;
        exists = false;
    }
    let create_new = match config.create_policy {
        CreatePolicy::Always => true,
        CreatePolicy::IfNeeded => !exists,
        CreatePolicy::Never => false,
    };
    if !exists && !create_new {
        return Err(ArborError::config(
            "CreateFile",
            "The file does not exist and CreateFile is Never",
        ));
    }

    let performance = config.storage_performance;
    let mut file = CompoundFileConfig::new(&path);
    file.block_size = config.file_block_size;
    file.create_new = create_new;
    file.read_only = config.read_only;
    file.commit_on_write = performance.commit_on_write();
    file.fsync = performance.fsync_data();

    let (keys, values) = options.serializers("disk storage")?;
    let store = BTreeFileStore::open(file, Arc::new(NodeSerializer::new(keys, values)))?;
    let storage: TreeStorage<K, V> = if performance.uses_storage_cache() && !config.read_only {
        Box::new(StorageCache::new(
            Box::new(store),
            config.keep_alive_max_history,
        ))
    } else {
        Box::new(store)
    };
    debug!(
        path = %path.display(),
        create_new,
        ?performance,
        "Opened tree storage"
    );
    Ok((storage, create_new))
}

/// Opens the transaction log the tree should write to, if any.
pub(super) fn open_log<K: TreeKey, V: TreeValue>(
    options: &TreeOptions<K, V>,
) -> Result<Option<Arc<dyn TransactionLogger<K, V>>>> {
    if !options.wants_log() {
        return Ok(None);
    }
    if let Some(log) = &options.log {
        return Ok(Some(Arc::clone(log)));
    }
    let config = &options.config;
    let file_name = config
        .log_file_path()
        .ok_or_else(|| ArborError::config("LogFileName", "a transaction log needs a path"))?;
    let (keys, values) = options.serializers("the transaction log")?;
    let log = TransactionLog::new(
        TransactionLogConfig {
            file_name,
            read_only: config.read_only,
            fsync_enabled: config.storage_performance.fsync_log(),
        },
        keys,
        values,
    )?;
    Ok(Some(Arc::new(log)))
}

/// Applies `existing_log_action` to a log found at open.
///
/// Runs before the log is attached, so replayed writes are not logged a
/// second time. `Replay` applies the operations one at a time and leaves
/// them uncommitted. `ReplayAndCommit` merges the sorted log with the
/// committed entries, bulk loads the result into fresh nodes and commits.
pub(super) fn recover<K: TreeKey, V: TreeValue>(
    tree: &mut BPlusTree<K, V>,
    log: &dyn TransactionLogger<K, V>,
    created: bool,
) -> Result<()> {
    let action = match tree.config.existing_log_action {
        ExistingLogAction::Default if created => ExistingLogAction::Truncate,
        ExistingLogAction::Default => ExistingLogAction::ReplayAndCommit,
        action => action,
    };
    if tree.read_only {
        if action != ExistingLogAction::Ignore {
            warn!(?action, "Read-only tree leaves its transaction log untouched");
        }
        return Ok(());
    }

    match action {
        ExistingLogAction::Ignore | ExistingLogAction::Default => {}
        ExistingLogAction::Truncate => {
            log.truncate_log()?;
            debug!(path = %log.file_name().display(), "Discarded transaction log");
        }
        ExistingLogAction::Replay => {
            let mut position = 0;
            let applied = log.replay_log(tree, &mut position)?;
            if applied > 0 {
                info!(
                    path = %log.file_name().display(),
                    applied,
                    position,
                    "Replayed transaction log"
                );
            }
        }
        ExistingLogAction::ReplayAndCommit => {
            if log.size()? > 0 {
                let _call = tree.lock_call(true)?;
                let entries = tree.merge_log_locked(log)?;
                info!(
                    path = %log.file_name().display(),
                    entries,
                    "Merged transaction log into tree"
                );
            }
            tree.commit_locked()?;
            log.truncate_log()?;
        }
    }
    Ok(())
}

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    /// Reads every entry of a file-backed tree straight from storage.
    ///
    /// The file is opened read only, no log is consulted and nodes are
    /// visited without locks or caching, so this works on a file no tree
    /// has open and serves as a salvage tool.
    pub fn enumerate_file(options: &TreeOptions<K, V>) -> Result<FileEntries<K, V>> {
        let mut options = options.clone();
        options.config.read_only = true;
        options.config.create_policy = CreatePolicy::Never;
        options.validate()?;
        let (storage, _) = create_storage(&options)?;
        let (root, is_new) = storage.open_root()?;
        let mut stack = Vec::new();
        if !is_new {
            stack.push(root);
        }
        Ok(FileEntries {
            storage,
            stack,
            pending: VecDeque::new(),
            failed: false,
        })
    }
}

/// Entries of a tree file in key order, produced by
/// [`BPlusTree::enumerate_file`].
pub struct FileEntries<K, V> {
    storage: TreeStorage<K, V>,
    stack: Vec<StorageHandle>,
    pending: VecDeque<(K, V)>,
    failed: bool,
}

impl<K: Clone, V: Clone> FileEntries<K, V> {
    fn load(&self, handle: StorageHandle) -> Result<Arc<Node<K, V>>> {
        let node = self
            .storage
            .try_get_node(handle)?
            .ok_or_else(|| ArborError::InvalidNodeHandle(handle.to_string()))?;
        if node.handle() != handle {
            return Err(ArborError::InvalidNodeHandle(format!(
                "{} holds node {}",
                handle,
                node.handle()
            )));
        }
        Ok(node)
    }

    fn advance(&mut self) -> Result<()> {
        while self.pending.is_empty() {
            let Some(handle) = self.stack.pop() else {
                return Ok(());
            };
            let node = self.load(handle)?;
            match node.kind() {
                NodeKind::Root { child } => self.stack.push(*child),
                NodeKind::Branch { children, .. } => self.stack.extend(children.iter().rev()),
                NodeKind::Leaf { entries } => self.pending.extend(entries.iter().cloned()),
            }
        }
        Ok(())
    }
}

impl<K: Clone, V: Clone> Iterator for FileEntries<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.advance() {
            self.failed = true;
            return Some(Err(e));
        }
        self.pending.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::{PrimitiveSerializer, StoragePerformance, TreeConfig};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn disk_options(path: &std::path::Path) -> TreeOptions<u32, String> {
        let mut config = TreeConfig::with_file(path);
        config.create_policy = CreatePolicy::IfNeeded;
        config.minimum_value_nodes = 2;
        config.maximum_value_nodes = 4;
        config.minimum_child_nodes = 2;
        config.maximum_child_nodes = 4;
        config.file_block_size = 512;
        TreeOptions::ordered(config)
            .with_serializers(Arc::new(PrimitiveSerializer), Arc::new(PrimitiveSerializer))
    }

    #[test]
    fn test_missing_file_with_never_policy() {
        let dir = tempdir().unwrap();
        let mut options = disk_options(&dir.path().join("none.dat"));
        options.config.create_policy = CreatePolicy::Never;
        let err = BPlusTree::new(options).err().unwrap();
        assert!(matches!(
            err,
            ArborError::InvalidConfiguration { ref name, .. } if name == "CreateFile"
        ));
    }

    #[test]
    fn test_empty_file_is_recreated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.dat");
        fs::write(&path, b"").unwrap();
        let tree = BPlusTree::new(disk_options(&path)).unwrap();
        tree.add(1, "one".to_string()).unwrap();
        assert_eq!(tree.get(&1).unwrap(), Some("one".to_string()));
    }

    #[test]
    fn test_disk_tree_requires_serializers() {
        let dir = tempdir().unwrap();
        let mut options = disk_options(&dir.path().join("s.dat"));
        options.key_serializer = None;
        assert!(matches!(
            BPlusTree::new(options).err().unwrap(),
            ArborError::InvalidConfiguration { .. }
        ));
    }

    #[test]
    fn test_enumerate_file_reads_committed_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enum.dat");
        let options = disk_options(&path);
        {
            let tree = BPlusTree::new(options.clone()).unwrap();
            for i in (0..50).rev() {
                tree.add(i, format!("v{i}")).unwrap();
            }
            tree.commit().unwrap();
        }
        let entries: Vec<(u32, String)> = BPlusTree::enumerate_file(&options)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0], (0, "v0".to_string()));
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_replay_recovers_uncommitted_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.dat");
        let mut options = disk_options(&path);
        options.config.storage_performance = StoragePerformance::LogFileNoCache;
        options.config.commit_on_dispose = false;
        {
            let tree = BPlusTree::new(options.clone()).unwrap();
            tree.add(1, "committed".to_string()).unwrap();
            tree.commit().unwrap();
            tree.add(2, "logged".to_string()).unwrap();
            tree.remove(&1).unwrap();
            // Simulate a crash: skip Drop so nothing is rolled back.
            std::mem::forget(tree);
        }

        let tree = BPlusTree::new(options).unwrap();
        assert_eq!(tree.get(&1).unwrap(), None);
        assert_eq!(tree.get(&2).unwrap(), Some("logged".to_string()));
        let log = tree.config().log_file_path().unwrap();
        assert_eq!(fs::metadata(log).map(|m| m.len()).unwrap_or(0), 0);
    }

    #[test]
    fn test_merged_log_matches_applied_operations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("merge.dat");
        let mut options = disk_options(&path);
        options.config.storage_performance = StoragePerformance::LogFileNoCache;
        options.config.commit_on_dispose = false;
        let mut expected = BTreeMap::new();
        {
            let tree = BPlusTree::new(options.clone()).unwrap();
            for i in 0..100 {
                tree.add(i, format!("c{i}")).unwrap();
                expected.insert(i, format!("c{i}"));
            }
            tree.commit().unwrap();
            for i in (0..150).step_by(2) {
                tree.insert(i, format!("l{i}")).unwrap();
                expected.insert(i, format!("l{i}"));
            }
            for i in (0..150).step_by(3) {
                tree.remove(&i).unwrap();
                expected.remove(&i);
            }
            std::mem::forget(tree);
        }

        let tree = BPlusTree::new(options).unwrap();
        tree.validate().unwrap();
        let entries: Vec<(u32, String)> = tree.iter().collect::<Result<_>>().unwrap();
        assert_eq!(entries, expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_replay_action_leaves_changes_uncommitted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uncommitted.dat");
        let mut options = disk_options(&path);
        options.config.storage_performance = StoragePerformance::LogFileNoCache;
        options.config.commit_on_dispose = false;
        {
            let tree = BPlusTree::new(options.clone()).unwrap();
            tree.add(1, "one".to_string()).unwrap();
            tree.commit().unwrap();
            tree.add(2, "two".to_string()).unwrap();
            std::mem::forget(tree);
        }

        options.config.existing_log_action = ExistingLogAction::Replay;
        let tree = BPlusTree::new(options).unwrap();
        assert_eq!(tree.get(&2).unwrap(), Some("two".to_string()));
        let log = tree.config().log_file_path().unwrap();
        assert!(fs::metadata(log).unwrap().len() > 0);
        tree.rollback().unwrap();
        assert_eq!(tree.get(&2).unwrap(), None);
        assert_eq!(tree.get(&1).unwrap(), Some("one".to_string()));
    }
}
