//! The B+Tree dictionary.

use super::node::{Node, NodeLimits};
use super::options::TreeOptions;
use super::recovery;
use super::strategy::{
    AddIfAbsent, InsertResult, InsertValue, InsertionInfo, RemoveAny, RemoveIf, UpdateInfo,
    UpdateWith,
};
use super::transaction::NodeTransaction;
use super::{TreeKey, TreeValue};
use crate::store::NodeStorage;
use arbor_common::{
    ArborError, KeyComparer, LockTimeout, Result, Serializer, StorageHandle, TreeConfig,
};
use arbor_wal::{ReplayTarget, TransactionLogger};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Node storage as seen by the tree.
pub(crate) type TreeStorage<K, V> = Box<dyn NodeStorage<Arc<Node<K, V>>>>;

/// Ordered dictionary backed by a B+Tree.
///
/// All operations take `&self` and may run from many threads at once.
/// Readers and writers lock-couple down the tree, so operations on
/// different subtrees proceed in parallel. Whole-tree operations such as
/// [`commit`](Self::commit) and [`clear`](Self::clear) wait for in-flight
/// operations and block new ones while they run.
///
/// # Example
///
/// ```
/// use arbor_common::TreeConfig;
/// use arbor_storage::{BPlusTree, TreeOptions};
///
/// let tree: BPlusTree<u32, String> =
///     BPlusTree::new(TreeOptions::ordered(TreeConfig::default()))?;
/// tree.add(2, "two".to_string())?;
/// tree.add(1, "one".to_string())?;
/// assert_eq!(tree.get(&1)?, Some("one".to_string()));
/// assert_eq!(tree.first()?.0, 1);
/// # Ok::<(), arbor_common::ArborError>(())
/// ```
pub struct BPlusTree<K: TreeKey, V: TreeValue> {
    pub(super) config: TreeConfig,
    pub(super) comparer: Arc<dyn KeyComparer<K>>,
    pub(super) key_serializer: Option<Arc<dyn Serializer<K>>>,
    pub(super) value_serializer: Option<Arc<dyn Serializer<V>>>,
    pub(super) storage: TreeStorage<K, V>,
    pub(super) cache: super::cache::NodeCache<K, V>,
    pub(super) log: Option<Arc<dyn TransactionLogger<K, V>>>,
    pub(super) root: StorageHandle,
    pub(super) limits: NodeLimits,
    pub(super) timeout: LockTimeout,
    pub(super) call_lock: RwLock<()>,
    /// Entry count, maintained only once counting is enabled.
    pub(super) count: Mutex<Option<usize>>,
    pub(super) read_only: bool,
}

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    /// Opens or creates a tree as described by `options`.
    ///
    /// For disk trees this opens the data file, recovers the transaction
    /// log according to `existing_log_action` and attaches the log for
    /// later writes.
    pub fn new(options: TreeOptions<K, V>) -> Result<Self> {
        options.validate()?;
        let (storage, created) = recovery::create_storage(&options)?;
        let log = recovery::open_log(&options)?;
        Self::open(options, storage, created, log)
    }

    /// Opens a tree over caller-supplied storage.
    pub fn with_storage(options: TreeOptions<K, V>, storage: TreeStorage<K, V>) -> Result<Self> {
        options.config.validate()?;
        let log = options.log.clone();
        Self::open(options, storage, false, log)
    }

    fn open(
        options: TreeOptions<K, V>,
        storage: TreeStorage<K, V>,
        created: bool,
        log: Option<Arc<dyn TransactionLogger<K, V>>>,
    ) -> Result<Self> {
        let config = options.config;
        let (root, is_new) = storage.open_root()?;
        let mut tree = Self {
            comparer: options.comparer,
            key_serializer: options.key_serializer,
            value_serializer: options.value_serializer,
            cache: super::cache::NodeCache::new(
                config.cache_policy,
                config.keep_alive_min_history,
                config.keep_alive_max_history,
                config.keep_alive_timeout(),
            ),
            storage,
            log: None,
            root,
            limits: NodeLimits {
                min_children: config.minimum_child_nodes,
                max_children: config.maximum_child_nodes,
                min_values: config.minimum_value_nodes,
                max_values: config.maximum_value_nodes,
            },
            timeout: config.lock_timeout(),
            call_lock: RwLock::new(()),
            count: Mutex::new(None),
            read_only: config.read_only,
            config,
        };

        if is_new {
            tree.create_empty_root()?;
        }
        if let Some(log) = log {
            recovery::recover(&mut tree, log.as_ref(), created)?;
            tree.log = Some(log);
        }
        if tree.config.enable_count {
            let count = tree.count_values()?;
            *tree.count.lock() = Some(count);
        }
        debug!(
            storage = ?tree.config.storage_type,
            is_new,
            logged = tree.log.is_some(),
            "Opened tree"
        );
        Ok(tree)
    }

    /// Returns the configuration the tree was opened with.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn comparer(&self) -> &Arc<dyn KeyComparer<K>> {
        &self.comparer
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(super) fn begin_transaction(&self) -> NodeTransaction<'_, K, V> {
        NodeTransaction::new(self)
    }

    pub(super) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(ArborError::ReadOnly);
        }
        Ok(())
    }

    pub(super) fn adjust_count(&self, delta: isize) {
        if let Some(count) = self.count.lock().as_mut() {
            *count = count.saturating_add_signed(delta);
        }
    }

    /// Commits once the transaction log has outgrown its limit.
    pub(super) fn after_write(&self) -> Result<()> {
        let limit = self.config.transaction_log_limit;
        let Some(log) = &self.log else {
            return Ok(());
        };
        if limit <= 0 {
            return Ok(());
        }
        let size = log.size()?;
        if size > limit as u64 {
            info!(size, limit, "Transaction log over its limit, committing");
            self.commit()?;
        }
        Ok(())
    }

    // -- writes --

    /// Adds a new entry. Fails with `DuplicateKey` if the key exists.
    pub fn add(&self, key: K, value: V) -> Result<()> {
        self.insert_with(&key, &mut InsertValue::new(value, false), false)
            .map(|_| ())
    }

    /// Adds an entry if the key is absent. Returns true if it was added.
    pub fn try_add(&self, key: K, value: V) -> Result<bool> {
        let result = self.insert_with(&key, &mut AddIfAbsent::new(value), false)?;
        Ok(result == InsertResult::Inserted)
    }

    /// Sets the value for `key`, adding or overwriting.
    pub fn insert(&self, key: K, value: V) -> Result<InsertResult> {
        self.insert_with(&key, &mut InsertValue::new(value, true), false)
    }

    /// Returns the value for `key`, adding `value` first if it is absent.
    pub fn get_or_add(&self, key: K, value: V) -> Result<V> {
        let mut info = InsertionInfo::with_value(value);
        self.insert_with(&key, &mut info, false)?;
        info.into_value()
            .ok_or_else(|| ArborError::Internal("insert resolved no value".to_string()))
    }

    /// Adds `value` for an absent key, or replaces an existing value with
    /// the result of `update`. Returns the value now stored.
    pub fn add_or_update<F>(&self, key: K, value: V, update: F) -> Result<V>
    where
        F: FnMut(&K, &V) -> V,
    {
        let mut info = InsertionInfo::with_value(value).or_update(update);
        self.insert_with(&key, &mut info, false)?;
        info.into_value()
            .ok_or_else(|| ArborError::Internal("insert resolved no value".to_string()))
    }

    /// Replaces the value of an existing key. Returns false if absent.
    pub fn try_update(&self, key: &K, value: V) -> Result<bool> {
        self.update_with(key, &mut UpdateInfo::new(value))
    }

    /// Replaces the value of an existing key only while it equals
    /// `expected`.
    pub fn try_update_if(&self, key: &K, value: V, expected: &V) -> Result<bool> {
        self.update_with(key, &mut UpdateInfo::if_equals(value, expected.clone()))
    }

    /// Rewrites the value of an existing key with `update`.
    pub fn try_update_with<F>(&self, key: &K, update: F) -> Result<bool>
    where
        F: FnMut(&K, &V) -> V,
    {
        self.update_with(key, &mut UpdateWith::new(update))
    }

    /// Removes `key`. Returns true if it was present.
    pub fn remove(&self, key: &K) -> Result<bool> {
        self.remove_with(key, &mut RemoveAny::new())
    }

    /// Removes `key` and returns its value.
    pub fn try_remove(&self, key: &K) -> Result<Option<V>> {
        let mut strategy = RemoveAny::new();
        self.remove_with(key, &mut strategy)?;
        Ok(strategy.into_removed())
    }

    /// Removes `key` if `condition` accepts its entry.
    pub fn remove_if<F>(&self, key: &K, condition: F) -> Result<bool>
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.remove_with(key, &mut RemoveIf::new(condition))
    }

    // -- whole tree --

    /// Returns the number of entries. O(1) once counting is enabled,
    /// otherwise a full scan.
    pub fn count(&self) -> Result<usize> {
        if let Some(count) = *self.count.lock() {
            return Ok(count);
        }
        let _call = self.lock_call(false)?;
        self.count_values()
    }

    /// Counts every entry once and maintains the count from then on.
    pub fn enable_count(&self) -> Result<usize> {
        let _call = self.lock_call(true)?;
        let count = self.count_values()?;
        *self.count.lock() = Some(count);
        Ok(count)
    }

    /// Makes all changes durable and empties the transaction log.
    pub fn commit(&self) -> Result<()> {
        let _call = self.lock_call(true)?;
        self.commit_locked()
    }

    pub(super) fn commit_locked(&self) -> Result<()> {
        self.ensure_writable()?;
        self.storage.commit()?;
        if let Some(log) = &self.log {
            log.truncate_log()?;
        }
        debug!("Committed tree");
        Ok(())
    }

    /// Discards every change since the last commit.
    ///
    /// Only transacted storage supports this.
    pub fn rollback(&self) -> Result<()> {
        let _call = self.lock_call(true)?;
        self.rollback_locked()
    }

    pub(super) fn rollback_locked(&self) -> Result<()> {
        self.ensure_writable()?;
        if !self.storage.is_transactable() {
            return Err(ArborError::InvalidOperation(
                "the storage does not support rollback".to_string(),
            ));
        }
        self.storage.rollback()?;
        self.cache.clear();
        if let Some(log) = &self.log {
            log.truncate_log()?;
        }
        let recount = self.count.lock().is_some();
        if recount {
            let count = self.count_values()?;
            *self.count.lock() = Some(count);
        }
        debug!("Rolled back tree");
        Ok(())
    }

    /// Removes every entry.
    pub fn clear(&self) -> Result<()> {
        let _call = self.lock_call(true)?;
        self.clear_locked()
    }

    pub(super) fn clear_locked(&self) -> Result<()> {
        self.ensure_writable()?;
        self.storage.reset()?;
        self.cache.clear();
        self.create_empty_root()?;
        if let Some(log) = &self.log {
            log.truncate_log()?;
        }
        if let Some(count) = self.count.lock().as_mut() {
            *count = 0;
        }
        Ok(())
    }

    /// Drops every cached node. Later reads load from storage again.
    pub fn unload_cache(&self) -> Result<()> {
        let _call = self.lock_call(true)?;
        self.cache.clear();
        Ok(())
    }
}

impl<K: TreeKey, V: TreeValue> ReplayTarget<K, V> for BPlusTree<K, V> {
    fn replay_set(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value).map(|_| ())
    }

    fn replay_remove(&mut self, key: &K) -> Result<()> {
        self.remove(key).map(|_| ())
    }
}

impl<K: TreeKey, V: TreeValue> Drop for BPlusTree<K, V> {
    fn drop(&mut self) {
        if !self.read_only && self.storage.is_transactable() {
            let result = if self.config.commit_on_dispose {
                self.commit_locked()
            } else {
                self.rollback_locked()
            };
            if let Err(e) = result {
                warn!(error = %e, "Failed to finish tree on drop");
            }
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.close() {
                warn!(error = %e, "Failed to close transaction log");
            }
        }
    }
}
