//! Abstraction over a transaction log implementation.

use crate::reader::ReplayTarget;
use crate::record::TransactionToken;
use crate::writer::TransactionLog;
use arbor_collections::OrderedIter;
use arbor_common::{KeyComparer, Result};
use std::path::Path;
use std::sync::Arc;

/// Write-ahead log as seen by a tree.
pub trait TransactionLogger<K, V>: Send + Sync {
    /// Returns the log file path.
    fn file_name(&self) -> &Path;

    /// Returns the log size in bytes.
    fn size(&self) -> Result<u64>;

    fn begin_transaction(&self) -> TransactionToken;

    fn add_value(&self, token: &mut TransactionToken, key: &K, value: &V) -> Result<()>;

    fn update_value(&self, token: &mut TransactionToken, key: &K, value: &V) -> Result<()>;

    fn remove_value(&self, token: &mut TransactionToken, key: &K) -> Result<()>;

    fn commit_transaction(&self, token: &mut TransactionToken) -> Result<()>;

    fn rollback_transaction(&self, token: &mut TransactionToken) -> Result<()>;

    /// Applies committed operations from `position` to `target`.
    fn replay_log(&self, target: &mut dyn ReplayTarget<K, V>, position: &mut u64)
    -> Result<usize>;

    /// Merges the log over an ordered stream of existing pairs.
    fn merge_log<'a>(
        &self,
        comparer: Arc<dyn KeyComparer<K>>,
        existing: OrderedIter<'a, (K, V)>,
    ) -> Result<OrderedIter<'a, (K, V)>>;

    /// Empties the log.
    fn truncate_log(&self) -> Result<()>;

    /// Flushes and closes the log.
    fn close(&self) -> Result<()>;
}

impl<K, V> TransactionLogger<K, V> for TransactionLog<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn file_name(&self) -> &Path {
        TransactionLog::file_name(self)
    }

    fn size(&self) -> Result<u64> {
        TransactionLog::size(self)
    }

    fn begin_transaction(&self) -> TransactionToken {
        TransactionLog::begin_transaction(self)
    }

    fn add_value(&self, token: &mut TransactionToken, key: &K, value: &V) -> Result<()> {
        TransactionLog::add_value(self, token, key, value)
    }

    fn update_value(&self, token: &mut TransactionToken, key: &K, value: &V) -> Result<()> {
        TransactionLog::update_value(self, token, key, value)
    }

    fn remove_value(&self, token: &mut TransactionToken, key: &K) -> Result<()> {
        TransactionLog::remove_value(self, token, key)
    }

    fn commit_transaction(&self, token: &mut TransactionToken) -> Result<()> {
        TransactionLog::commit_transaction(self, token)
    }

    fn rollback_transaction(&self, token: &mut TransactionToken) -> Result<()> {
        TransactionLog::rollback_transaction(self, token)
    }

    fn replay_log(
        &self,
        target: &mut dyn ReplayTarget<K, V>,
        position: &mut u64,
    ) -> Result<usize> {
        TransactionLog::replay_log(self, target, position)
    }

    fn merge_log<'a>(
        &self,
        comparer: Arc<dyn KeyComparer<K>>,
        existing: OrderedIter<'a, (K, V)>,
    ) -> Result<OrderedIter<'a, (K, V)>> {
        TransactionLog::merge_log(self, comparer, existing)
    }

    fn truncate_log(&self) -> Result<()> {
        TransactionLog::truncate_log(self)
    }

    fn close(&self) -> Result<()> {
        TransactionLog::close(self)
    }
}
