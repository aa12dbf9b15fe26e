//! Typed tree options: configuration plus key and value plumbing.

use super::{TreeKey, TreeValue};
use arbor_common::{
    ArborError, KeyComparer, OrdComparer, Result, Serializer, StorageType, TreeConfig,
};
use arbor_wal::TransactionLogger;
use std::sync::Arc;

/// Everything needed to open a tree.
///
/// `config` carries the serializable settings. Serializers are required for
/// disk storage, for a transaction log and for bulk inserts that spill to
/// disk. A custom `log` replaces the one the tree would otherwise open next
/// to its data file.
pub struct TreeOptions<K, V> {
    pub config: TreeConfig,
    pub comparer: Arc<dyn KeyComparer<K>>,
    pub key_serializer: Option<Arc<dyn Serializer<K>>>,
    pub value_serializer: Option<Arc<dyn Serializer<V>>>,
    pub log: Option<Arc<dyn TransactionLogger<K, V>>>,
}

impl<K: TreeKey, V: TreeValue> TreeOptions<K, V> {
    pub fn new(config: TreeConfig, comparer: Arc<dyn KeyComparer<K>>) -> Self {
        Self {
            config,
            comparer,
            key_serializer: None,
            value_serializer: None,
            log: None,
        }
    }

    /// Options ordered by the key's `Ord` implementation.
    pub fn ordered(config: TreeConfig) -> Self
    where
        K: Ord,
    {
        Self::new(config, Arc::new(OrdComparer))
    }

    pub fn with_serializers(
        mut self,
        keys: Arc<dyn Serializer<K>>,
        values: Arc<dyn Serializer<V>>,
    ) -> Self {
        self.key_serializer = Some(keys);
        self.value_serializer = Some(values);
        self
    }

    pub fn with_log(mut self, log: Arc<dyn TransactionLogger<K, V>>) -> Self {
        self.log = Some(log);
        self
    }

    /// Returns both serializers or explains which use needs them.
    pub(crate) fn serializers(
        &self,
        purpose: &str,
    ) -> Result<(Arc<dyn Serializer<K>>, Arc<dyn Serializer<V>>)> {
        match (&self.key_serializer, &self.value_serializer) {
            (Some(keys), Some(values)) => Ok((Arc::clone(keys), Arc::clone(values))),
            _ => Err(ArborError::config(
                "KeySerializer",
                format!("key and value serializers are required for {}", purpose),
            )),
        }
    }

    /// Checks the configuration and the serializers it implies.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.config.storage_type == StorageType::Disk {
            self.serializers("disk storage")?;
        }
        Ok(())
    }

    /// Returns true when the tree records writes in a transaction log.
    /// Memory trees never do.
    pub(crate) fn wants_log(&self) -> bool {
        self.config.storage_type == StorageType::Disk
            && (self.log.is_some() || self.config.storage_performance.uses_log())
    }
}

impl<K: TreeKey, V: TreeValue> Clone for TreeOptions<K, V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            comparer: Arc::clone(&self.comparer),
            key_serializer: self.key_serializer.clone(),
            value_serializer: self.value_serializer.clone(),
            log: self.log.clone(),
        }
    }
}
