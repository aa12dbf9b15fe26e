//! Configuration structures for Arbor trees.

use crate::error::{ArborError, Result};
use crate::handle::LockTimeout;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where tree nodes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StorageType {
    /// Nodes live in memory only.
    #[default]
    Memory,
    /// Nodes are stored in a transacted compound file.
    Disk,
}

/// Whether opening a disk tree may create the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CreatePolicy {
    /// The file must already exist.
    #[default]
    Never,
    /// Always start from a new, empty file.
    Always,
    /// Create the file only when it is missing or empty.
    IfNeeded,
}

/// How materialized nodes are retained between operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Nothing is cached; every access reloads from storage.
    None,
    /// Recently used nodes are kept alive by a bounded history.
    #[default]
    Recent,
    /// Every loaded node stays in memory.
    Full,
}

/// Durability and speed trade-off for disk storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StoragePerformance {
    /// Storage cache, no log, no commit on write.
    Fastest,
    /// Storage cache plus a transaction log without fsync.
    #[default]
    LogFileInCache,
    /// Every write commits to the OS cache.
    CommitToCache,
    /// Storage cache plus a transaction log with fsync.
    LogFileNoCache,
    /// Every write commits with fsync.
    CommitToDisk,
}

impl StoragePerformance {
    /// Returns true when node storage is wrapped in the write-back cache.
    pub fn uses_storage_cache(&self) -> bool {
        matches!(
            self,
            StoragePerformance::Fastest
                | StoragePerformance::LogFileInCache
                | StoragePerformance::LogFileNoCache
        )
    }

    /// Returns true when the compound file commits every write.
    pub fn commit_on_write(&self) -> bool {
        matches!(
            self,
            StoragePerformance::CommitToCache | StoragePerformance::CommitToDisk
        )
    }

    /// Returns true when the compound file syncs every write.
    pub fn fsync_data(&self) -> bool {
        matches!(self, StoragePerformance::CommitToDisk)
    }

    /// Returns true when writes are recorded in a transaction log.
    pub fn uses_log(&self) -> bool {
        matches!(
            self,
            StoragePerformance::LogFileInCache | StoragePerformance::LogFileNoCache
        )
    }

    /// Returns true when the transaction log syncs every record.
    pub fn fsync_log(&self) -> bool {
        matches!(self, StoragePerformance::LogFileNoCache)
    }
}

/// What to do with a transaction log found when the tree opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExistingLogAction {
    /// Truncate for a newly created file, otherwise replay and commit.
    #[default]
    Default,
    /// Leave the log untouched.
    Ignore,
    /// Apply the log to the tree without committing.
    Replay,
    /// Apply the log, commit the tree, then truncate the log.
    ReplayAndCommit,
    /// Discard the log.
    Truncate,
}

/// How ordered inputs treat repeated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicateHandling {
    /// Duplicates pass through unchanged.
    None,
    /// Keep the first occurrence.
    FirstValueWins,
    /// Keep the last occurrence.
    LastValueWins,
    /// Fail on the first duplicate.
    #[default]
    RaisesException,
}

/// Fan-out bounds shared by branch and leaf settings.
pub const MIN_FANOUT: usize = 4;
/// Upper fan-out bound.
pub const MAX_FANOUT: usize = 256;

/// Tree configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Storage backend.
    pub storage_type: StorageType,
    /// Path of the data file for disk storage.
    pub file_name: Option<PathBuf>,
    /// Whether a missing data file may be created.
    pub create_policy: CreatePolicy,
    /// Open the data file read only.
    pub read_only: bool,
    /// Node cache retention.
    pub cache_policy: CachePolicy,
    /// Durability mode for disk storage.
    pub storage_performance: StoragePerformance,
    /// Recovery action for an existing transaction log.
    pub existing_log_action: ExistingLogAction,
    /// Log size in bytes after which a write commits the tree (-1 = no limit).
    pub transaction_log_limit: i64,
    /// Path of the transaction log (defaults to the data file with a `.tlog` extension).
    pub log_file_name: Option<PathBuf>,
    /// Lock wait in milliseconds (-1 = infinite).
    pub lock_timeout_ms: i64,
    /// Minimum children per branch.
    pub minimum_child_nodes: usize,
    /// Maximum children per branch.
    pub maximum_child_nodes: usize,
    /// Minimum entries per leaf.
    pub minimum_value_nodes: usize,
    /// Maximum entries per leaf.
    pub maximum_value_nodes: usize,
    /// Compound file block size in bytes.
    pub file_block_size: u32,
    /// Maintain an O(1) entry count.
    pub enable_count: bool,
    /// Commit pending changes when the tree is dropped.
    pub commit_on_dispose: bool,
    /// Entries the recent cache always keeps.
    pub keep_alive_min_history: usize,
    /// Entries after which the recent cache trims regardless of age.
    pub keep_alive_max_history: usize,
    /// Age in milliseconds after which recent cache entries expire.
    pub keep_alive_timeout_ms: u64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Memory,
            file_name: None,
            create_policy: CreatePolicy::Never,
            read_only: false,
            cache_policy: CachePolicy::Recent,
            storage_performance: StoragePerformance::default(),
            existing_log_action: ExistingLogAction::Default,
            transaction_log_limit: -1,
            log_file_name: None,
            lock_timeout_ms: 120_000,
            minimum_child_nodes: 12,
            maximum_child_nodes: 32,
            minimum_value_nodes: 3,
            maximum_value_nodes: 8,
            file_block_size: 4096,
            enable_count: false,
            commit_on_dispose: true,
            keep_alive_min_history: 10,
            keep_alive_max_history: 100,
            keep_alive_timeout_ms: 60_000,
        }
    }
}

impl TreeConfig {
    /// Creates a configuration for a disk tree at `path`.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            storage_type: StorageType::Disk,
            file_name: Some(path.into()),
            ..Default::default()
        }
    }

    /// Sets both maximum fan-outs to `order` and both minimums to `max(2, order / 4)`.
    pub fn set_btree_order(&mut self, order: usize) -> Result<()> {
        if !(MIN_FANOUT..=MAX_FANOUT).contains(&order) {
            return Err(ArborError::config(
                "BTreeOrder",
                "The valid range is from 4 to 256.",
            ));
        }
        self.maximum_child_nodes = order;
        self.maximum_value_nodes = order;
        let min = (order >> 2).max(2);
        self.minimum_child_nodes = min;
        self.minimum_value_nodes = min;
        Ok(())
    }

    /// Derives fan-out from average key and value sizes and the block size.
    pub fn calculate_order(&mut self, avg_key_bytes: usize, avg_value_bytes: usize) {
        const CHILD_LINK_SIZE: usize = 8;
        let key = avg_key_bytes.min(u16::MAX as usize);
        let value = avg_value_bytes.min(u16::MAX as usize);
        let block = self.file_block_size as usize;

        let max_child = (block / (key + CHILD_LINK_SIZE)).clamp(MIN_FANOUT, MAX_FANOUT);
        let max_value = (block / (key + value).max(1)).clamp(MIN_FANOUT, MAX_FANOUT);

        self.maximum_child_nodes = max_child;
        self.minimum_child_nodes = (max_child / 3).max(2);
        self.maximum_value_nodes = max_value;
        self.minimum_value_nodes = (max_value / 3).max(2);
    }

    /// Sets the branch minimum; the valid range is 2 to half the maximum.
    pub fn set_minimum_child_nodes(&mut self, value: usize) -> Result<()> {
        check_minimum("MinimumChildNodes", value, self.maximum_child_nodes)?;
        self.minimum_child_nodes = value;
        Ok(())
    }

    /// Sets the branch maximum, lowering the minimum when it no longer fits.
    pub fn set_maximum_child_nodes(&mut self, value: usize) -> Result<()> {
        check_maximum("MaximumChildNodes", value)?;
        self.maximum_child_nodes = value;
        self.minimum_child_nodes = self.minimum_child_nodes.min(value / 2);
        Ok(())
    }

    /// Sets the leaf minimum; the valid range is 2 to half the maximum.
    pub fn set_minimum_value_nodes(&mut self, value: usize) -> Result<()> {
        check_minimum("MinimumValueNodes", value, self.maximum_value_nodes)?;
        self.minimum_value_nodes = value;
        Ok(())
    }

    /// Sets the leaf maximum, lowering the minimum when it no longer fits.
    pub fn set_maximum_value_nodes(&mut self, value: usize) -> Result<()> {
        check_maximum("MaximumValueNodes", value)?;
        self.maximum_value_nodes = value;
        self.minimum_value_nodes = self.minimum_value_nodes.min(value / 2);
        Ok(())
    }

    /// Target branch size for bulk loading.
    pub fn fill_child_nodes(&self) -> usize {
        ((self.maximum_child_nodes - self.minimum_child_nodes) >> 1) + self.minimum_child_nodes
    }

    /// Target leaf size for bulk loading.
    pub fn fill_value_nodes(&self) -> usize {
        ((self.maximum_value_nodes - self.minimum_value_nodes) >> 1) + self.minimum_value_nodes
    }

    /// Returns the configured lock wait.
    pub fn lock_timeout(&self) -> LockTimeout {
        LockTimeout::from_millis(self.lock_timeout_ms)
    }

    /// Returns the keep-alive timeout of the recent cache.
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    /// Returns the transaction log path, if the tree is file backed.
    pub fn log_file_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.log_file_name {
            return Some(path.clone());
        }
        self.file_name
            .as_ref()
            .map(|path| path.with_extension("tlog"))
    }

    /// Checks every setting for consistency.
    pub fn validate(&self) -> Result<()> {
        check_maximum("MaximumChildNodes", self.maximum_child_nodes)?;
        check_minimum(
            "MinimumChildNodes",
            self.minimum_child_nodes,
            self.maximum_child_nodes,
        )?;
        check_maximum("MaximumValueNodes", self.maximum_value_nodes)?;
        check_minimum(
            "MinimumValueNodes",
            self.minimum_value_nodes,
            self.maximum_value_nodes,
        )?;

        let block = self.file_block_size;
        if !(512..=0x10000).contains(&block) || !block.is_power_of_two() {
            return Err(ArborError::config(
                "FileBlockSize",
                "The valid range is from 512 bytes to 64 kilobytes in powers of 2.",
            ));
        }
        if self.lock_timeout_ms < -1 {
            return Err(ArborError::config(
                "LockTimeout",
                "The valid range is from -1 to MaxValue.",
            ));
        }
        if self.keep_alive_min_history > self.keep_alive_max_history {
            return Err(ArborError::config(
                "CacheKeepAliveMinimumHistory",
                "The minimum history cannot exceed the maximum history.",
            ));
        }
        if self.storage_type == StorageType::Disk && self.file_name.is_none() {
            return Err(ArborError::config(
                "StorageType",
                "Please provide the FileName to be used.",
            ));
        }
        if self.read_only {
            if self.create_policy != CreatePolicy::Never {
                return Err(ArborError::config(
                    "ReadOnly",
                    "ReadOnly can only be used when CreateFile is Never",
                ));
            }
            if self.storage_type != StorageType::Disk {
                return Err(ArborError::config(
                    "ReadOnly",
                    "ReadOnly can only be used with the file storage",
                ));
            }
        }
        Ok(())
    }
}

fn check_maximum(name: &str, value: usize) -> Result<()> {
    if !(MIN_FANOUT..=MAX_FANOUT).contains(&value) {
        return Err(ArborError::config(name, "The valid range is from 4 to 256."));
    }
    Ok(())
}

fn check_minimum(name: &str, value: usize, maximum: usize) -> Result<()> {
    if value < 2 || value > maximum / 2 {
        let max_name = if name.contains("Child") {
            "MaximumChildNodes"
        } else {
            "MaximumValueNodes"
        };
        return Err(ArborError::config(
            name,
            format!("The valid range is from 2 to ({} / 2).", max_name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_config_defaults() {
        let config = TreeConfig::default();
        assert_eq!(config.storage_type, StorageType::Memory);
        assert!(config.file_name.is_none());
        assert_eq!(config.create_policy, CreatePolicy::Never);
        assert_eq!(config.cache_policy, CachePolicy::Recent);
        assert_eq!(
            config.storage_performance,
            StoragePerformance::LogFileInCache
        );
        assert_eq!(config.existing_log_action, ExistingLogAction::Default);
        assert_eq!(config.transaction_log_limit, -1);
        assert_eq!(config.lock_timeout_ms, 120_000);
        assert_eq!(config.minimum_child_nodes, 12);
        assert_eq!(config.maximum_child_nodes, 32);
        assert_eq!(config.minimum_value_nodes, 3);
        assert_eq!(config.maximum_value_nodes, 8);
        assert_eq!(config.file_block_size, 4096);
        assert!(!config.enable_count);
        assert!(config.commit_on_dispose);
        assert_eq!(config.keep_alive_min_history, 10);
        assert_eq!(config.keep_alive_max_history, 100);
        assert_eq!(config.keep_alive_timeout_ms, 60_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fill_defaults() {
        let config = TreeConfig::default();
        assert_eq!(config.fill_child_nodes(), 22);
        assert_eq!(config.fill_value_nodes(), 5);
    }

    #[test]
    fn test_set_btree_order() {
        let mut config = TreeConfig::default();
        config.set_btree_order(16).unwrap();
        assert_eq!(config.maximum_child_nodes, 16);
        assert_eq!(config.maximum_value_nodes, 16);
        assert_eq!(config.minimum_child_nodes, 4);
        assert_eq!(config.minimum_value_nodes, 4);

        config.set_btree_order(4).unwrap();
        assert_eq!(config.minimum_value_nodes, 2);

        let err = config.set_btree_order(3).unwrap_err();
        assert!(err.to_string().contains("BTreeOrder"));
        assert!(config.set_btree_order(257).is_err());
    }

    #[test]
    fn test_calculate_order() {
        let mut config = TreeConfig::default();
        config.calculate_order(24, 200);
        // 4096 / 32 = 128 children, 4096 / 224 = 18 values
        assert_eq!(config.maximum_child_nodes, 128);
        assert_eq!(config.minimum_child_nodes, 42);
        assert_eq!(config.maximum_value_nodes, 18);
        assert_eq!(config.minimum_value_nodes, 6);
        assert!(config.validate().is_ok());

        config.calculate_order(0, 0);
        assert_eq!(config.maximum_child_nodes, 256);
        assert_eq!(config.maximum_value_nodes, 256);

        config.calculate_order(60_000, 60_000);
        assert_eq!(config.maximum_child_nodes, 4);
        assert_eq!(config.minimum_child_nodes, 2);
    }

    #[test]
    fn test_minimum_setters_validate_range() {
        let mut config = TreeConfig::default();
        assert!(config.set_minimum_child_nodes(16).is_ok());
        assert!(config.set_minimum_child_nodes(17).is_err());
        assert!(config.set_minimum_child_nodes(1).is_err());
        assert!(config.set_minimum_value_nodes(4).is_ok());
        let err = config.set_minimum_value_nodes(5).unwrap_err();
        assert!(matches!(err, ArborError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_maximum_setters_lower_minimum() {
        let mut config = TreeConfig::default();
        config.set_maximum_child_nodes(8).unwrap();
        assert_eq!(config.minimum_child_nodes, 4);
        config.set_maximum_value_nodes(256).unwrap();
        assert_eq!(config.minimum_value_nodes, 3);
        assert!(config.set_maximum_value_nodes(2).is_err());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_block_size() {
        let config = TreeConfig {
            file_block_size: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TreeConfig {
            file_block_size: 256,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TreeConfig {
            file_block_size: 65536,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_disk_and_read_only() {
        let config = TreeConfig {
            storage_type: StorageType::Disk,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TreeConfig {
            read_only: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TreeConfig {
            read_only: true,
            create_policy: CreatePolicy::IfNeeded,
            ..TreeConfig::with_file("data.db")
        };
        assert!(config.validate().is_err());

        let config = TreeConfig {
            read_only: true,
            ..TreeConfig::with_file("data.db")
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lock_timeout_conversion() {
        let config = TreeConfig {
            lock_timeout_ms: -1,
            ..Default::default()
        };
        assert_eq!(config.lock_timeout(), LockTimeout::Infinite);
        assert!(config.validate().is_ok());

        let config = TreeConfig {
            lock_timeout_ms: -2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_file_path() {
        let config = TreeConfig::default();
        assert!(config.log_file_path().is_none());

        let config = TreeConfig::with_file("/tmp/tree.db");
        assert_eq!(
            config.log_file_path(),
            Some(PathBuf::from("/tmp/tree.tlog"))
        );

        let config = TreeConfig {
            log_file_name: Some(PathBuf::from("/var/log/custom.log")),
            ..TreeConfig::with_file("/tmp/tree.db")
        };
        assert_eq!(
            config.log_file_path(),
            Some(PathBuf::from("/var/log/custom.log"))
        );
    }

    #[test]
    fn test_storage_performance_mapping() {
        use StoragePerformance::*;
        assert!(Fastest.uses_storage_cache() && !Fastest.uses_log());
        assert!(!Fastest.commit_on_write());
        assert!(LogFileInCache.uses_log() && !LogFileInCache.fsync_log());
        assert!(LogFileNoCache.uses_log() && LogFileNoCache.fsync_log());
        assert!(LogFileNoCache.uses_storage_cache());
        assert!(CommitToCache.commit_on_write() && !CommitToCache.fsync_data());
        assert!(!CommitToCache.uses_storage_cache());
        assert!(CommitToDisk.commit_on_write() && CommitToDisk.fsync_data());
        assert!(!CommitToDisk.uses_log());
    }

    #[test]
    fn test_tree_config_serde_roundtrip() {
        let mut original = TreeConfig::with_file("/data/tree.db");
        original.cache_policy = CachePolicy::Full;
        original.enable_count = true;
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: TreeConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.file_name, deserialized.file_name);
        assert_eq!(original.storage_type, deserialized.storage_type);
        assert_eq!(original.cache_policy, deserialized.cache_policy);
        assert_eq!(original.enable_count, deserialized.enable_count);
        assert_eq!(original.file_block_size, deserialized.file_block_size);
    }

    #[test]
    fn test_enum_defaults() {
        assert_eq!(StorageType::default(), StorageType::Memory);
        assert_eq!(CreatePolicy::default(), CreatePolicy::Never);
        assert_eq!(CachePolicy::default(), CachePolicy::Recent);
        assert_eq!(ExistingLogAction::default(), ExistingLogAction::Default);
        assert_eq!(
            DuplicateHandling::default(),
            DuplicateHandling::RaisesException
        );
    }

    #[test]
    fn test_enum_serde_roundtrip() {
        for policy in [CachePolicy::None, CachePolicy::Recent, CachePolicy::Full] {
            let serialized = serde_json::to_string(&policy).unwrap();
            let deserialized: CachePolicy = serde_json::from_str(&serialized).unwrap();
            assert_eq!(policy, deserialized);
        }
        for action in [
            ExistingLogAction::Default,
            ExistingLogAction::Ignore,
            ExistingLogAction::Replay,
            ExistingLogAction::ReplayAndCommit,
            ExistingLogAction::Truncate,
        ] {
            let serialized = serde_json::to_string(&action).unwrap();
            let deserialized: ExistingLogAction = serde_json::from_str(&serialized).unwrap();
            assert_eq!(action, deserialized);
        }
    }
}
