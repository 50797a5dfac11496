//! Tree configuration and durability levels
//!
//! A single `sst_size` threshold governs both when the active memtable is
//! frozen and where flush/compaction outputs are split into separate files.

use crate::storage::lsm::memtable::{MemTableFactory, MemTableKind};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Durability level of WAL appends
///
/// - Synchronous: every append is followed by `sync_data`
/// - NoSync: appends reach the OS page cache only (tests, bulk loads)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DurabilityLevel {
    /// fsync after every record. A successful put survives a power loss.
    #[default]
    Synchronous,

    /// No fsync. A successful put survives a process crash but not a power loss.
    NoSync,
}

impl DurabilityLevel {
    pub fn synchronous() -> Self {
        Self::Synchronous
    }

    pub fn no_sync() -> Self {
        Self::NoSync
    }

    pub(crate) fn syncs_each_write(&self) -> bool {
        matches!(self, Self::Synchronous)
    }
}

/// Tree configuration
#[derive(Clone)]
pub struct TreeConfig {
    /// Root directory; SSTables live here, WAL segments under `walfile/`
    pub dir: PathBuf,

    /// Number of levels (>= 1)
    pub max_level: usize,

    /// Factory producing a fresh empty memtable
    pub memtable_factory: MemTableFactory,

    /// SSTable size threshold in bytes (flush trigger and output split size)
    pub sst_size: u64,

    /// Target uncompressed data block size (default 4KB)
    pub block_size: usize,

    /// Bloom filter bits per key (default 10, ~1% false positives)
    pub bloom_bits_per_key: usize,

    /// Snappy-compress data blocks when it makes them smaller
    pub enable_compression: bool,

    /// L0 node count that triggers an L0 compaction (default 4)
    pub l0_compaction_trigger: usize,

    /// Size ratio between consecutive levels (default 10)
    pub level_multiplier: u64,

    /// Number of decoded data blocks kept in the shared LRU cache (0 disables it)
    pub block_cache_capacity: usize,

    /// WAL fsync policy
    pub durability: DurabilityLevel,

    /// Delay before a failed flush or compaction is retried
    pub retry_interval: Duration,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./lsmkv_data"),
            max_level: 7,
            memtable_factory: MemTableKind::BTree.factory(),
            sst_size: 4 * 1024 * 1024, // 4MB
            block_size: 4 * 1024,      // 4KB
            bloom_bits_per_key: 10,
            enable_compression: true,
            l0_compaction_trigger: 4,
            level_multiplier: 10,
            block_cache_capacity: 1024,
            durability: DurabilityLevel::Synchronous,
            retry_interval: Duration::from_millis(200),
        }
    }
}

impl TreeConfig {
    /// Default configuration rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Small thresholds and no fsync, so tests exercise flush and compaction quickly
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_level: 4,
            sst_size: 4 * 1024,
            block_size: 512,
            l0_compaction_trigger: 2,
            level_multiplier: 4,
            block_cache_capacity: 64,
            durability: DurabilityLevel::NoSync,
            retry_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    pub fn with_max_level(mut self, max_level: usize) -> Self {
        self.max_level = max_level;
        self
    }

    pub fn with_sst_size(mut self, sst_size: u64) -> Self {
        self.sst_size = sst_size;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_memtable(mut self, kind: MemTableKind) -> Self {
        self.memtable_factory = kind.factory();
        self
    }

    pub fn with_memtable_factory(mut self, factory: MemTableFactory) -> Self {
        self.memtable_factory = factory;
        self
    }

    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    pub fn with_l0_compaction_trigger(mut self, trigger: usize) -> Self {
        self.l0_compaction_trigger = trigger;
        self
    }

    pub fn with_block_cache_capacity(mut self, capacity: usize) -> Self {
        self.block_cache_capacity = capacity;
        self
    }

    /// WAL directory
    pub fn wal_dir(&self) -> PathBuf {
        self.dir.join(WAL_DIR_NAME)
    }

    /// Size budget of level `level` (levels >= 1)
    pub fn level_max_bytes(&self, level: usize) -> u64 {
        let mut budget = self.sst_size;
        for _ in 0..level {
            budget = budget.saturating_mul(self.level_multiplier);
        }
        budget
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_level == 0 {
            return Err(StorageError::InvalidArgument("max_level must be at least 1".into()));
        }
        if self.sst_size == 0 {
            return Err(StorageError::InvalidArgument("sst_size must be positive".into()));
        }
        if self.block_size == 0 {
            return Err(StorageError::InvalidArgument("block_size must be positive".into()));
        }
        if self.l0_compaction_trigger == 0 {
            return Err(StorageError::InvalidArgument(
                "l0_compaction_trigger must be at least 1".into(),
            ));
        }
        if self.level_multiplier < 2 {
            return Err(StorageError::InvalidArgument(
                "level_multiplier must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for TreeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeConfig")
            .field("dir", &self.dir)
            .field("max_level", &self.max_level)
            .field("sst_size", &self.sst_size)
            .field("block_size", &self.block_size)
            .field("bloom_bits_per_key", &self.bloom_bits_per_key)
            .field("enable_compression", &self.enable_compression)
            .field("l0_compaction_trigger", &self.l0_compaction_trigger)
            .field("level_multiplier", &self.level_multiplier)
            .field("block_cache_capacity", &self.block_cache_capacity)
            .field("durability", &self.durability)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

/// Name of the WAL subdirectory
pub const WAL_DIR_NAME: &str = "walfile";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TreeConfig::default().validate().is_ok());
        assert!(TreeConfig::for_testing("/tmp/x").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TreeConfig::default().with_max_level(0).validate().is_err());
        assert!(TreeConfig::default().with_sst_size(0).validate().is_err());
        assert!(TreeConfig::default().with_block_size(0).validate().is_err());
        assert!(TreeConfig::default().with_l0_compaction_trigger(0).validate().is_err());

        let mut config = TreeConfig::default();
        config.level_multiplier = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_level_budget_grows_geometrically() {
        let config = TreeConfig::default().with_sst_size(100);
        assert_eq!(config.level_max_bytes(1), 1_000);
        assert_eq!(config.level_max_bytes(2), 10_000);
        assert_eq!(config.level_max_bytes(3), 100_000);
    }

    #[test]
    fn test_wal_dir() {
        let config = TreeConfig::new("/data/db");
        assert_eq!(config.wal_dir(), PathBuf::from("/data/db/walfile"));
    }
}
