use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the LSM engine
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Base path for sorted runs (default: /tmp/lsm-data)
    pub data_dir: PathBuf,

    /// Base path for the write-ahead log (default: /tmp/lsm-wal)
    pub wal_dir: PathBuf,

    /// Memtable flush threshold in bytes (default: 64MB)
    pub memtable_size: usize,

    /// Target data block size in bytes (default: 4KB)
    pub block_size: usize,

    /// Bloom filter target false-positive rate (default: 1%)
    pub bloom_fpp: f64,

    /// Cache shard count, must be a power of two (default: 16)
    pub cache_shards: usize,

    /// Per-shard cache capacity in entries (default: 1024)
    pub cache_shard_capacity: usize,

    /// Fsync the WAL on every append (default: false)
    pub wal_sync_immediate: bool,

    /// Truncate the WAL after a successful flush (default: true)
    pub wal_truncate_enabled: bool,

    /// Number of levels (default: 7)
    pub max_level: usize,

    /// Size ratio between consecutive levels (default: 10)
    pub level_multiplier: u64,

    /// Level-0 file count that triggers compaction (default: 4)
    pub level0_file_threshold: usize,

    /// Byte cap for level 1; deeper levels scale by the multiplier
    /// (default: 10MB)
    pub level1_max_size: u64,

    /// Compaction worker configuration
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Delay before the first background compaction check (default: 10s)
    pub initial_delay: Duration,

    /// Interval between background compaction checks (default: 30s)
    pub check_period: Duration,

    /// How long stop() waits for the worker before detaching (default: 60s)
    pub shutdown_grace: Duration,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/tmp/lsm-data"),
            wal_dir: PathBuf::from("/tmp/lsm-wal"),
            memtable_size: 64 * 1024 * 1024, // 64MB
            block_size: 4096,
            bloom_fpp: 0.01,
            cache_shards: 16,
            cache_shard_capacity: 1024,
            wal_sync_immediate: false,
            wal_truncate_enabled: true,
            max_level: 7,
            level_multiplier: 10,
            level0_file_threshold: 4,
            level1_max_size: 10 * 1024 * 1024, // 10MB
            compaction: CompactionConfig::default(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            check_period: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

impl LsmConfig {
    /// Create a new config rooted at the given data and WAL directories
    pub fn new(data_dir: impl Into<PathBuf>, wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            wal_dir: wal_dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable flush threshold
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the target block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the bloom filter false-positive rate
    pub fn bloom_fpp(mut self, fpp: f64) -> Self {
        self.bloom_fpp = fpp;
        self
    }

    /// Set the cache shard count (power of two)
    pub fn cache_shards(mut self, shards: usize) -> Self {
        self.cache_shards = shards;
        self
    }

    /// Enable fsync on every WAL append
    pub fn wal_sync_immediate(mut self, enabled: bool) -> Self {
        self.wal_sync_immediate = enabled;
        self
    }

    /// Enable WAL truncation after flush
    pub fn wal_truncate_enabled(mut self, enabled: bool) -> Self {
        self.wal_truncate_enabled = enabled;
        self
    }

    /// Set the level-0 file count compaction trigger
    pub fn level0_file_threshold(mut self, threshold: usize) -> Self {
        self.level0_file_threshold = threshold;
        self
    }

    /// Set the level-1 byte cap
    pub fn level1_max_size(mut self, size: u64) -> Self {
        self.level1_max_size = size;
        self
    }

    /// Set the number of levels
    pub fn max_level(mut self, levels: usize) -> Self {
        self.max_level = levels;
        self
    }

    /// Configure the compaction worker
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }
}

impl CompactionConfig {
    /// Set the delay before the first compaction check
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the interval between compaction checks
    pub fn check_period(mut self, period: Duration) -> Self {
        self.check_period = period;
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LsmConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/lsm-data"));
        assert_eq!(config.wal_dir, PathBuf::from("/tmp/lsm-wal"));
        assert_eq!(config.memtable_size, 64 * 1024 * 1024);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.cache_shards, 16);
        assert_eq!(config.max_level, 7);
        assert_eq!(config.level0_file_threshold, 4);
        assert!(!config.wal_sync_immediate);
        assert!(config.wal_truncate_enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = LsmConfig::new("/tmp/test-data", "/tmp/test-wal")
            .memtable_size(4 * 1024)
            .block_size(512)
            .level0_file_threshold(2)
            .compaction(
                CompactionConfig::default()
                    .initial_delay(Duration::from_millis(50))
                    .check_period(Duration::from_millis(100)),
            );

        assert_eq!(config.data_dir, PathBuf::from("/tmp/test-data"));
        assert_eq!(config.memtable_size, 4 * 1024);
        assert_eq!(config.block_size, 512);
        assert_eq!(config.level0_file_threshold, 2);
        assert_eq!(config.compaction.initial_delay, Duration::from_millis(50));
        assert_eq!(config.compaction.check_period, Duration::from_millis(100));
    }
}
