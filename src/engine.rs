//! The engine facade: orchestrates the WAL, memtable, levels, cache,
//! compactor, and transactions behind one handle.
//!
//! A single reader-writer lock separates mutators (put, delete, flush,
//! close) from readers (get). Writes go WAL → memtable → cache, flushing
//! the memtable to a level-0 sorted run when it crosses its size
//! threshold. Reads go cache → memtable → levels, where a memtable
//! tombstone shadows anything older on disk.
//!
//! Opening recovers state: the cache is cleared, the WAL is replayed into
//! a fresh memtable, and existing sorted runs are loaded from the data
//! directory.

use std::fs;
use std::sync::{Arc, RwLock};

use crate::cache::ShardedCache;
use crate::codec::{MAX_KEY_LEN, MAX_VALUE_LEN};
use crate::compaction::Compactor;
use crate::config::LsmConfig;
use crate::errinput;
use crate::error::{Error, Result};
use crate::level::LevelManager;
use crate::memtable::{Lookup, Memtable};
use crate::txn::{Transaction, TransactionManager};
use crate::wal::Wal;

pub(crate) fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return errinput!("key cannot be empty");
    }
    if key.len() > MAX_KEY_LEN {
        return errinput!("key length {} exceeds {MAX_KEY_LEN} bytes", key.len());
    }
    Ok(())
}

pub(crate) fn validate_value(value: &[u8]) -> Result<()> {
    if value.is_empty() {
        return errinput!("value cannot be empty, use delete() for deletion");
    }
    if value.len() > MAX_VALUE_LEN {
        return errinput!("value length {} exceeds {MAX_VALUE_LEN} bytes", value.len());
    }
    Ok(())
}

/// Write-path state guarded by the engine's global lock.
struct EngineState {
    memtable: Memtable,
    wal: Wal,
    closed: bool,
}

pub(crate) struct EngineInner {
    config: LsmConfig,
    state: RwLock<EngineState>,
    levels: Arc<LevelManager>,
    cache: ShardedCache,
    compactor: Compactor,
    txns: TransactionManager,
}

impl EngineInner {
    pub(crate) fn get_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let state = self.state.read()?;
        if state.closed {
            return Err(Error::Closed);
        }

        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        match state.memtable.get(key) {
            Lookup::Value(value) => {
                self.cache.insert(key.to_vec(), value.clone());
                return Ok(Some(value));
            }
            Lookup::Tombstone => return Ok(None),
            Lookup::Missing => {}
        }

        match self.levels.get(key)? {
            Lookup::Value(value) => {
                self.cache.insert(key.to_vec(), value.clone());
                Ok(Some(value))
            }
            Lookup::Tombstone | Lookup::Missing => Ok(None),
        }
    }

    pub(crate) fn put_bytes(&self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        validate_value(value)?;

        let mut state = self.state.write()?;
        if state.closed {
            return Err(Error::Closed);
        }

        state.wal.append(key, Some(value))?;
        state.memtable.put(key.to_vec(), value.to_vec());
        self.cache.insert(key.to_vec(), value.to_vec());

        if state.memtable.should_flush() {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    pub(crate) fn delete_bytes(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;

        let mut state = self.state.write()?;
        if state.closed {
            return Err(Error::Closed);
        }

        state.wal.append(key, None)?;
        state.memtable.delete(key.to_vec());
        self.cache.remove(key);
        Ok(())
    }

    pub(crate) fn txns(&self) -> &TransactionManager {
        &self.txns
    }

    /// Swaps in a fresh memtable and writes the old one out as a level-0
    /// run. Caller holds the write lock. Flushing an empty memtable is a
    /// no-op.
    fn flush_locked(&self, state: &mut std::sync::RwLockWriteGuard<'_, EngineState>) -> Result<()> {
        if state.memtable.is_empty() {
            return Ok(());
        }
        tracing::info!(size = state.memtable.size(), "Flushing memtable to disk");

        let old = std::mem::replace(
            &mut state.memtable,
            Memtable::new(self.config.memtable_size),
        );
        if let Some(sstable) = old.flush_to_sstable(&self.config)? {
            tracing::info!(
                path = %sstable.path().display(),
                entries = sstable.entry_count(),
                "Memtable flushed"
            );
            self.levels.add_table(Arc::new(sstable), 0)?;
        }
        state.wal.mark_flushed(old.max_sequence())?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write()?;
        if state.closed {
            return Ok(());
        }
        tracing::info!("Closing storage engine");
        state.closed = true;

        self.compactor.stop();
        if !state.memtable.is_empty() {
            self.flush_locked(&mut state)?;
        }
        state.wal.sync()?;

        tracing::info!("Storage engine closed");
        Ok(())
    }
}

/// Embedded LSM-tree key-value engine.
pub struct LsmTree {
    inner: Arc<EngineInner>,
}

impl LsmTree {
    /// Opens the engine against its data and WAL directories, recovering
    /// any existing state and starting the background compactor.
    pub fn open(config: LsmConfig) -> Result<Self> {
        if !config.cache_shards.is_power_of_two() || config.cache_shards == 0 {
            return errinput!("cache shard count must be a power of two");
        }
        if config.max_level < 2 {
            return errinput!("at least two levels are required");
        }

        fs::create_dir_all(&config.data_dir)?;
        fs::create_dir_all(&config.wal_dir)?;

        let wal = Wal::open(
            &config.wal_dir,
            config.wal_sync_immediate,
            config.wal_truncate_enabled,
        )?;
        let memtable = Memtable::new(config.memtable_size);
        let levels = Arc::new(LevelManager::new(&config));
        let cache = ShardedCache::new(config.cache_shards, config.cache_shard_capacity);
        let compactor = Compactor::new(config.clone(), Arc::clone(&levels));

        let inner = Arc::new_cyclic(|weak| EngineInner {
            config,
            state: RwLock::new(EngineState {
                memtable,
                wal,
                closed: false,
            }),
            levels,
            cache,
            compactor,
            txns: TransactionManager::new(weak.clone()),
        });

        inner.compactor.start();

        // Recovery: cold cache, WAL replay, then the on-disk runs.
        inner.cache.clear();
        {
            let state = inner.state.read()?;
            let report = state.wal.recover(&state.memtable)?;
            if report.corrupted > 0 {
                tracing::warn!(
                    corrupted = report.corrupted,
                    "WAL recovery skipped corrupted entries, consider repair"
                );
            }
        }
        inner.levels.load_existing(&inner.config.data_dir)?;

        tracing::info!("Storage engine initialized");
        Ok(Self { inner })
    }

    /// Stores a value.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.put_bytes(key.as_bytes(), value)
    }

    /// Point lookup: cache → memtable → sorted runs.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get_bytes(key.as_bytes())
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete_bytes(key.as_bytes())
    }

    /// Submits an immediate compaction check to the background worker.
    pub fn compact(&self) -> Result<()> {
        if self.inner.state.read()?.closed {
            return Err(Error::Closed);
        }
        tracing::info!("Manually triggering compaction");
        self.inner.compactor.trigger()
    }

    /// Starts a new transaction.
    pub fn begin_transaction(&self) -> Result<Transaction> {
        if self.inner.state.read()?.closed {
            return Err(Error::Closed);
        }
        self.inner.txns.begin()
    }

    /// Renders a text report of engine state.
    pub fn stats(&self) -> Result<String> {
        let state = self.inner.state.read()?;
        let mut out = String::new();
        out.push_str("LSM-Tree Storage Engine Statistics:\n");
        out.push_str(&format!(
            "- Active MemTable Size: {} bytes\n",
            state.memtable.size()
        ));
        out.push_str(&format!(
            "- Active MemTable Sequence: {}\n",
            state.memtable.max_sequence()
        ));
        out.push_str(&format!(
            "- Cache Shard Count: {}\n",
            self.inner.cache.shard_count()
        ));
        out.push_str(&format!(
            "- Active Transactions: {}\n",
            self.inner.txns.active_count()
        ));
        out.push_str(&format!(
            "- Engine Status: {}\n",
            if state.closed { "CLOSED" } else { "RUNNING" }
        ));

        for (level, (files, bytes)) in self.inner.levels.level_stats().iter().enumerate() {
            if *files > 0 {
                out.push_str(&format!("- Level {level}: {files} files, {bytes} bytes\n"));
            }
        }

        let stats = self.inner.compactor.stats();
        out.push_str(&format!(
            "- Total Compactions: {}\n",
            stats.total_compactions()
        ));
        out.push_str(&format!(
            "- Total Bytes Compacted: {}\n",
            stats.total_bytes_compacted()
        ));
        Ok(out)
    }

    /// Stops the compactor, flushes the memtable, and syncs the WAL.
    /// Idempotent; every other operation fails with `Error::Closed`
    /// afterwards.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            tracing::error!(error = %e, "Error closing engine on drop");
        }
    }
}
