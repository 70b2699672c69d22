//! Background compaction: merges sorted runs downward through the levels.
//!
//! A single worker thread wakes on a fixed period (after an initial delay)
//! or on a manual trigger, finds the shallowest level over its threshold,
//! and merges that one level's candidates into the level below — one level
//! per pass to bound the work and the lock hold time. The merged output is
//! installed before the source runs are removed, so readers never observe
//! a gap; a failed merge deletes its partial output files and leaves the
//! level structure untouched.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};

use crate::block::BlockBuilder;
use crate::bloom::BloomFilter;
use crate::codec::{self, Record};
use crate::config::LsmConfig;
use crate::error::{Error, Result};
use crate::iterator::{MergeIterator, TableCursor};
use crate::level::LevelManager;
use crate::memtable::wall_millis;
use crate::sstable::SSTable;

enum Command {
    Check,
    Stop,
}

/// Running totals, readable without any lock.
#[derive(Debug, Default)]
pub struct CompactionStats {
    compactions: AtomicU64,
    bytes_compacted: AtomicU64,
}

impl CompactionStats {
    pub fn total_compactions(&self) -> u64 {
        self.compactions.load(Ordering::SeqCst)
    }

    pub fn total_bytes_compacted(&self) -> u64 {
        self.bytes_compacted.load(Ordering::SeqCst)
    }

    fn record(&self, bytes: u64) {
        self.compactions.fetch_add(1, Ordering::SeqCst);
        self.bytes_compacted.fetch_add(bytes, Ordering::SeqCst);
    }
}

struct Worker {
    handle: JoinHandle<()>,
    commands: Sender<Command>,
    done: crossbeam_channel::Receiver<()>,
}

pub struct Compactor {
    config: LsmConfig,
    levels: Arc<LevelManager>,
    stats: Arc<CompactionStats>,
    next_file_id: Arc<AtomicU64>,
    running: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl Compactor {
    pub fn new(config: LsmConfig, levels: Arc<LevelManager>) -> Self {
        Self {
            config,
            levels,
            stats: Arc::new(CompactionStats::default()),
            next_file_id: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Starts the background worker. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (command_tx, command_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let config = self.config.clone();
        let levels = Arc::clone(&self.levels);
        let stats = Arc::clone(&self.stats);
        let next_file_id = Arc::clone(&self.next_file_id);

        let handle = std::thread::Builder::new()
            .name("emberdb-compaction".to_string())
            .spawn(move || {
                let mut timeout = config.compaction.initial_delay;
                loop {
                    match command_rx.recv_timeout(timeout) {
                        Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(Command::Check) | Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) =
                                run_check(&config, &levels, &stats, &next_file_id)
                            {
                                tracing::error!(error = %e, "Compaction check failed");
                            }
                            timeout = config.compaction.check_period;
                        }
                    }
                }
                let _ = done_tx.send(());
            })
            .expect("failed to spawn compaction thread");

        *self.worker.lock().unwrap() = Some(Worker {
            handle,
            commands: command_tx,
            done: done_rx,
        });
        tracing::info!("Compaction worker started");
    }

    /// Soft shutdown: waits up to the configured grace period for the
    /// worker to finish its current pass, then detaches it. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let worker = match self.worker.lock().unwrap().take() {
            Some(worker) => worker,
            None => return,
        };

        let _ = worker.commands.send(Command::Stop);
        match worker.done.recv_timeout(self.config.compaction.shutdown_grace) {
            Ok(()) => {
                let _ = worker.handle.join();
                tracing::info!("Compaction worker stopped");
            }
            Err(_) => {
                tracing::warn!("Compaction worker did not stop in time, detaching");
            }
        }
    }

    /// Submits one immediate check to the worker.
    pub fn trigger(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "compaction worker is not running".to_string(),
            ));
        }
        let worker = self.worker.lock()?;
        match worker.as_ref() {
            Some(worker) => {
                worker
                    .commands
                    .send(Command::Check)
                    .map_err(|e| Error::InvalidState(e.to_string()))?;
                Ok(())
            }
            None => Err(Error::InvalidState(
                "compaction worker is not running".to_string(),
            )),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One pass: compact the shallowest level over threshold, then stop.
fn run_check(
    config: &LsmConfig,
    levels: &LevelManager,
    stats: &CompactionStats,
    next_file_id: &AtomicU64,
) -> Result<()> {
    for level in 0..levels.max_level().saturating_sub(1) {
        if levels.needs_compaction(level) {
            compact_level(config, levels, stats, next_file_id, level)?;
            break;
        }
    }
    Ok(())
}

fn compact_level(
    config: &LsmConfig,
    levels: &LevelManager,
    stats: &CompactionStats,
    next_file_id: &AtomicU64,
    level: usize,
) -> Result<()> {
    let candidates = levels.select_compaction_candidates(level);
    if candidates.is_empty() {
        return Ok(());
    }
    let target = level + 1;

    tracing::info!(
        source_level = level,
        target_level = target,
        source_runs = candidates.len(),
        "Starting compaction"
    );

    // Level-0 candidates arrive oldest first; the merge wants newest first.
    let cursors: Vec<TableCursor> = candidates
        .iter()
        .rev()
        .map(|t| TableCursor::new(Arc::clone(t)))
        .collect();
    let merge = MergeIterator::new(cursors)?;

    // Tombstones die only when nothing deeper could still hold the key.
    let drop_tombstones = levels.is_bottom(target);
    let mut entries: Vec<(Vec<u8>, Record)> = Vec::new();
    for item in merge {
        let (key, record) = item?;
        if record.is_tombstone() && drop_tombstones {
            continue;
        }
        entries.push((key, record));
    }

    let new_runs = match write_merged_runs(config, next_file_id, target, &entries) {
        Ok(runs) => runs,
        Err(e) => return Err(e),
    };

    levels.replace_files(level, &candidates, target, new_runs.clone())?;

    let mut reclaimed = 0u64;
    for old in &candidates {
        reclaimed += old.file_size();
        if let Err(e) = fs::remove_file(old.path()) {
            tracing::warn!(path = %old.path().display(), error = %e, "Failed to delete compacted run");
        }
    }
    stats.record(reclaimed);

    tracing::info!(
        source_level = level,
        target_level = target,
        merged_runs = candidates.len(),
        output_runs = new_runs.len(),
        entries = entries.len(),
        "Compaction completed"
    );
    Ok(())
}

/// Routes the merged stream into size-bounded output runs under
/// `level_<target>/`. On failure every file written so far is deleted.
fn write_merged_runs(
    config: &LsmConfig,
    next_file_id: &AtomicU64,
    target: usize,
    entries: &[(Vec<u8>, Record)],
) -> Result<Vec<Arc<SSTable>>> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let dir = config.data_dir.join(format!("level_{target}"));
    fs::create_dir_all(&dir)?;

    // Fixed per-file target, consistent across runs.
    let per_file_target = config.level1_max_size.max(1) as usize;

    let mut runs: Vec<Arc<SSTable>> = Vec::new();
    let mut chunk: Vec<(&Vec<u8>, &Record)> = Vec::new();
    let mut chunk_bytes = 0usize;

    let result = (|| -> Result<()> {
        for (key, record) in entries {
            let entry_bytes =
                8 + key.len() + record.value.as_ref().map_or(0, |v| v.len());
            if chunk_bytes + entry_bytes > per_file_target && !chunk.is_empty() {
                runs.push(seal_run(config, next_file_id, &dir, target, &chunk)?);
                chunk.clear();
                chunk_bytes = 0;
            }
            chunk.push((key, record));
            chunk_bytes += entry_bytes;
        }
        if !chunk.is_empty() {
            runs.push(seal_run(config, next_file_id, &dir, target, &chunk)?);
        }
        Ok(())
    })();

    if let Err(e) = result {
        for run in &runs {
            let _ = fs::remove_file(run.path());
        }
        return Err(e);
    }
    Ok(runs)
}

fn seal_run(
    config: &LsmConfig,
    next_file_id: &AtomicU64,
    dir: &std::path::Path,
    target: usize,
    chunk: &[(&Vec<u8>, &Record)],
) -> Result<Arc<SSTable>> {
    let mut builder = BlockBuilder::new(config.block_size);
    // Tombstone keys go into the bloom filter too; a lookup must reach the
    // tombstone here rather than fall through to an older live value.
    let mut bloom = BloomFilter::new(chunk.len(), config.bloom_fpp);
    for (key, record) in chunk {
        bloom.add(key);
        let encoded = codec::encode_record(record)?;
        builder.add(key, &encoded);
    }

    let file_id = next_file_id.fetch_add(1, Ordering::SeqCst);
    let path = dir.join(format!("sstable_{}_{}.dat", wall_millis(), file_id));
    let sstable = SSTable::create(path, builder.build(), bloom, target)?;
    Ok(Arc::new(sstable))
}
