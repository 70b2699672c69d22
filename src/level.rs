//! Level manager: owns the sorted runs of every level and routes reads.
//!
//! Level 0 holds runs in time order (oldest first) and its runs may
//! overlap, so lookups probe them newest-first. Levels 1 and deeper keep
//! runs key-ordered by min key for binary search. A single reader-writer
//! lock protects the whole level table; compaction swaps run sets
//! atomically under its write side.

use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::config::LsmConfig;
use crate::errinput;
use crate::error::Result;
use crate::memtable::Lookup;
use crate::sstable::SSTable;

pub struct LevelManager {
    max_level: usize,
    level0_file_threshold: usize,
    size_limits: Vec<u64>,
    levels: RwLock<Vec<Vec<Arc<SSTable>>>>,
}

impl LevelManager {
    pub fn new(config: &LsmConfig) -> Self {
        let mut size_limits = Vec::with_capacity(config.max_level);
        for level in 0..config.max_level {
            if level == 0 {
                // Level 0 is governed by file count, not bytes.
                size_limits.push(u64::MAX);
            } else {
                let scale = config.level_multiplier.saturating_pow(level as u32 - 1);
                size_limits.push(config.level1_max_size.saturating_mul(scale));
            }
        }

        Self {
            max_level: config.max_level,
            level0_file_threshold: config.level0_file_threshold,
            size_limits,
            levels: RwLock::new(vec![Vec::new(); config.max_level]),
        }
    }

    /// Adds a run: appended at level 0, inserted in min-key order deeper.
    pub fn add_table(&self, table: Arc<SSTable>, level: usize) -> Result<()> {
        if level >= self.max_level {
            return errinput!("level {level} exceeds maximum {}", self.max_level);
        }

        let mut levels = self.levels.write()?;
        if level == 0 {
            levels[0].push(table);
        } else {
            let tables = &mut levels[level];
            let pos = tables
                .iter()
                .position(|t| table.min_key() < t.min_key())
                .unwrap_or(tables.len());
            tables.insert(pos, table);
        }
        Ok(())
    }

    /// Routed lookup: level-0 runs newest first (bloom-gated), deeper levels
    /// binary-searched by key range. The first non-missing hit wins, so a
    /// tombstone stops the search and reports the deletion.
    pub fn get(&self, key: &[u8]) -> Result<Lookup> {
        let levels = self.levels.read()?;

        for table in levels[0].iter().rev() {
            if !table.might_contain(key) {
                continue;
            }
            let hit = table.get(key)?;
            if !hit.is_missing() {
                return Ok(hit);
            }
        }

        for tables in levels.iter().skip(1) {
            let mut left = 0;
            let mut right = tables.len();
            while left < right {
                let mid = left + (right - left) / 2;
                let table = &tables[mid];
                if key > table.max_key() {
                    left = mid + 1;
                } else if key < table.min_key() {
                    right = mid;
                } else {
                    let hit = table.get(key)?;
                    if !hit.is_missing() {
                        return Ok(hit);
                    }
                    // In range but absent; no other run in this level can
                    // hold the key.
                    break;
                }
            }
        }

        Ok(Lookup::Missing)
    }

    /// Level 0 triggers on file count, deeper levels on total bytes.
    pub fn needs_compaction(&self, level: usize) -> bool {
        let levels = match self.levels.read() {
            Ok(levels) => levels,
            Err(_) => return false,
        };
        let tables = match levels.get(level) {
            Some(tables) if !tables.is_empty() => tables,
            _ => return false,
        };

        if level == 0 {
            tables.len() >= self.level0_file_threshold
        } else {
            let total: u64 = tables.iter().map(|t| t.file_size()).sum();
            total > self.size_limits[level]
        }
    }

    /// All of level 0 (overlap forces a full merge); the single largest run
    /// deeper.
    pub fn select_compaction_candidates(&self, level: usize) -> Vec<Arc<SSTable>> {
        let levels = match self.levels.read() {
            Ok(levels) => levels,
            Err(_) => return Vec::new(),
        };
        let tables = match levels.get(level) {
            Some(tables) => tables,
            None => return Vec::new(),
        };

        if level == 0 {
            tables.clone()
        } else {
            tables
                .iter()
                .max_by_key(|t| t.file_size())
                .cloned()
                .into_iter()
                .collect()
        }
    }

    /// Atomically removes `old` from `src_level` and installs `new` at
    /// `dst_level`.
    pub fn replace_files(
        &self,
        src_level: usize,
        old: &[Arc<SSTable>],
        dst_level: usize,
        new: Vec<Arc<SSTable>>,
    ) -> Result<()> {
        if src_level >= self.max_level || dst_level >= self.max_level {
            return errinput!("level out of range in replace_files");
        }

        let mut levels = self.levels.write()?;
        levels[src_level].retain(|t| !old.iter().any(|o| Arc::ptr_eq(o, t)));

        for table in new {
            if dst_level == 0 {
                levels[0].push(table);
            } else {
                let tables = &mut levels[dst_level];
                let pos = tables
                    .iter()
                    .position(|t| table.min_key() < t.min_key())
                    .unwrap_or(tables.len());
                tables.insert(pos, table);
            }
        }

        tracing::info!(
            src_level,
            dst_level,
            removed = old.len(),
            "Replaced sorted runs between levels"
        );
        Ok(())
    }

    /// Rebuilds the level table from disk at startup. Runs that fail to
    /// open are skipped and logged; missing directories are skipped.
    pub fn load_existing(&self, data_dir: &Path) -> Result<usize> {
        let mut loaded = 0;

        // Flush outputs live at the data-directory root and belong to
        // level 0, oldest first.
        let mut root_runs = Vec::new();
        if data_dir.exists() {
            for entry in fs::read_dir(data_dir)? {
                let path = entry?.path();
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                if let Some(ordering) = parse_run_name(&name) {
                    root_runs.push((ordering, path));
                }
            }
        }
        root_runs.sort();
        for (_, path) in root_runs {
            match SSTable::open(path.clone(), 0) {
                Ok(table) => {
                    self.add_table(Arc::new(table), 0)?;
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable sorted run");
                }
            }
        }

        for level in 0..self.max_level {
            let level_dir = data_dir.join(format!("level_{level}"));
            if !level_dir.exists() {
                continue;
            }
            let mut paths = Vec::new();
            for entry in fs::read_dir(&level_dir)? {
                let path = entry?.path();
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                if let Some(ordering) = parse_run_name(&name) {
                    paths.push((ordering, path));
                }
            }
            paths.sort();
            for (_, path) in paths {
                match SSTable::open(path.clone(), level) {
                    Ok(table) => {
                        self.add_table(Arc::new(table), level)?;
                        loaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable sorted run");
                    }
                }
            }
        }

        tracing::info!(loaded, "Loaded existing sorted runs");
        Ok(loaded)
    }

    /// Per-level `(file_count, total_bytes)` for stats reporting.
    pub fn level_stats(&self) -> Vec<(usize, u64)> {
        match self.levels.read() {
            Ok(levels) => levels
                .iter()
                .map(|tables| {
                    (
                        tables.len(),
                        tables.iter().map(|t| t.file_size()).sum::<u64>(),
                    )
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn table_count(&self, level: usize) -> usize {
        self.levels
            .read()
            .map(|levels| levels.get(level).map_or(0, |t| t.len()))
            .unwrap_or(0)
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// The deepest level; the only place tombstones may be dropped.
    pub fn is_bottom(&self, level: usize) -> bool {
        level + 1 == self.max_level
    }
}

/// Parses `sstable_<millis>_<seq>.dat` into its numeric ordering.
fn parse_run_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_prefix("sstable_")?.strip_suffix(".dat")?;
    let (millis, seq) = stem.split_once('_')?;
    Some((millis.parse().ok()?, seq.parse().ok()?))
}
