//! In-memory write buffer over a concurrent skip list.
//!
//! The memtable absorbs every mutation before it reaches disk. Keys are
//! UTF-8 bytes ordered lexicographically (which for unsigned bytes is the
//! ordering the whole engine uses); values are either live bytes or a
//! tombstone. `crossbeam_skiplist::SkipMap` gives lock-free ordered reads
//! while the engine's write lock serializes mutators.
//!
//! Size accounting follows the entry payloads: an insert adds
//! `key + value` bytes, a replace adds the value delta, and a tombstone
//! contributes nothing beyond key bytes already counted.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_skiplist::SkipMap;

use crate::block::BlockBuilder;
use crate::bloom::BloomFilter;
use crate::codec::{self, Record};
use crate::config::LsmConfig;
use crate::error::Result;
use crate::sstable::SSTable;

/// Result of a point lookup: a live value, an explicit deletion, or no
/// knowledge of the key at all.
///
/// The distinction between `Tombstone` and `Missing` matters on the read
/// path: a tombstone in a newer source shadows live values in older ones,
/// while `Missing` means the search continues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Value(Vec<u8>),
    Tombstone,
    Missing,
}

impl Lookup {
    /// Collapses the three-way result to the caller-facing option.
    pub fn into_option(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Value(v) => Some(v),
            Lookup::Tombstone | Lookup::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Lookup::Missing)
    }
}

/// In-memory sorted table with tombstone support and size accounting.
#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Option<Vec<u8>>>,
    size: AtomicUsize,
    sequence: AtomicU64,
    max_size: usize,
}

impl Memtable {
    pub fn new(max_size: usize) -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            max_size,
        }
    }

    /// Inserts or replaces a live value.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let old = self.data.get(&key).map(|entry| entry.value().clone());
        match old {
            None => {
                self.size.fetch_add(key.len() + value.len(), Ordering::SeqCst);
            }
            Some(None) => {
                // Replacing a tombstone; the key bytes are already counted.
                self.size.fetch_add(value.len(), Ordering::SeqCst);
            }
            Some(Some(old_value)) => {
                if value.len() >= old_value.len() {
                    self.size
                        .fetch_add(value.len() - old_value.len(), Ordering::SeqCst);
                } else {
                    self.size
                        .fetch_sub(old_value.len() - value.len(), Ordering::SeqCst);
                }
            }
        }
        self.data.insert(key, Some(value));
        self.sequence.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a deletion as a tombstone.
    pub fn delete(&self, key: Vec<u8>) {
        let old = self.data.get(&key).map(|entry| entry.value().clone());
        if let Some(Some(old_value)) = old {
            self.size.fetch_sub(old_value.len(), Ordering::SeqCst);
        }
        self.data.insert(key, None);
        self.sequence.fetch_add(1, Ordering::SeqCst);
    }

    /// Three-way lookup; a tombstone here must shadow older on-disk values.
    pub fn get(&self, key: &[u8]) -> Lookup {
        match self.data.get(key) {
            Some(entry) => match entry.value() {
                Some(value) => Lookup::Value(value.clone()),
                None => Lookup::Tombstone,
            },
            None => Lookup::Missing,
        }
    }

    /// Current size in payload bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Highest sequence number assigned so far.
    pub fn max_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn should_flush(&self) -> bool {
        self.size() >= self.max_size
    }

    /// Writes the live entries out as a level-0 sorted run named
    /// `sstable_<wall_millis>_<max_seq>.dat` in the data directory.
    ///
    /// Tombstones are dropped here; returns `None` when nothing live
    /// remains to write.
    pub fn flush_to_sstable(&self, config: &LsmConfig) -> Result<Option<SSTable>> {
        let live_count = self
            .data
            .iter()
            .filter(|entry| entry.value().is_some())
            .count();
        if live_count == 0 {
            return Ok(None);
        }

        let mut builder = BlockBuilder::new(config.block_size);
        let mut bloom = BloomFilter::new(live_count, config.bloom_fpp);

        for entry in self.data.iter() {
            let value = match entry.value() {
                Some(value) => value.clone(),
                None => continue,
            };
            let key = entry.key().clone();
            bloom.add(&key);
            let encoded = codec::encode_record(&Record {
                key: key.clone(),
                value: Some(value),
            })?;
            builder.add(&key, &encoded);
        }

        let filename = format!(
            "sstable_{}_{}.dat",
            wall_millis(),
            self.max_sequence()
        );
        let path = config.data_dir.join(filename);
        let sstable = SSTable::create(path, builder.build(), bloom, 0)?;
        Ok(Some(sstable))
    }
}

pub(crate) fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
