//! Sorted runs: immutable on-disk tables of ordered, checksummed blocks.
//!
//! # File layout
//!
//! ```text
//! +---------------------+-----+---------------------+
//! |block_len:u32| block | ... |block_len:u32| block |
//! +---------------------+-----+---------------------+
//! | block index (skipped on the read path)          |
//! +-------------------------------------------------+
//! | bloom filter bytes                              |
//! +-------------------------------------------------+
//! | footer: block_count:u32 | bloom_len:u32         |
//! +-------------------------------------------------+
//! ```
//!
//! The reader works backwards from the fixed 8-byte footer: the bloom
//! filter ends 8 bytes before EOF, the blocks start at offset 0 and are
//! read sequentially by count. Whatever sits between the last block and the
//! bloom filter (the persisted block index) is never consulted for lookups.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};

use crate::block::Block;
use crate::bloom::BloomFilter;
use crate::codec::{self, BlockIndex};
use crate::errcorrupt;
use crate::error::Result;
use crate::memtable::Lookup;

const FOOTER_SIZE: usize = 8;

pub struct SSTable {
    path: PathBuf,
    level: usize,
    blocks: Vec<Block>,
    bloom: BloomFilter,
    file_size: u64,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

impl SSTable {
    /// Writes a new sorted run from ordered blocks and the bloom filter
    /// covering their live keys.
    pub fn create(
        path: PathBuf,
        blocks: Vec<Block>,
        bloom: BloomFilter,
        level: usize,
    ) -> Result<Self> {
        if blocks.is_empty() {
            return errcorrupt!("refusing to write a sorted run with no blocks");
        }

        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        let mut index = BlockIndex::default();
        let mut offset = 0u64;

        for block in &blocks {
            let encoded = block.encode()?;
            writer.write_u32::<BigEndian>(encoded.len() as u32)?;
            writer.write_all(&encoded)?;
            index.push(block.min_key().to_vec(), offset + 4, encoded.len() as u32);
            offset += 4 + encoded.len() as u64;
        }

        let index_bytes = codec::encode_block_index(&index)?;
        writer.write_all(&index_bytes)?;

        let bloom_bytes = bloom.to_bytes()?;
        writer.write_all(&bloom_bytes)?;

        writer.write_u32::<BigEndian>(blocks.len() as u32)?;
        writer.write_u32::<BigEndian>(bloom_bytes.len() as u32)?;

        writer.flush()?;
        writer.get_ref().sync_all()?;

        let file_size = fs::metadata(&path)?.len();
        let min_key = blocks.first().map(|b| b.min_key().to_vec()).unwrap_or_default();
        let max_key = blocks.last().map(|b| b.max_key().to_vec()).unwrap_or_default();

        Ok(Self {
            path,
            level,
            blocks,
            bloom,
            file_size,
            min_key,
            max_key,
        })
    }

    /// Opens an existing sorted run, validating every block checksum.
    pub fn open(path: PathBuf, level: usize) -> Result<Self> {
        let data = fs::read(&path)?;
        if data.len() < FOOTER_SIZE {
            return errcorrupt!("sorted run {:?} too short: {} bytes", path, data.len());
        }

        let footer = &data[data.len() - FOOTER_SIZE..];
        let block_count = u32::from_be_bytes(footer[0..4].try_into().unwrap()) as usize;
        let bloom_len = u32::from_be_bytes(footer[4..8].try_into().unwrap()) as usize;

        let bloom_end = data.len() - FOOTER_SIZE;
        let bloom_start = bloom_end
            .checked_sub(bloom_len)
            .ok_or_else(|| crate::error::Error::Corrupt(format!(
                "sorted run {path:?} bloom filter length {bloom_len} exceeds file size"
            )))?;
        let bloom = BloomFilter::from_bytes(&data[bloom_start..bloom_end])?;

        let mut blocks = Vec::with_capacity(block_count);
        let mut pos = 0usize;
        for _ in 0..block_count {
            if pos + 4 > bloom_start {
                return errcorrupt!("sorted run {:?} truncated block header", path);
            }
            let block_len =
                u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + block_len > bloom_start {
                return errcorrupt!("sorted run {:?} truncated block body", path);
            }
            blocks.push(Block::decode(&data[pos..pos + block_len])?);
            pos += block_len;
        }

        if blocks.is_empty() {
            return errcorrupt!("sorted run {:?} has no blocks", path);
        }

        let file_size = data.len() as u64;
        let min_key = blocks[0].min_key().to_vec();
        let max_key = blocks[blocks.len() - 1].max_key().to_vec();

        Ok(Self {
            path,
            level,
            blocks,
            bloom,
            file_size,
            min_key,
            max_key,
        })
    }

    /// Point lookup: bloom filter, then binary search for the candidate
    /// block, then the in-block map.
    pub fn get(&self, key: &[u8]) -> Result<Lookup> {
        if !self.bloom.might_contain(key) {
            return Ok(Lookup::Missing);
        }

        let block = match self.find_block(key) {
            Some(block) => block,
            None => return Ok(Lookup::Missing),
        };

        match block.get(key) {
            Some(encoded) => {
                let record = codec::decode_record(encoded)?;
                Ok(match record.value {
                    Some(value) => Lookup::Value(value),
                    None => Lookup::Tombstone,
                })
            }
            None => Ok(Lookup::Missing),
        }
    }

    /// True iff `min_key ≤ key ≤ max_key` by unsigned byte comparison.
    pub fn key_in_range(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }

    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.might_contain(key)
    }

    fn find_block(&self, key: &[u8]) -> Option<&Block> {
        let mut left = 0;
        let mut right = self.blocks.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let block = &self.blocks[mid];
            if key > block.max_key() {
                left = mid + 1;
            } else if key < block.min_key() {
                right = mid;
            } else {
                return Some(block);
            }
        }
        None
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    pub fn entry_count(&self) -> usize {
        self.blocks.iter().map(|b| b.entry_count()).sum()
    }

    pub(crate) fn blocks(&self) -> &[Block] {
        &self.blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockBuilder;
    use crate::codec::Record;
    use crate::tmpfs::TempDir;

    fn encoded(key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
        codec::encode_record(&Record {
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
        })
        .unwrap()
    }

    fn build_table(dir: &TempDir, name: &str, entries: &[(&[u8], Option<&[u8]>)]) -> SSTable {
        let mut builder = BlockBuilder::new(128);
        let mut bloom = BloomFilter::new(entries.len().max(1), 0.01);
        for (key, value) in entries {
            bloom.add(key);
            builder.add(key, &encoded(key, *value));
        }
        SSTable::create(dir.path().join(name), builder.build(), bloom, 0)
            .expect("Failed to create sorted run")
    }

    #[test]
    fn test_create_and_get() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = build_table(
            &temp_dir,
            "t1.dat",
            &[
                (b"apple", Some(b"fruit")),
                (b"banana", Some(b"fruit")),
                (b"carrot", Some(b"vegetable")),
            ],
        );

        assert_eq!(table.get(b"apple").unwrap(), Lookup::Value(b"fruit".to_vec()));
        assert_eq!(
            table.get(b"carrot").unwrap(),
            Lookup::Value(b"vegetable".to_vec())
        );
        assert_eq!(table.get(b"durian").unwrap(), Lookup::Missing);
        assert_eq!(table.min_key(), b"apple");
        assert_eq!(table.max_key(), b"carrot");
        assert!(table.file_size() > 0);
    }

    #[test]
    fn test_open_roundtrip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let entries: Vec<(String, String)> = (0..50)
            .map(|i| (format!("key{i:03}"), format!("value{i}")))
            .collect();

        let path = {
            let refs: Vec<(&[u8], Option<&[u8]>)> = entries
                .iter()
                .map(|(k, v)| (k.as_bytes(), Some(v.as_bytes())))
                .collect();
            let table = build_table(&temp_dir, "t2.dat", &refs);
            // Small block budget forces multiple blocks.
            assert!(table.blocks().len() > 1);
            table.path().to_path_buf()
        };

        let reopened = SSTable::open(path, 0).expect("Failed to open sorted run");
        assert_eq!(reopened.entry_count(), 50);
        for (k, v) in &entries {
            assert_eq!(
                reopened.get(k.as_bytes()).unwrap(),
                Lookup::Value(v.as_bytes().to_vec()),
                "missing {k}"
            );
        }
        assert_eq!(reopened.get(b"zzz").unwrap(), Lookup::Missing);
    }

    #[test]
    fn test_tombstone_entries_survive_roundtrip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = build_table(
            &temp_dir,
            "t3.dat",
            &[(b"dead", None), (b"live", Some(b"value"))],
        );

        assert_eq!(table.get(b"dead").unwrap(), Lookup::Tombstone);

        let reopened =
            SSTable::open(table.path().to_path_buf(), 1).expect("Failed to open sorted run");
        assert_eq!(reopened.get(b"dead").unwrap(), Lookup::Tombstone);
        assert_eq!(reopened.get(b"live").unwrap(), Lookup::Value(b"value".to_vec()));
        assert_eq!(reopened.level(), 1);
    }

    #[test]
    fn test_key_in_range() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = build_table(
            &temp_dir,
            "t4.dat",
            &[(b"banana", Some(b"1")), (b"mango", Some(b"2"))],
        );

        assert!(table.key_in_range(b"banana"));
        assert!(table.key_in_range(b"cherry"));
        assert!(table.key_in_range(b"mango"));
        assert!(!table.key_in_range(b"apple"));
        assert!(!table.key_in_range(b"papaya"));
    }

    #[test]
    fn test_open_rejects_corrupt_block() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = build_table(&temp_dir, "t5.dat", &[(b"key", Some(b"value"))]);
        let path = table.path().to_path_buf();

        // Flip a byte inside the first block's payload.
        let mut data = fs::read(&path).unwrap();
        data[10] ^= 0xFF;
        fs::write(&path, data).unwrap();

        assert!(SSTable::open(path, 0).is_err());
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("t6.dat"), [0u8; 4]).unwrap();
        assert!(SSTable::open(temp_dir.path().join("t6.dat"), 0).is_err());
    }
}
