//! Data blocks: the unit of storage and lookup inside a sorted run.
//!
//! A block is an ordered, self-checksummed set of entries. The stored value
//! bytes are encoded records (see `codec`), so a block entry can represent
//! either a live value or a tombstone. Serialized layout:
//!
//! ```text
//! +--------------+------------+----------------------------------+
//! |entry_count:u32|checksum:u64|([key_len][key][val_len][val])×n |
//! +--------------+------------+----------------------------------+
//! ```
//!
//! The checksum is CRC64 over every `key‖value` concatenated in entry
//! order; a block decodes successfully iff the recomputed checksum matches.

use std::collections::BTreeMap;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_64_ECMA_182};

use crate::codec::MAX_KEY_LEN;
use crate::errcorrupt;
use crate::error::Result;

pub const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// An immutable, ordered, checksummed set of entries.
pub struct Block {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    checksum: u64,
    size: usize,
}

impl Block {
    fn from_entries(entries: BTreeMap<Vec<u8>, Vec<u8>>, size: usize) -> Self {
        let min_key = entries.keys().next().cloned().unwrap_or_default();
        let max_key = entries.keys().next_back().cloned().unwrap_or_default();
        let checksum = checksum_entries(&entries);
        Self {
            entries,
            min_key,
            max_key,
            checksum,
            size,
        }
    }

    /// Parses a serialized block, verifying its checksum.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let entry_count = cursor.read_u32::<BigEndian>()? as usize;
        let stored_checksum = cursor.read_u64::<BigEndian>()?;

        let mut entries = BTreeMap::new();
        let mut size = 0usize;
        for _ in 0..entry_count {
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            if key_len == 0 || key_len > MAX_KEY_LEN {
                return errcorrupt!("invalid block entry key length {key_len}");
            }
            if remaining(&cursor, data) < key_len {
                return errcorrupt!("block entry key truncated");
            }
            let mut key = vec![0u8; key_len];
            std::io::Read::read_exact(&mut cursor, &mut key)?;

            let value_len = cursor.read_u32::<BigEndian>()? as usize;
            if remaining(&cursor, data) < value_len {
                return errcorrupt!("block entry value truncated");
            }
            let mut value = vec![0u8; value_len];
            std::io::Read::read_exact(&mut cursor, &mut value)?;

            size += 4 + key_len + 4 + value_len;
            entries.insert(key, value);
        }

        if entries.len() != entry_count {
            return errcorrupt!("block entry count mismatch: header says {entry_count}, parsed {}", entries.len());
        }

        let actual = checksum_entries(&entries);
        if actual != stored_checksum {
            return errcorrupt!("block checksum mismatch: stored {stored_checksum:#018x}, computed {actual:#018x}");
        }

        Ok(Self::from_entries(entries, size))
    }

    /// Serializes the block.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(12 + self.size);
        buf.write_u32::<BigEndian>(self.entries.len() as u32)?;
        buf.write_u64::<BigEndian>(self.checksum)?;
        for (key, value) in &self.entries {
            buf.write_u32::<BigEndian>(key.len() as u32)?;
            buf.extend_from_slice(key);
            buf.write_u32::<BigEndian>(value.len() as u32)?;
            buf.extend_from_slice(value);
        }
        Ok(buf)
    }

    /// Looks up the stored value bytes for a key.
    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.entries.get(key)
    }

    /// Range check first, exact lookup second.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        if key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return false;
        }
        self.entries.contains_key(key)
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Estimated payload size in bytes (length prefixes included).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.entries.iter()
    }
}

fn remaining(cursor: &Cursor<&[u8]>, data: &[u8]) -> usize {
    data.len().saturating_sub(cursor.position() as usize)
}

fn checksum_entries(entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> u64 {
    let mut digest = CRC64.digest();
    for (key, value) in entries {
        digest.update(key);
        digest.update(value);
    }
    digest.finalize()
}

/// Accumulates ordered entries and seals them into size-bounded blocks.
///
/// Callers must feed keys in ascending order (the memtable and the merge
/// iterator both do); with that, every produced block's max key is below the
/// next block's min key.
pub struct BlockBuilder {
    max_block_size: usize,
    current: BTreeMap<Vec<u8>, Vec<u8>>,
    current_size: usize,
    completed: Vec<Block>,
}

impl BlockBuilder {
    pub fn new(max_block_size: usize) -> Self {
        Self {
            max_block_size,
            current: BTreeMap::new(),
            current_size: 0,
            completed: Vec::new(),
        }
    }

    /// Adds an entry, sealing the current block first if the entry would
    /// push it past the size target.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let entry_size = 4 + key.len() + 4 + value.len();

        if self.current_size + entry_size > self.max_block_size && !self.current.is_empty() {
            self.seal_current();
        }

        self.current.insert(key.to_vec(), value.to_vec());
        self.current_size += entry_size;
    }

    /// Seals the tail block and returns all blocks in key order.
    pub fn build(mut self) -> Vec<Block> {
        if !self.current.is_empty() {
            self.seal_current();
        }
        self.completed
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.current.is_empty()
    }

    fn seal_current(&mut self) {
        let entries = std::mem::take(&mut self.current);
        let size = std::mem::take(&mut self.current_size);
        self.completed.push(Block::from_entries(entries, size));
    }
}
