//! Binary record formats shared by the memtable flush path, the sorted-run
//! blocks, and the write-ahead log.
//!
//! All multi-byte integers are big-endian. Every format opens with a version
//! byte and closes with a CRC32 checksum over the preceding bytes, so each
//! record can be validated independently of its container.
//!
//! # Entry record
//!
//! ```text
//! +----------+--------+-----------+-----+-----------+-------+---------+
//! |version:u8|marker:u8|key_len:u32| key |val_len:u32| value |crc32:u32|
//! +----------+--------+-----------+-----+-----------+-------+---------+
//! ```
//!
//! - `marker` is 0x01 for data, 0x02 for a tombstone (val_len = 0)
//!
//! # WAL record payload
//!
//! The same layout with `[timestamp:u64][sequence:u64]` inserted after the
//! marker. The WAL frames each payload with an outer `[crc32][len]` header
//! (see `wal`); the inner checksum duplicates the outer so a payload stays
//! verifiable after relocation.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::errcorrupt;
use crate::error::Result;

pub const FORMAT_VERSION: u8 = 1;
pub const DATA_MARKER: u8 = 0x01;
pub const TOMBSTONE_MARKER: u8 = 0x02;

/// Maximum key length in bytes (10 KiB).
pub const MAX_KEY_LEN: usize = 10 * 1024;
/// Maximum value length in bytes (1 MiB).
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A key paired with a live value or a tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    /// `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A WAL entry: a record plus the write's wall-clock timestamp and the
/// engine-assigned sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub timestamp: u64,
    pub sequence: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

fn marker_for(value: &Option<Vec<u8>>) -> u8 {
    if value.is_some() {
        DATA_MARKER
    } else {
        TOMBSTONE_MARKER
    }
}

fn write_key_value(buf: &mut Vec<u8>, key: &[u8], value: &Option<Vec<u8>>) -> Result<()> {
    buf.write_u32::<BigEndian>(key.len() as u32)?;
    buf.extend_from_slice(key);
    match value {
        Some(v) => {
            buf.write_u32::<BigEndian>(v.len() as u32)?;
            buf.extend_from_slice(v);
        }
        None => buf.write_u32::<BigEndian>(0)?,
    }
    Ok(())
}

fn append_checksum(mut buf: Vec<u8>) -> Result<Vec<u8>> {
    let checksum = CRC32.checksum(&buf);
    buf.write_u32::<BigEndian>(checksum)?;
    Ok(buf)
}

/// Verifies the trailing CRC32 and returns the checked body.
fn verify_checksum<'a>(data: &'a [u8], what: &str) -> Result<&'a [u8]> {
    if data.len() < 4 {
        return errcorrupt!("{what} too short for checksum: {} bytes", data.len());
    }
    let body = &data[..data.len() - 4];
    let stored = u32::from_be_bytes(data[data.len() - 4..].try_into().unwrap());
    let actual = CRC32.checksum(body);
    if stored != actual {
        return errcorrupt!("{what} checksum mismatch: stored {stored:#010x}, computed {actual:#010x}");
    }
    Ok(body)
}

fn read_version(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<()> {
    let version = cursor.read_u8()?;
    if version != FORMAT_VERSION {
        return errcorrupt!("unsupported {what} version {version}");
    }
    Ok(())
}

fn read_marker(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let marker = cursor.read_u8()?;
    if marker != DATA_MARKER && marker != TOMBSTONE_MARKER {
        return errcorrupt!("invalid record marker {marker:#04x}");
    }
    Ok(marker)
}

fn read_key_value(cursor: &mut Cursor<&[u8]>, marker: u8) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let key_len = cursor.read_u32::<BigEndian>()? as usize;
    if key_len == 0 || key_len > MAX_KEY_LEN {
        return errcorrupt!("invalid key length {key_len}");
    }
    let mut key = vec![0u8; key_len];
    std::io::Read::read_exact(cursor, &mut key)?;

    let value_len = cursor.read_u32::<BigEndian>()? as usize;
    if value_len > MAX_VALUE_LEN {
        return errcorrupt!("value too large: {value_len} bytes");
    }
    let value = if marker == TOMBSTONE_MARKER {
        if value_len != 0 {
            return errcorrupt!("tombstone carries a value of {value_len} bytes");
        }
        None
    } else {
        let mut value = vec![0u8; value_len];
        std::io::Read::read_exact(cursor, &mut value)?;
        Some(value)
    };
    Ok((key, value))
}

/// Encodes an entry record.
pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(14 + record.key.len());
    buf.write_u8(FORMAT_VERSION)?;
    buf.write_u8(marker_for(&record.value))?;
    write_key_value(&mut buf, &record.key, &record.value)?;
    append_checksum(buf)
}

/// Decodes and validates an entry record.
pub fn decode_record(data: &[u8]) -> Result<Record> {
    let body = verify_checksum(data, "record")?;
    let mut cursor = Cursor::new(body);
    read_version(&mut cursor, "record")?;
    let marker = read_marker(&mut cursor)?;
    let (key, value) = read_key_value(&mut cursor, marker)?;
    if cursor.position() as usize != body.len() {
        return errcorrupt!("trailing bytes after record");
    }
    Ok(Record { key, value })
}

/// Encodes a WAL record payload. The on-disk frame header is the WAL's
/// responsibility.
pub fn encode_wal_record(record: &WalRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(30 + record.key.len());
    buf.write_u8(FORMAT_VERSION)?;
    buf.write_u8(marker_for(&record.value))?;
    buf.write_u64::<BigEndian>(record.timestamp)?;
    buf.write_u64::<BigEndian>(record.sequence)?;
    write_key_value(&mut buf, &record.key, &record.value)?;
    append_checksum(buf)
}

/// Decodes and validates a WAL record payload.
pub fn decode_wal_record(data: &[u8]) -> Result<WalRecord> {
    let body = verify_checksum(data, "wal record")?;
    let mut cursor = Cursor::new(body);
    read_version(&mut cursor, "wal record")?;
    let marker = read_marker(&mut cursor)?;
    let timestamp = cursor.read_u64::<BigEndian>()?;
    let sequence = cursor.read_u64::<BigEndian>()?;
    let (key, value) = read_key_value(&mut cursor, marker)?;
    if cursor.position() as usize != body.len() {
        return errcorrupt!("trailing bytes after wal record");
    }
    Ok(WalRecord {
        timestamp,
        sequence,
        key,
        value,
    })
}

/// Serialized bloom filter parameters and bit array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilterData {
    pub bit_size: u32,
    pub num_hashes: u32,
    pub bits: Vec<u8>,
}

/// Encodes a bloom filter: `[version][bit_size][k][byte_len][bytes]`.
pub fn encode_bloom_filter(data: &BloomFilterData) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(13 + data.bits.len());
    buf.write_u8(FORMAT_VERSION)?;
    buf.write_u32::<BigEndian>(data.bit_size)?;
    buf.write_u32::<BigEndian>(data.num_hashes)?;
    buf.write_u32::<BigEndian>(data.bits.len() as u32)?;
    buf.extend_from_slice(&data.bits);
    Ok(buf)
}

/// Decodes a bloom filter serialization.
pub fn decode_bloom_filter(data: &[u8]) -> Result<BloomFilterData> {
    let mut cursor = Cursor::new(data);
    read_version(&mut cursor, "bloom filter")?;
    let bit_size = cursor.read_u32::<BigEndian>()?;
    let num_hashes = cursor.read_u32::<BigEndian>()?;
    let byte_len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = data.len() - cursor.position() as usize;
    if byte_len != remaining {
        return errcorrupt!("bloom filter byte length {byte_len} does not match {remaining} remaining bytes");
    }
    if num_hashes == 0 || bit_size == 0 {
        return errcorrupt!("bloom filter with zero bits or hashes");
    }
    let mut bits = vec![0u8; byte_len];
    std::io::Read::read_exact(&mut cursor, &mut bits)?;
    Ok(BloomFilterData {
        bit_size,
        num_hashes,
        bits,
    })
}

/// One block-index entry: the block's first key, its file offset, and its
/// on-disk size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub key: Vec<u8>,
    pub offset: u64,
    pub size: u32,
}

/// The per-run block index. Persisted inside the sorted-run file but not
/// consulted on the read path, which binary-searches the in-memory blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockIndex {
    pub entries: Vec<BlockIndexEntry>,
}

impl BlockIndex {
    pub fn push(&mut self, key: Vec<u8>, offset: u64, size: u32) {
        self.entries.push(BlockIndexEntry { key, offset, size });
    }
}

/// Encodes a block index: `[version][count]([key_len][key][offset][size])*`.
pub fn encode_block_index(index: &BlockIndex) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u8(FORMAT_VERSION)?;
    buf.write_u32::<BigEndian>(index.entries.len() as u32)?;
    for entry in &index.entries {
        buf.write_u32::<BigEndian>(entry.key.len() as u32)?;
        buf.extend_from_slice(&entry.key);
        buf.write_u64::<BigEndian>(entry.offset)?;
        buf.write_u32::<BigEndian>(entry.size)?;
    }
    Ok(buf)
}

/// Decodes a block index.
pub fn decode_block_index(data: &[u8]) -> Result<BlockIndex> {
    let mut cursor = Cursor::new(data);
    read_version(&mut cursor, "block index")?;
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut index = BlockIndex::default();
    for _ in 0..count {
        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        if key_len == 0 || key_len > MAX_KEY_LEN {
            return errcorrupt!("invalid index key length {key_len}");
        }
        let mut key = vec![0u8; key_len];
        std::io::Read::read_exact(&mut cursor, &mut key)?;
        let offset = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u32::<BigEndian>()?;
        index.push(key, offset, size);
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn record(key: &[u8], value: Option<&[u8]>) -> Record {
        Record {
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let original = record(b"user:1001", Some(b"alice"));
        let encoded = encode_record(&original).unwrap();
        assert_eq!(encoded[0], FORMAT_VERSION);
        assert_eq!(encoded[1], DATA_MARKER);
        assert_eq!(decode_record(&encoded).unwrap(), original);
    }

    #[test]
    fn test_tombstone_roundtrip() {
        let original = record(b"user:1001", None);
        let encoded = encode_record(&original).unwrap();
        assert_eq!(encoded[1], TOMBSTONE_MARKER);
        let decoded = decode_record(&encoded).unwrap();
        assert!(decoded.is_tombstone());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_record_checksum_detects_corruption() {
        let mut encoded = encode_record(&record(b"key", Some(b"value"))).unwrap();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xFF;
        assert!(matches!(decode_record(&encoded), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_record_bad_version() {
        let mut encoded = encode_record(&record(b"key", Some(b"value"))).unwrap();
        encoded[0] = 9;
        // Restore checksum over the tampered body so only the version fails.
        let body_len = encoded.len() - 4;
        let checksum = CRC32.checksum(&encoded[..body_len]).to_be_bytes();
        encoded[body_len..].copy_from_slice(&checksum);
        assert!(matches!(decode_record(&encoded), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_key_length_limits() {
        let at_limit = record(&vec![b'k'; MAX_KEY_LEN], Some(b"v"));
        let encoded = encode_record(&at_limit).unwrap();
        assert_eq!(decode_record(&encoded).unwrap(), at_limit);

        let over = record(&vec![b'k'; MAX_KEY_LEN + 1], Some(b"v"));
        let encoded = encode_record(&over).unwrap();
        assert!(matches!(decode_record(&encoded), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_value_length_limits() {
        let at_limit = record(b"k", Some(&vec![0u8; MAX_VALUE_LEN]));
        let encoded = encode_record(&at_limit).unwrap();
        assert_eq!(decode_record(&encoded).unwrap(), at_limit);

        let over = record(b"k", Some(&vec![0u8; MAX_VALUE_LEN + 1]));
        let encoded = encode_record(&over).unwrap();
        assert!(matches!(decode_record(&encoded), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_wal_record_roundtrip() {
        let original = WalRecord {
            timestamp: 1_700_000_000_123,
            sequence: 42,
            key: b"key1".to_vec(),
            value: Some(b"value1".to_vec()),
        };
        let encoded = encode_wal_record(&original).unwrap();
        assert_eq!(decode_wal_record(&encoded).unwrap(), original);

        let tombstone = WalRecord {
            timestamp: 1_700_000_000_456,
            sequence: 43,
            key: b"key1".to_vec(),
            value: None,
        };
        let encoded = encode_wal_record(&tombstone).unwrap();
        assert_eq!(decode_wal_record(&encoded).unwrap(), tombstone);
    }

    #[test]
    fn test_bloom_filter_roundtrip() {
        let original = BloomFilterData {
            bit_size: 1000,
            num_hashes: 7,
            bits: vec![0xAB; 125],
        };
        let encoded = encode_bloom_filter(&original).unwrap();
        assert_eq!(decode_bloom_filter(&encoded).unwrap(), original);
    }

    #[test]
    fn test_bloom_filter_length_mismatch() {
        let original = BloomFilterData {
            bit_size: 64,
            num_hashes: 3,
            bits: vec![0xFF; 8],
        };
        let mut encoded = encode_bloom_filter(&original).unwrap();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            decode_bloom_filter(&encoded),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_block_index_roundtrip() {
        let mut index = BlockIndex::default();
        index.push(b"apple".to_vec(), 0, 512);
        index.push(b"melon".to_vec(), 516, 498);
        let encoded = encode_block_index(&index).unwrap();
        assert_eq!(decode_block_index(&encoded).unwrap(), index);

        let empty = BlockIndex::default();
        let encoded = encode_block_index(&empty).unwrap();
        assert_eq!(decode_block_index(&encoded).unwrap(), empty);
    }
}
