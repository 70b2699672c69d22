//! Write-ahead log: durable framed record of every mutation.
//!
//! A single append-only file (`wal.log`) absorbs every put and delete
//! before the memtable does, so a crash can never lose an acknowledged
//! write (when `wal_sync_immediate` is set) or more than the OS-buffered
//! tail (when it is not).
//!
//! # Frame format
//!
//! ```text
//! +---------+-------+---------+
//! |crc32:u32|len:u32| payload |
//! +---------+-------+---------+
//! ```
//!
//! The outer checksum covers the payload only; the payload is an encoded
//! WAL record (see `codec`) that carries its own inner checksum, so a
//! payload remains verifiable after relocation.
//!
//! # Recovery rules
//!
//! Recovery scans frames from offset zero and tolerates a damaged tail:
//! a short header or truncated payload stops the scan (graceful EOF after
//! a crash mid-append), an implausible length stops the scan, and a frame
//! whose checksum or decoding fails is skipped and counted, never fatal.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{BigEndian, WriteBytesExt};

use crate::codec::{self, WalRecord, CRC32};
use crate::error::Result;
use crate::memtable::{wall_millis, Memtable};

pub const WAL_FILE: &str = "wal.log";
const FRAME_HEADER_SIZE: usize = 8; // crc(4) + len(4)
const MAX_ENTRY_SIZE: usize = 10 * 1024 * 1024;

/// Outcome of a WAL recovery scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub corrupted: usize,
}

pub struct Wal {
    path: PathBuf,
    file: File,
    writer: Mutex<BufWriter<File>>,
    sequence: AtomicU64,
    last_flushed_sequence: AtomicU64,
    sync_immediate: bool,
    truncate_enabled: bool,
}

impl Wal {
    /// Opens (creating if needed) the log at `wal_dir/wal.log`.
    pub fn open(wal_dir: &Path, sync_immediate: bool, truncate_enabled: bool) -> Result<Self> {
        let path = wal_dir.join(WAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);

        tracing::info!(path = %path.display(), "WAL initialized");

        Ok(Self {
            path,
            file,
            writer: Mutex::new(writer),
            sequence: AtomicU64::new(0),
            last_flushed_sequence: AtomicU64::new(0),
            sync_immediate,
            truncate_enabled,
        })
    }

    /// Appends one mutation and returns its sequence number. `None` records
    /// a tombstone.
    pub fn append(&self, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = codec::encode_wal_record(&WalRecord {
            timestamp: wall_millis(),
            sequence,
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
        })?;
        let checksum = CRC32.checksum(&payload);

        let mut writer = self.writer.lock()?;
        writer.write_u32::<BigEndian>(checksum)?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        writer.flush()?;

        if self.sync_immediate {
            self.file.sync_all()?;
        }

        Ok(sequence)
    }

    /// Replays the log into the memtable, applying the recovery rules above.
    pub fn recover(&self, memtable: &Memtable) -> Result<RecoveryReport> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecoveryReport::default()),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(RecoveryReport::default());
        }

        tracing::info!(
            path = %self.path.display(),
            size = data.len(),
            "Starting WAL recovery"
        );

        let mut report = RecoveryReport::default();
        let mut max_sequence = 0u64;
        let mut pos = 0usize;

        while pos + FRAME_HEADER_SIZE <= data.len() {
            let stored_crc = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap());
            let len = u32::from_be_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;

            if len == 0 || len > MAX_ENTRY_SIZE {
                tracing::warn!(position = pos, length = len, "Implausible WAL frame length, stopping recovery");
                break;
            }
            if pos + FRAME_HEADER_SIZE + len > data.len() {
                tracing::warn!(position = pos, "Incomplete WAL frame at tail, stopping recovery");
                break;
            }

            let payload = &data[pos + FRAME_HEADER_SIZE..pos + FRAME_HEADER_SIZE + len];
            pos += FRAME_HEADER_SIZE + len;

            if CRC32.checksum(payload) != stored_crc {
                tracing::warn!(position = pos, "WAL frame checksum mismatch, skipping");
                report.corrupted += 1;
                continue;
            }

            let record = match codec::decode_wal_record(payload) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(position = pos, error = %e, "Undecodable WAL frame, skipping");
                    report.corrupted += 1;
                    continue;
                }
            };

            max_sequence = max_sequence.max(record.sequence);
            match record.value {
                Some(value) => memtable.put(record.key, value),
                None => memtable.delete(record.key),
            }
            report.recovered += 1;
        }

        // Keep issuing sequence numbers above anything already on disk.
        self.sequence.fetch_max(max_sequence, Ordering::SeqCst);

        tracing::info!(
            recovered = report.recovered,
            corrupted = report.corrupted,
            "WAL recovery completed"
        );
        Ok(report)
    }

    /// Records the flushed high-water mark and truncates the log when
    /// truncation is enabled.
    pub fn mark_flushed(&self, sequence: u64) -> Result<()> {
        self.last_flushed_sequence.store(sequence, Ordering::SeqCst);
        if self.truncate_enabled {
            let mut writer = self.writer.lock()?;
            writer.flush()?;
            self.file.sync_all()?;
            self.file.set_len(0)?;
            tracing::info!(sequence, "WAL truncated after flush");
        }
        Ok(())
    }

    /// Copies the live log to `<path>.backup` and truncates it.
    pub fn repair(&self) -> Result<PathBuf> {
        let mut writer = self.writer.lock()?;
        writer.flush()?;
        self.file.sync_all()?;

        let backup = PathBuf::from(format!("{}.backup", self.path.display()));
        fs::copy(&self.path, &backup)?;
        self.file.set_len(0)?;

        tracing::info!(backup = %backup.display(), "WAL repaired");
        Ok(backup)
    }

    /// Forces buffered frames to disk.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn last_flushed_sequence(&self) -> u64 {
        self.last_flushed_sequence.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Lookup;
    use crate::tmpfs::TempDir;

    fn create_wal(dir: &TempDir) -> Wal {
        Wal::open(dir.path(), false, true).expect("Failed to open WAL")
    }

    #[test]
    fn test_append_and_recover() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&temp_dir);

        wal.append(b"key1", Some(b"value1")).expect("append failed");
        wal.append(b"key2", Some(b"value2")).expect("append failed");
        wal.append(b"key1", None).expect("append failed");

        let memtable = Memtable::new(1024);
        let report = wal.recover(&memtable).expect("recover failed");

        assert_eq!(report.recovered, 3);
        assert_eq!(report.corrupted, 0);
        assert_eq!(memtable.get(b"key1"), Lookup::Tombstone);
        assert_eq!(memtable.get(b"key2"), Lookup::Value(b"value2".to_vec()));
    }

    #[test]
    fn test_recover_missing_or_empty_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&temp_dir);

        let memtable = Memtable::new(1024);
        let report = wal.recover(&memtable).expect("recover failed");
        assert_eq!(report, RecoveryReport::default());
        assert!(memtable.is_empty());
    }

    #[test]
    fn test_corrupt_frame_is_skipped() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&temp_dir);

        wal.append(b"key1", Some(b"value1")).expect("append failed");
        wal.append(b"key2", Some(b"value2")).expect("append failed");
        wal.append(b"key3", Some(b"value3")).expect("append failed");
        wal.sync().expect("sync failed");

        // Flip a payload byte inside the second frame.
        let mut data = fs::read(wal.path()).unwrap();
        let first_len =
            u32::from_be_bytes(data[4..8].try_into().unwrap()) as usize + FRAME_HEADER_SIZE;
        data[first_len + FRAME_HEADER_SIZE + 2] ^= 0xFF;
        fs::write(wal.path(), data).unwrap();

        let memtable = Memtable::new(1024);
        let report = wal.recover(&memtable).expect("recover failed");

        assert_eq!(report.recovered, 2);
        assert_eq!(report.corrupted, 1);
        assert_eq!(memtable.get(b"key1"), Lookup::Value(b"value1".to_vec()));
        assert_eq!(memtable.get(b"key2"), Lookup::Missing);
        assert_eq!(memtable.get(b"key3"), Lookup::Value(b"value3".to_vec()));
    }

    #[test]
    fn test_truncated_tail_keeps_earlier_frames() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&temp_dir);

        wal.append(b"key1", Some(b"value1")).expect("append failed");
        wal.append(b"key2", Some(b"value2")).expect("append failed");
        wal.sync().expect("sync failed");

        // Chop the last frame in half, as a crash mid-append would.
        let data = fs::read(wal.path()).unwrap();
        fs::write(wal.path(), &data[..data.len() - 5]).unwrap();

        let memtable = Memtable::new(1024);
        let report = wal.recover(&memtable).expect("recover failed");

        assert_eq!(report.recovered, 1);
        assert_eq!(memtable.get(b"key1"), Lookup::Value(b"value1".to_vec()));
        assert_eq!(memtable.get(b"key2"), Lookup::Missing);
    }

    #[test]
    fn test_implausible_length_stops_recovery() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&temp_dir);

        wal.append(b"key1", Some(b"value1")).expect("append failed");
        wal.sync().expect("sync failed");

        // Append a frame header claiming an absurd payload length.
        let mut data = fs::read(wal.path()).unwrap();
        data.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        data.extend_from_slice(&(MAX_ENTRY_SIZE as u32 + 1).to_be_bytes());
        data.extend_from_slice(b"junk");
        fs::write(wal.path(), data).unwrap();

        let memtable = Memtable::new(1024);
        let report = wal.recover(&memtable).expect("recover failed");
        assert_eq!(report.recovered, 1);
        assert_eq!(report.corrupted, 0);
    }

    #[test]
    fn test_mark_flushed_truncates() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&temp_dir);

        wal.append(b"key1", Some(b"value1")).expect("append failed");
        assert!(wal.size() > 0);

        wal.mark_flushed(1).expect("mark_flushed failed");
        assert_eq!(wal.size(), 0);
        assert_eq!(wal.last_flushed_sequence(), 1);

        // New appends land in the truncated file.
        wal.append(b"key2", Some(b"value2")).expect("append failed");
        let memtable = Memtable::new(1024);
        let report = wal.recover(&memtable).expect("recover failed");
        assert_eq!(report.recovered, 1);
        assert_eq!(memtable.get(b"key2"), Lookup::Value(b"value2".to_vec()));
    }

    #[test]
    fn test_truncate_disabled_preserves_log() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let wal = Wal::open(temp_dir.path(), false, false).expect("Failed to open WAL");

        wal.append(b"key1", Some(b"value1")).expect("append failed");
        let size_before = wal.size();
        wal.mark_flushed(1).expect("mark_flushed failed");
        assert_eq!(wal.size(), size_before);
    }

    #[test]
    fn test_repair_backs_up_and_truncates() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let wal = create_wal(&temp_dir);

        wal.append(b"key1", Some(b"value1")).expect("append failed");
        let backup = wal.repair().expect("repair failed");

        assert!(backup.exists());
        assert!(fs::metadata(&backup).unwrap().len() > 0);
        assert_eq!(wal.size(), 0);
    }

    #[test]
    fn test_sequences_continue_after_recovery() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        {
            let wal = create_wal(&temp_dir);
            assert_eq!(wal.append(b"a", Some(b"1")).unwrap(), 1);
            assert_eq!(wal.append(b"b", Some(b"2")).unwrap(), 2);
        }

        let wal = create_wal(&temp_dir);
        let memtable = Memtable::new(1024);
        wal.recover(&memtable).expect("recover failed");
        assert_eq!(wal.append(b"c", Some(b"3")).unwrap(), 3);
    }
}
