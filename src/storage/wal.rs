//! Write-Ahead Log (WAL)
//!
//! One segment per memtable generation: `walfile/<generation>.wal`.
//!
//! ## Record Format
//! ```text
//! [len: u32 LE] [crc32(payload): u32 LE] [payload: len bytes]
//! payload = bincode(WalRecord { key, value })
//! ```
//!
//! Replay stops at the first torn or corrupt record; everything before it is
//! restored. The writer reopens a segment truncated to its last valid record,
//! so new appends never follow garbage.

use crate::config::DurabilityLevel;
use crate::storage::checksum::Checksum;
use crate::storage::lsm::memtable::MemTable;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

pub const WAL_EXTENSION: &str = "wal";

/// Record header: length + checksum
const HEADER_LEN: usize = 8;

/// `<index>.wal`
pub fn wal_file_name(index: u64) -> String {
    format!("{}.{}", index, WAL_EXTENSION)
}

/// A single logged put
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl WalRecord {
    pub fn encode(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&WalRecord {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&Checksum::compute(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode the record at the start of `data`.
    ///
    /// Returns the record and its encoded length, or an error describing why
    /// the bytes do not form a complete, valid record.
    pub fn decode(data: &[u8]) -> Result<(WalRecord, usize)> {
        if data.len() < HEADER_LEN {
            return Err(StorageError::Corruption(format!(
                "partial record header ({} bytes)",
                data.len()
            )));
        }

        let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let payload = data
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or_else(|| StorageError::Corruption(format!("partial record payload ({} bytes expected)", len)))?;

        Checksum::verify(payload, checksum, "WAL record")?;
        let record: WalRecord = bincode::deserialize(payload)?;
        Ok((record, HEADER_LEN + len))
    }
}

/// Appends records to one segment
pub struct WalWriter {
    path: PathBuf,
    file: Option<File>,
    durability: DurabilityLevel,

    /// End of the last complete record
    offset: u64,
}

impl WalWriter {
    /// Create a new, empty segment
    pub fn create(path: impl AsRef<Path>, durability: DurabilityLevel) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.sync_all()?;

        if let Some(parent) = path.parent() {
            crate::storage::sync_dir(parent)?;
        }

        Ok(Self {
            path,
            file: Some(file),
            durability,
            offset: 0,
        })
    }

    /// Reopen an existing segment for appending after its first `valid_len` bytes
    pub fn open_at(
        path: impl AsRef<Path>,
        valid_len: u64,
        durability: DurabilityLevel,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().write(true).open(&path)?;

        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            path,
            file: Some(file),
            durability,
            offset: valid_len,
        })
    }

    /// Durably append one record (per the durability level)
    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let buf = WalRecord::encode(key, value)?;
        let file = self.file.as_mut().ok_or(StorageError::Closed)?;

        let written = file.write_all(&buf).and_then(|_| {
            if self.durability.syncs_each_write() {
                file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            // Cut off whatever part of the record made it, so later appends
            // do not land behind a torn record
            let _ = self.truncate(self.offset);
            return Err(e.into());
        }

        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Drop every record after the first `len` bytes.
    ///
    /// If the file cannot be cut back the writer is disabled: appending
    /// behind bytes that replay would stop at loses every later record.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        let file = self.file.as_mut().ok_or(StorageError::Closed)?;
        let cut = file
            .set_len(len)
            .and_then(|_| file.seek(SeekFrom::Start(len)).map(|_| ()));

        match cut {
            Ok(()) => {
                self.offset = len;
                Ok(())
            }
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    len,
                    error = %e,
                    "failed to truncate WAL segment, disabling writer"
                );
                self.file = None;
                Err(e.into())
            }
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Sync and release the segment; idempotent
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of complete records
    pub fn len(&self) -> u64 {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to sync WAL segment on drop");
        }
    }
}

/// Outcome of replaying one segment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Records applied
    pub records: u64,

    /// Length of the valid prefix
    pub valid_len: u64,

    /// Length of the file on disk
    pub file_len: u64,
}

impl RestoreSummary {
    /// True when bytes after the valid prefix were ignored
    pub fn is_torn(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Replays one segment
pub struct WalReader {
    path: PathBuf,

    /// `None` once closed
    file: Option<File>,
}

impl WalReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("WAL segment {}: {}", path.display(), e),
            ))
        })?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply every valid record to `memtable`, in log order
    pub fn restore_memtable(&mut self, memtable: &dyn MemTable) -> Result<RestoreSummary> {
        let file = self.file.as_mut().ok_or(StorageError::Closed)?;
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let mut summary = RestoreSummary {
            file_len: data.len() as u64,
            ..Default::default()
        };

        let mut pos = 0usize;
        while pos < data.len() {
            match WalRecord::decode(&data[pos..]) {
                Ok((record, consumed)) => {
                    memtable.put(&record.key, &record.value)?;
                    summary.records += 1;
                    pos += consumed;
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        offset = pos,
                        ignored_bytes = data.len() - pos,
                        error = %e,
                        "stopping WAL replay at torn or corrupt record"
                    );
                    break;
                }
            }
        }

        summary.valid_len = pos as u64;
        Ok(summary)
    }

    /// Release the file handle; idempotent
    pub fn close(&mut self) {
        self.file.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::lsm::memtable::BTreeMemTable;
    use std::fs;
    use tempfile::TempDir;

    fn write_records(path: &Path, count: u32) {
        let mut writer = WalWriter::create(path, DurabilityLevel::NoSync).unwrap();
        for i in 0..count {
            writer
                .write(format!("key_{}", i).as_bytes(), format!("value_{}", i).as_bytes())
                .unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_wal_file_name() {
        assert_eq!(wal_file_name(1562), "1562.wal");
    }

    #[test]
    fn test_write_and_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_file_name(0));
        write_records(&path, 100);

        let memtable = BTreeMemTable::new();
        let summary = WalReader::open(&path).unwrap().restore_memtable(&memtable).unwrap();

        assert_eq!(summary.records, 100);
        assert!(!summary.is_torn());
        assert_eq!(memtable.len(), 100);
        assert_eq!(memtable.get(b"key_42"), Some(b"value_42".to_vec()));
    }

    #[test]
    fn test_replay_applies_in_log_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_file_name(3));
        let mut writer = WalWriter::create(&path, DurabilityLevel::Synchronous).unwrap();
        writer.write(b"k", b"first").unwrap();
        writer.write(b"k", b"second").unwrap();
        writer.close().unwrap();

        let memtable = BTreeMemTable::new();
        WalReader::open(&path).unwrap().restore_memtable(&memtable).unwrap();
        assert_eq!(memtable.get(b"k"), Some(b"second".to_vec()));
    }

    #[test]
    fn test_torn_tail_is_ignored_and_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_file_name(1));
        write_records(&path, 10);
        let full_len = fs::metadata(&path).unwrap().len();

        // Simulate a crash in the middle of the last record
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 3).unwrap();
        drop(file);

        let memtable = BTreeMemTable::new();
        let summary = WalReader::open(&path).unwrap().restore_memtable(&memtable).unwrap();
        assert_eq!(summary.records, 9);
        assert!(summary.is_torn());
        assert_eq!(memtable.get(b"key_9"), None);

        // Appending resumes after the last valid record
        let mut writer = WalWriter::open_at(&path, summary.valid_len, DurabilityLevel::NoSync).unwrap();
        writer.write(b"key_new", b"v").unwrap();
        writer.close().unwrap();

        let memtable = BTreeMemTable::new();
        let summary = WalReader::open(&path).unwrap().restore_memtable(&memtable).unwrap();
        assert_eq!(summary.records, 10);
        assert!(!summary.is_torn());
        assert_eq!(memtable.get(b"key_new"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_corrupt_record_stops_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_file_name(2));
        write_records(&path, 5);

        let mut data = fs::read(&path).unwrap();
        let first_len = WalRecord::decode(&data).unwrap().1;
        // Flip a payload byte of the second record
        data[first_len + HEADER_LEN + 1] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let memtable = BTreeMemTable::new();
        let summary = WalReader::open(&path).unwrap().restore_memtable(&memtable).unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(summary.valid_len, first_len as u64);
    }

    #[test]
    fn test_closed_writer_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let mut writer =
            WalWriter::create(dir.path().join(wal_file_name(0)), DurabilityLevel::NoSync).unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.write(b"k", b"v"), Err(StorageError::Closed)));
        assert!(writer.close().is_ok());
    }

    #[test]
    fn test_empty_segment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_file_name(0));
        write_records(&path, 0);

        let memtable = BTreeMemTable::new();
        let summary = WalReader::open(&path).unwrap().restore_memtable(&memtable).unwrap();
        assert_eq!(summary, RestoreSummary::default());
        assert!(WalReader::open(dir.path().join("missing.wal")).is_err());
    }

    #[test]
    fn test_failed_rollback_disables_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_file_name(0));
        write_records(&path, 3);
        let valid_len = fs::metadata(&path).unwrap().len();

        // A read-only handle fails the append and the truncate behind it
        let mut writer = WalWriter {
            path: path.clone(),
            file: Some(File::open(&path).unwrap()),
            durability: DurabilityLevel::NoSync,
            offset: valid_len,
        };
        assert!(matches!(writer.write(b"k", b"v"), Err(StorageError::Io(_))));
        assert!(matches!(writer.write(b"k", b"v"), Err(StorageError::Closed)));
        drop(writer);

        let memtable = BTreeMemTable::new();
        let summary = WalReader::open(&path).unwrap().restore_memtable(&memtable).unwrap();
        assert_eq!(summary.records, 3);
        assert!(!summary.is_torn());
    }

    #[test]
    fn test_truncate_drops_trailing_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_file_name(0));
        let mut writer = WalWriter::create(&path, DurabilityLevel::NoSync).unwrap();
        writer.write(b"kept", b"1").unwrap();
        let kept_len = writer.len();
        writer.write(b"dropped", b"2").unwrap();

        writer.truncate(kept_len).unwrap();
        assert_eq!(writer.len(), kept_len);
        writer.write(b"after", b"3").unwrap();
        writer.close().unwrap();

        let memtable = BTreeMemTable::new();
        let summary = WalReader::open(&path).unwrap().restore_memtable(&memtable).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(memtable.get(b"kept"), Some(b"1".to_vec()));
        assert_eq!(memtable.get(b"dropped"), None);
        assert_eq!(memtable.get(b"after"), Some(b"3".to_vec()));
    }

    #[test]
    fn test_closed_reader_rejects_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(wal_file_name(3));
        write_records(&path, 2);

        let memtable = BTreeMemTable::new();
        let mut reader = WalReader::open(&path).unwrap();
        assert_eq!(reader.restore_memtable(&memtable).unwrap().records, 2);
        reader.close();
        reader.close();
        assert!(matches!(reader.restore_memtable(&memtable), Err(StorageError::Closed)));
    }
}
