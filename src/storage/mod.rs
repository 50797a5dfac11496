//! Storage layer implementation
//!
//! LSM-tree engine plus the write-ahead log and checksum helpers it shares.

pub mod checksum;
pub mod lsm;
pub mod wal;

pub use checksum::Checksum;
pub use lsm::{MemTable, MemTableKind, Tree, TreeStats};
pub use wal::{RestoreSummary, WalReader, WalRecord, WalWriter};

use std::path::Path;

/// Make renames and unlinks in `dir` durable
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

/// Directories cannot be opened for syncing on this platform
#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
