//! MemTable: in-memory sorted write buffer
//!
//! The tree only relies on the [`MemTable`] capability set, so any sorted
//! in-memory structure can back it. Two implementations ship with the crate:
//! - [`BTreeMemTable`]: `BTreeMap` behind a reader/writer lock
//! - [`SkipListMemTable`](super::skiplist::SkipListMemTable): lock-free skip list
//!
//! ## Size accounting
//! `size()` is the sum of key and value lengths of live entries. Overwriting a
//! key replaces the old entry's contribution.

use super::skiplist::SkipListMemTable;
use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Capability set the tree needs from an in-memory table
pub trait MemTable: Send + Sync {
    /// Insert or overwrite `key`
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Every entry in ascending key order
    fn all(&self) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// Approximate payload bytes held (keys + values)
    fn size(&self) -> u64;

    /// Number of distinct keys
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release resources; further puts are rejected
    fn close(&self);
}

/// Factory producing a fresh, empty memtable
pub type MemTableFactory = Arc<dyn Fn() -> Arc<dyn MemTable> + Send + Sync>;

/// A frozen memtable waiting to be flushed, with the WAL segment backing it
pub struct ReadOnlyMemTable {
    pub memtable: Arc<dyn MemTable>,
    pub wal_path: PathBuf,

    /// WAL generation, also the flush order
    pub generation: u64,
}

/// Built-in memtable implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MemTableKind {
    #[default]
    BTree,
    SkipList,
}

impl MemTableKind {
    pub fn factory(self) -> MemTableFactory {
        match self {
            MemTableKind::BTree => Arc::new(|| Arc::new(BTreeMemTable::new()) as Arc<dyn MemTable>),
            MemTableKind::SkipList => {
                Arc::new(|| Arc::new(SkipListMemTable::new()) as Arc<dyn MemTable>)
            }
        }
    }
}

/// Ordered-map memtable
pub struct BTreeMemTable {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,

    /// Current size in bytes
    size: AtomicU64,

    closed: AtomicBool,
}

impl BTreeMemTable {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for BTreeMemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable for BTreeMemTable {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::StorageError::Closed);
        }

        let entry_size = (key.len() + value.len()) as u64;
        let mut data = self.data.write();

        if let Some(old_value) = data.insert(key.to_vec(), value.to_vec()) {
            let old_size = (key.len() + old_value.len()) as u64;
            self.size.fetch_sub(old_size, Ordering::Relaxed);
        }
        self.size.fetch_add(entry_size, Ordering::Relaxed);

        Ok(())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    fn all(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn implementations() -> Vec<(&'static str, Arc<dyn MemTable>)> {
        vec![
            ("btree", (MemTableKind::BTree.factory())()),
            ("skiplist", (MemTableKind::SkipList.factory())()),
        ]
    }

    #[test]
    fn test_put_get() {
        for (name, memtable) in implementations() {
            memtable.put(b"key", b"value").unwrap();
            assert_eq!(memtable.get(b"key"), Some(b"value".to_vec()), "{}", name);
            assert_eq!(memtable.get(b"missing"), None, "{}", name);
        }
    }

    #[test]
    fn test_last_write_wins() {
        for (name, memtable) in implementations() {
            memtable.put(b"key", b"v1").unwrap();
            memtable.put(b"key", b"v2").unwrap();
            assert_eq!(memtable.get(b"key"), Some(b"v2".to_vec()), "{}", name);
            assert_eq!(memtable.len(), 1, "{}", name);
        }
    }

    #[test]
    fn test_size_tracking() {
        for (name, memtable) in implementations() {
            assert_eq!(memtable.size(), 0, "{}", name);

            memtable.put(b"abc", b"12345").unwrap();
            assert_eq!(memtable.size(), 8, "{}", name);

            // Overwrite replaces the old contribution
            memtable.put(b"abc", b"1").unwrap();
            assert_eq!(memtable.size(), 4, "{}", name);

            memtable.put(b"d", b"").unwrap();
            assert_eq!(memtable.size(), 5, "{}", name);
        }
    }

    #[test]
    fn test_all_is_sorted() {
        for (name, memtable) in implementations() {
            for key in ["delta", "alpha", "charlie", "bravo"] {
                memtable.put(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
            }

            let keys: Vec<Vec<u8>> = memtable.all().into_iter().map(|(k, _)| k).collect();
            assert_eq!(
                keys,
                vec![
                    b"alpha".to_vec(),
                    b"bravo".to_vec(),
                    b"charlie".to_vec(),
                    b"delta".to_vec()
                ],
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_closed_rejects_puts() {
        for (name, memtable) in implementations() {
            memtable.put(b"k", b"v").unwrap();
            memtable.close();
            assert!(memtable.put(b"k2", b"v").is_err(), "{}", name);
            assert_eq!(memtable.get(b"k"), Some(b"v".to_vec()), "{}", name);
        }
    }
}
