//! Lock-free skip-list memtable
//!
//! Readers never block writers. Size accounting assumes puts are serialized
//! by the caller (the tree's write lock), which keeps the old-value lookup
//! and the insert consistent.

use super::memtable::MemTable;
use crate::{Result, StorageError};
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct SkipListMemTable {
    map: SkipMap<Vec<u8>, Vec<u8>>,
    size: AtomicU64,
    closed: AtomicBool,
}

impl SkipListMemTable {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            size: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for SkipListMemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable for SkipListMemTable {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }

        if let Some(old_entry) = self.map.get(key) {
            let old_size = (key.len() + old_entry.value().len()) as u64;
            self.size.fetch_sub(old_size, Ordering::Relaxed);
        }

        self.map.insert(key.to_vec(), value.to_vec());
        self.size
            .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn all(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
