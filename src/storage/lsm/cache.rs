//! Shared LRU cache of decoded data blocks
//!
//! Keyed by `(node seq, block index)`. Sequences are never reused, so entries
//! of a deleted node can only go stale, never alias another node's blocks.

use super::sstable::DataBlock;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type BlockKey = (u64, u32);

pub struct BlockCache {
    cache: Mutex<LruCache<BlockKey, Arc<DataBlock>, ahash::RandomState>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// `None` when `capacity` is zero (caching disabled)
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            cache: Mutex::new(LruCache::with_hasher(capacity, ahash::RandomState::new())),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub(crate) fn get(&self, seq: u64, block: u32) -> Option<Arc<DataBlock>> {
        let found = self.cache.lock().get(&(seq, block)).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub(crate) fn insert(&self, seq: u64, block: u32, data: Arc<DataBlock>) {
        self.cache.lock().put((seq, block), data);
    }

    /// Drop every cached block of node `seq`
    pub fn evict_node(&self, seq: u64) {
        let mut cache = self.cache.lock();
        let stale: Vec<BlockKey> = cache
            .iter()
            .filter(|((s, _), _)| *s == seq)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
