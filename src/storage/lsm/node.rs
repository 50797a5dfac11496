//! Node: an opened, immutable SSTable
//!
//! Opening a node loads the footer, block index, table meta and every block
//! filter. Data blocks are read lazily through one shared file handle
//! (seek + read under a mutex), optionally via the tree's block cache.
//!
//! A node replaced by compaction is marked obsolete; its file is removed when
//! the last `Arc<Node>` goes away, so lookups that still hold a snapshot of
//! the old level finish against a file that is still there.

use super::bloom::BloomFilter;
use super::cache::BlockCache;
use super::sstable::{
    sst_file_name, BlockHandle, DataBlock, Footer, IndexSection, OutputGroup, TableMeta,
    FOOTER_SIZE,
};
use crate::storage::checksum::Checksum;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

pub struct Node {
    path: PathBuf,
    level: usize,
    seq: u64,

    /// File length in bytes
    size: u64,

    meta: TableMeta,
    blocks: Vec<BlockHandle>,
    filters: Vec<BloomFilter>,

    /// `None` once closed
    file: Mutex<Option<File>>,
    cache: Option<Arc<BlockCache>>,

    obsolete: AtomicBool,
}

impl Node {
    /// Open `path`, which must hold level `level`, sequence `seq`
    pub fn open(
        path: impl AsRef<Path>,
        level: usize,
        seq: u64,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();

        let corrupted = |reason: String| StorageError::corrupted_file(&path, reason);

        if size < FOOTER_SIZE as u64 {
            return Err(corrupted(format!("file too small ({} bytes)", size)));
        }

        // Footer
        file.seek(SeekFrom::Start(size - FOOTER_SIZE as u64))?;
        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer_buf)?;
        let footer = Footer::deserialize(&footer_buf).map_err(|e| corrupted(e.to_string()))?;

        let index_end = footer.index_offset + footer.index_len as u64;
        let filter_end = footer.filter_offset + footer.filter_len;
        if index_end != size - FOOTER_SIZE as u64 || filter_end != footer.index_offset {
            return Err(corrupted("footer offsets out of bounds".into()));
        }

        // Index + meta
        file.seek(SeekFrom::Start(footer.index_offset))?;
        let mut index_buf = vec![0u8; footer.index_len as usize];
        file.read_exact(&mut index_buf)?;
        Checksum::verify(&index_buf, footer.index_checksum, "index section")
            .map_err(|e| corrupted(e.to_string()))?;
        let section: IndexSection =
            bincode::deserialize(&index_buf).map_err(|e| corrupted(e.to_string()))?;

        if section.meta.level as usize != level || section.meta.seq != seq {
            return Err(corrupted(format!(
                "meta says level {} seq {}, file name says level {} seq {}",
                section.meta.level, section.meta.seq, level, seq
            )));
        }
        if section.blocks.is_empty() {
            return Err(corrupted("table has no data blocks".into()));
        }

        // Filters
        file.seek(SeekFrom::Start(footer.filter_offset))?;
        let mut filter_buf = vec![0u8; footer.filter_len as usize];
        file.read_exact(&mut filter_buf)?;

        let mut filters = Vec::with_capacity(section.blocks.len());
        for handle in &section.blocks {
            let start = handle
                .filter_offset
                .checked_sub(footer.filter_offset)
                .map(|s| s as usize)
                .ok_or_else(|| corrupted("filter offset before filter section".into()))?;
            let end = start + handle.filter_len as usize;
            let bytes = filter_buf
                .get(start..end)
                .ok_or_else(|| corrupted("filter out of bounds".into()))?;
            let filter =
                BloomFilter::from_bytes(bytes).ok_or_else(|| corrupted("invalid filter".into()))?;
            filters.push(filter);
        }

        Ok(Self {
            path,
            level,
            seq,
            size,
            meta: section.meta,
            blocks: section.blocks,
            filters,
            file: Mutex::new(Some(file)),
            cache,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Point lookup
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // First block whose max_key >= key
        let idx = self.blocks.partition_point(|b| b.max_key.as_slice() < key);
        let handle = match self.blocks.get(idx) {
            Some(handle) => handle,
            None => return Ok(None),
        };
        if handle.min_key.as_slice() > key {
            return Ok(None);
        }

        // Fast negative lookup
        if !self.filters[idx].may_contain(key) {
            return Ok(None);
        }

        let block = self.read_block(idx, true)?;
        Ok(block.get(key).map(|v| v.to_vec()))
    }

    /// Stream every entry in key order
    pub fn iter(self: &Arc<Self>) -> NodeIter {
        NodeIter {
            node: Arc::clone(self),
            next_block: 0,
            block: None,
            pos: 0,
            done: false,
        }
    }

    fn read_block(&self, idx: usize, fill_cache: bool) -> Result<Arc<DataBlock>> {
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.get(self.seq, idx as u32) {
                return Ok(block);
            }
        }

        let handle = &self.blocks[idx];
        let mut buf = vec![0u8; handle.len as usize];
        {
            let mut guard = self.file.lock();
            let file = guard.as_mut().ok_or(StorageError::Closed)?;
            file.seek(SeekFrom::Start(handle.offset))?;
            file.read_exact(&mut buf)?;
        }

        let block = Arc::new(DataBlock::decode(&buf).map_err(|e| {
            StorageError::Corruption(format!("{} block {}: {}", self.path.display(), idx, e))
        })?);

        if fill_cache {
            if let Some(cache) = &self.cache {
                cache.insert(self.seq, idx as u32, Arc::clone(&block));
            }
        }
        Ok(block)
    }

    /// Release the file handle; later reads fail with `Closed`
    pub fn close(&self) {
        self.file.lock().take();
    }

    /// Schedule the file for deletion once the last reference drops
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name relative to the tree root
    pub fn file_name(&self) -> String {
        sst_file_name(self.level, self.seq)
    }

    pub fn start_key(&self) -> &[u8] {
        &self.meta.start_key
    }

    pub fn end_key(&self) -> &[u8] {
        &self.meta.end_key
    }

    pub fn num_entries(&self) -> u64 {
        self.meta.num_entries
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn group(&self) -> &OutputGroup {
        &self.meta.group
    }

    pub fn contains_key_range(&self, key: &[u8]) -> bool {
        self.start_key() <= key && key <= self.end_key()
    }

    /// True when `[start, end]` intersects this node's range
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.start_key() <= end && start <= self.end_key()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }

        self.file.get_mut().take();
        if let Some(cache) = &self.cache {
            cache.evict_node(self.seq);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => trace!(path = %self.path.display(), "removed obsolete sstable"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove obsolete sstable"),
        }
    }
}

/// Streaming iterator over one node; blocks are read one at a time and
/// bypass the block cache
pub struct NodeIter {
    node: Arc<Node>,
    next_block: usize,
    block: Option<Arc<DataBlock>>,
    pos: usize,
    done: bool,
}

impl Iterator for NodeIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(block) = &self.block {
                if let Some((k, v)) = block.entries.get(self.pos) {
                    self.pos += 1;
                    return Some(Ok((k.clone(), v.clone())));
                }
            }

            if self.next_block >= self.node.blocks.len() {
                self.done = true;
                return None;
            }

            match self.node.read_block(self.next_block, false) {
                Ok(block) => {
                    self.block = Some(block);
                    self.pos = 0;
                    self.next_block += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
