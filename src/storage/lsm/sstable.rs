//! SSTable: Sorted String Table (persistent storage)
//!
//! ## File Format
//! ```text
//! [Data Block 0] [Data Block 1] ... [Data Block N-1]
//! [Filter 0] [Filter 1] ... [Filter N-1]
//! [Index Section (bincode: block handles + table meta)]
//! [Footer (48 bytes)]
//! ```
//!
//! ## Data Block
//! ```text
//! [flag: u8 (0 = raw, 1 = snappy)] [body] [crc32(flag + body): u32]
//! body = [count: u32] { [klen: u32] [key] [vlen: u32] [value] } * count
//! ```
//!
//! ## Publication
//! Tables are written to `<level>_<seq>.sst.tmp`, fsynced, and renamed to
//! `<level>_<seq>.sst`, so a directory scan never sees a half-written file.
//! Every table produced by one flush or compaction belongs to an output
//! group recorded in its meta; recovery uses it to finish or roll back an
//! interrupted publication.

use super::bloom::BloomFilter;
use crate::config::TreeConfig;
use crate::storage::checksum::{Checksum, CHECKSUM_LEN};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic number for SSTable files (ASCII "LSMK")
pub const SSTABLE_MAGIC: u32 = 0x4C53_4D4B;

pub const SSTABLE_VERSION: u32 = 1;

pub const FOOTER_SIZE: usize = 48;

pub const SST_EXTENSION: &str = "sst";
pub const TMP_SUFFIX: &str = ".tmp";

/// Below this size compression overhead outweighs the benefit
const MIN_COMPRESS_SIZE: usize = 256;

const FLAG_RAW: u8 = 0;
const FLAG_SNAPPY: u8 = 1;

/// `<level>_<seq>.sst`
pub fn sst_file_name(level: usize, seq: u64) -> String {
    format!("{}_{}.{}", level, seq, SST_EXTENSION)
}

/// Estimated on-disk footprint of `raw` payload bytes (25% for index and filters)
pub fn estimate_table_size(raw: u64) -> u64 {
    raw * 5 / 4
}

/// Per-block index entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHandle {
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub offset: u64,
    pub len: u32,
    pub filter_offset: u64,
    pub filter_len: u32,
}

/// Output group a table was published with
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputGroup {
    /// Sequence of the group's first table
    pub id: u64,

    /// Position of this table within the group
    pub index: u32,

    /// Set on the group's final table
    pub last: bool,

    /// Files (relative to the tree root) superseded by this group
    pub replaces: Vec<String>,
}

/// Table-level metadata stored in the index section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub level: u32,
    pub seq: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub num_entries: u64,
    pub group: OutputGroup,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IndexSection {
    pub blocks: Vec<BlockHandle>,
    pub meta: TableMeta,
}

/// SSTable footer (stored at end of file)
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Footer {
    pub filter_offset: u64,
    pub filter_len: u64,
    pub index_offset: u64,
    pub index_len: u32,
    pub index_checksum: u32,
}

impl Footer {
    pub fn serialize(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..4].copy_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&SSTABLE_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.filter_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.filter_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.index_len.to_le_bytes());
        buf[36..40].copy_from_slice(&self.index_checksum.to_le_bytes());
        let checksum = Checksum::compute(&buf[0..40]);
        buf[40..44].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(StorageError::Corruption("Footer has wrong size".into()));
        }

        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        if u32_at(0) != SSTABLE_MAGIC {
            return Err(StorageError::Corruption("Invalid SSTable magic".into()));
        }
        let version = u32_at(4);
        if version != SSTABLE_VERSION {
            return Err(StorageError::Corruption(format!(
                "Unsupported SSTable version {}",
                version
            )));
        }
        Checksum::verify(&data[0..40], u32_at(40), "footer")?;

        Ok(Self {
            filter_offset: u64_at(8),
            filter_len: u64_at(16),
            index_offset: u64_at(24),
            index_len: u32_at(32),
            index_checksum: u32_at(36),
        })
    }
}

/// Decoded data block
#[derive(Debug, Default)]
pub(crate) struct DataBlock {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    raw_size: usize,
}

impl DataBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        self.raw_size += 8 + key.len() + value.len();
        self.entries.push((key.to_vec(), value.to_vec()));
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|idx| self.entries[idx].1.as_slice())
    }

    /// Encoded size before compression
    pub fn size(&self) -> usize {
        4 + self.raw_size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn serialize_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (key, value) in &self.entries {
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value);
        }
        buf
    }

    /// On-disk bytes: flag + (possibly compressed) body + crc
    pub fn encode(&self, enable_compression: bool) -> Result<Vec<u8>> {
        let body = self.serialize_body();

        let mut out = Vec::with_capacity(body.len() + 1 + CHECKSUM_LEN);
        if enable_compression && body.len() >= MIN_COMPRESS_SIZE {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(&body)
                .map_err(|e| StorageError::Serialization(format!("Compression failed: {}", e)))?;

            // Only use compressed if it's actually smaller
            if compressed.len() < body.len() {
                out.push(FLAG_SNAPPY);
                out.extend_from_slice(&compressed);
                Checksum::seal(&mut out);
                return Ok(out);
            }
        }

        out.push(FLAG_RAW);
        out.extend_from_slice(&body);
        Checksum::seal(&mut out);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let data = Checksum::unseal(data, "data block")?;
        let (&flag, payload) = data
            .split_first()
            .ok_or_else(|| StorageError::Corruption("Empty block data".into()))?;

        match flag {
            FLAG_RAW => Self::decode_body(payload),
            FLAG_SNAPPY => {
                let body = snap::raw::Decoder::new()
                    .decompress_vec(payload)
                    .map_err(|e| StorageError::Corruption(format!("Decompression failed: {}", e)))?;
                Self::decode_body(&body)
            }
            other => Err(StorageError::Corruption(format!(
                "Unknown block compression flag: {}",
                other
            ))),
        }
    }

    fn decode_body(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let count = reader.u32()? as usize;

        let mut block = DataBlock {
            entries: Vec::with_capacity(count.min(data.len() / 8 + 1)),
            raw_size: 0,
        };
        for _ in 0..count {
            let klen = reader.u32()? as usize;
            let key = reader.bytes(klen)?;
            let vlen = reader.u32()? as usize;
            let value = reader.bytes(vlen)?;
            block.add(key, value);
        }

        if !reader.is_exhausted() {
            return Err(StorageError::Corruption("Trailing bytes in data block".into()));
        }
        Ok(block)
    }
}

/// Bounds-checked little-endian reader
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| StorageError::Corruption("Truncated data block".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.data.len()
    }
}

/// Knobs the builder takes from the tree configuration
#[derive(Clone, Debug)]
pub struct TableOptions {
    pub block_size: usize,
    pub bloom_bits_per_key: usize,
    pub enable_compression: bool,
}

impl From<&TreeConfig> for TableOptions {
    fn from(config: &TreeConfig) -> Self {
        Self {
            block_size: config.block_size,
            bloom_bits_per_key: config.bloom_bits_per_key,
            enable_compression: config.enable_compression,
        }
    }
}

/// SSTable builder (write-only, one file)
pub struct TableBuilder {
    writer: BufWriter<File>,
    tmp_path: PathBuf,
    path: PathBuf,
    level: usize,
    seq: u64,
    options: TableOptions,

    current_block: DataBlock,
    blocks: Vec<BlockHandle>,
    filters: Vec<Vec<u8>>,

    num_entries: u64,
    raw_bytes: u64,
    start_key: Option<Vec<u8>>,
    last_key: Vec<u8>,

    /// Current file offset
    offset: u64,
}

impl TableBuilder {
    pub fn create(dir: &Path, level: usize, seq: u64, options: TableOptions) -> Result<Self> {
        let path = dir.join(sst_file_name(level, seq));
        let tmp_path = dir.join(format!("{}{}", sst_file_name(level, seq), TMP_SUFFIX));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            tmp_path,
            path,
            level,
            seq,
            options,
            current_block: DataBlock::new(),
            blocks: Vec::new(),
            filters: Vec::new(),
            num_entries: 0,
            raw_bytes: 0,
            start_key: None,
            last_key: Vec::new(),
            offset: 0,
        })
    }

    /// Add a key-value pair (keys must be strictly ascending)
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.start_key.is_some() && key <= self.last_key.as_slice() {
            return Err(StorageError::InvalidArgument(
                "SSTable keys must be added in strictly ascending order".into(),
            ));
        }
        if self.start_key.is_none() {
            self.start_key = Some(key.to_vec());
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);

        self.num_entries += 1;
        self.raw_bytes += (key.len() + value.len()) as u64;
        self.current_block.add(key, value);

        if self.current_block.size() >= self.options.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Estimated size of the finished file
    pub fn estimated_size(&self) -> u64 {
        estimate_table_size(self.raw_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Write filters, index and footer, then fsync. The file stays under its
    /// temporary name until [`PendingTable::publish`].
    pub fn finish(mut self, group: OutputGroup) -> Result<PendingTable> {
        match self.write_trailer(group) {
            Ok(meta) => Ok(PendingTable {
                tmp_path: self.tmp_path,
                path: self.path,
                level: self.level,
                seq: self.seq,
                file_size: self.offset,
                meta,
            }),
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    fn write_trailer(&mut self, group: OutputGroup) -> Result<TableMeta> {
        self.flush_block()?;

        let start_key = self.start_key.take().ok_or_else(|| {
            StorageError::InvalidArgument("Cannot finish an empty SSTable".into())
        })?;

        // Filters
        let filter_offset = self.offset;
        let filters = std::mem::take(&mut self.filters);
        for (handle, filter) in self.blocks.iter_mut().zip(filters.iter()) {
            handle.filter_offset = self.offset;
            handle.filter_len = filter.len() as u32;
            self.writer.write_all(filter)?;
            self.offset += filter.len() as u64;
        }
        let filter_len = self.offset - filter_offset;

        // Index + meta
        let section = IndexSection {
            blocks: std::mem::take(&mut self.blocks),
            meta: TableMeta {
                level: self.level as u32,
                seq: self.seq,
                start_key,
                end_key: std::mem::take(&mut self.last_key),
                num_entries: self.num_entries,
                group,
            },
        };
        let index_data = bincode::serialize(&section)?;
        let index_offset = self.offset;
        self.writer.write_all(&index_data)?;
        self.offset += index_data.len() as u64;

        let footer = Footer {
            filter_offset,
            filter_len,
            index_offset,
            index_len: index_data.len() as u32,
            index_checksum: Checksum::compute(&index_data),
        };
        self.writer.write_all(&footer.serialize())?;
        self.offset += FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        Ok(section.meta)
    }

    /// Drop the partially written file
    pub fn abandon(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self.writer);
        let _ = fs::remove_file(tmp_path);
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.current_block.is_empty() {
            return Ok(());
        }

        let block = std::mem::take(&mut self.current_block);
        let filter = BloomFilter::build(
            block.entries.iter().map(|(k, _)| k.as_slice()),
            block.entries.len(),
            self.options.bloom_bits_per_key,
        );

        let block_data = block.encode(self.options.enable_compression)?;
        let (min_key, max_key) = match (block.entries.first(), block.entries.last()) {
            (Some((first, _)), Some((last, _))) => (first.clone(), last.clone()),
            _ => return Err(StorageError::Corruption("Empty block".into())),
        };

        self.blocks.push(BlockHandle {
            min_key,
            max_key,
            offset: self.offset,
            len: block_data.len() as u32,
            filter_offset: 0,
            filter_len: 0,
        });
        self.filters.push(filter.to_bytes());

        self.writer.write_all(&block_data)?;
        self.offset += block_data.len() as u64;
        Ok(())
    }
}

/// A finished table still under its temporary name
#[derive(Debug)]
pub struct PendingTable {
    pub tmp_path: PathBuf,
    pub path: PathBuf,
    pub level: usize,
    pub seq: u64,
    pub file_size: u64,
    pub meta: TableMeta,
}

impl PendingTable {
    pub fn publish(&self) -> Result<()> {
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }

    /// Remove the table under either name
    pub fn discard(&self) {
        let _ = fs::remove_file(&self.tmp_path);
        let _ = fs::remove_file(&self.path);
    }
}

/// Rename every table of a group into place, then fsync the directory.
/// On failure every table of the group is removed again.
pub fn publish_group(dir: &Path, tables: &[PendingTable]) -> Result<()> {
    for table in tables {
        if let Err(e) = table.publish() {
            tables.iter().for_each(PendingTable::discard);
            return Err(e);
        }
    }
    crate::storage::sync_dir(dir)?;
    Ok(())
}

/// Writes a sorted stream into one output group, starting a new table
/// whenever the next entry would push the current one over `sst_size`
pub struct TableWriter<'a> {
    dir: PathBuf,
    level: usize,
    options: TableOptions,
    sst_size: u64,
    next_seq: &'a AtomicU64,
    replaces: Vec<String>,

    group_id: Option<u64>,
    current: Option<TableBuilder>,
    finished: Vec<PendingTable>,
}

impl<'a> TableWriter<'a> {
    pub fn new(
        config: &TreeConfig,
        level: usize,
        next_seq: &'a AtomicU64,
        replaces: Vec<String>,
    ) -> Self {
        Self {
            dir: config.dir.clone(),
            level,
            options: TableOptions::from(config),
            sst_size: config.sst_size,
            next_seq,
            replaces,
            group_id: None,
            current: None,
            finished: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let entry_size = estimate_table_size((key.len() + value.len()) as u64);

        let split = match &self.current {
            Some(builder) => {
                !builder.is_empty() && builder.estimated_size() + entry_size > self.sst_size
            }
            None => false,
        };
        if split {
            self.finish_current(false)?;
        }

        if self.current.is_none() {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            self.group_id.get_or_insert(seq);
            self.current = Some(TableBuilder::create(
                &self.dir,
                self.level,
                seq,
                self.options.clone(),
            )?);
        }

        match self.current.as_mut() {
            Some(builder) => builder.add(key, value),
            None => Err(StorageError::Corruption("Table writer lost its builder".into())),
        }
    }

    /// Finish the group; empty input yields no tables
    pub fn finish(mut self) -> Result<Vec<PendingTable>> {
        if self.current.is_some() {
            if let Err(e) = self.finish_current(true) {
                self.abandon();
                return Err(e);
            }
        }
        Ok(std::mem::take(&mut self.finished))
    }

    /// Remove everything written so far
    pub fn abandon(mut self) {
        if let Some(builder) = self.current.take() {
            builder.abandon();
        }
        self.finished.iter().for_each(PendingTable::discard);
        self.finished.clear();
    }

    fn finish_current(&mut self, last: bool) -> Result<()> {
        if let Some(builder) = self.current.take() {
            let group = OutputGroup {
                id: self.group_id.unwrap_or_else(|| builder.seq()),
                index: self.finished.len() as u32,
                last,
                replaces: self.replaces.clone(),
            };
            let table = builder.finish(group)?;
            self.finished.push(table);
        }
        Ok(())
    }
}
