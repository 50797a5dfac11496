//! Startup reconstruction
//!
//! ## SSTables
//! 1. Remove `*.tmp` leftovers of interrupted table writes
//! 2. List `<level>_<seq>.sst`, sorted numerically by (level, seq)
//! 3. Open every table (footer, index, meta, filters)
//! 4. Reconcile output groups
//! 5. Build the level set (levels >= 1 must be disjoint)
//!
//! ## Reconciliation
//! Flush and compaction run one at a time, and a group is fully published
//! before the next group allocates its sequences. So only the newest group
//! on disk can be incomplete; if it is, its tables are removed (the inputs it
//! would have replaced are still in place). Every other group is complete,
//! and any file it replaces that still exists is a leftover of a swap cut
//! short by a crash; those are removed.
//!
//! ## WAL
//! Segments are replayed in generation order. All but the newest become
//! read-only memtables queued for flush; the newest stays active. Only the
//! newest may end in a torn record, which is cut off; a bad record in an
//! older segment fails the open.

use super::cache::BlockCache;
use super::level::LevelSet;
use super::memtable::{MemTable, ReadOnlyMemTable};
use super::node::Node;
use super::sstable::{SST_EXTENSION, TMP_SUFFIX};
use crate::config::{TreeConfig, WAL_DIR_NAME};
use crate::storage::wal::{wal_file_name, WalReader, WalWriter, WAL_EXTENSION};
use crate::{Result, StorageError};
use ahash::{AHashMap, AHashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An SSTable file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SstEntry {
    pub level: usize,
    pub seq: u64,
    pub path: PathBuf,
}

/// Parse `<level>_<seq>.sst`
pub fn get_level_and_seq_from_sst(name: &str) -> Result<(usize, u64)> {
    let invalid = |reason: &str| StorageError::corrupted_file(name, reason);

    let stem = name
        .strip_suffix(SST_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .ok_or_else(|| invalid("missing .sst extension"))?;
    let (level, seq) = stem
        .split_once('_')
        .ok_or_else(|| invalid("expected <level>_<seq>.sst"))?;

    let level = level
        .parse::<usize>()
        .map_err(|_| invalid("level is not a number"))?;
    let seq = seq.parse::<u64>().map_err(|_| invalid("seq is not a number"))?;
    Ok((level, seq))
}

/// Parse `<generation>.wal`
pub fn get_mem_index_from_wal(name: &str) -> Result<u64> {
    name.strip_suffix(WAL_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .ok_or_else(|| StorageError::corrupted_file(name, "missing .wal extension"))?
        .parse::<u64>()
        .map_err(|_| StorageError::corrupted_file(name, "generation is not a number"))
}

/// Every `*.sst` file in `dir`, sorted by (level, seq)
pub fn get_stored_sst_entries(dir: &Path) -> Result<Vec<SstEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SST_EXTENSION) {
            continue;
        }

        let name = entry.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| StorageError::corrupted_file(&path, "file name is not UTF-8"))?;
        let (level, seq) =
            get_level_and_seq_from_sst(name).map_err(|e| StorageError::corrupted_file(&path, e.to_string()))?;
        entries.push(SstEntry { level, seq, path });
    }

    entries.sort_by_key(|e| (e.level, e.seq));
    Ok(entries)
}

/// Every `*.wal` segment in `wal_dir`, sorted by generation
pub fn get_stored_wal_entries(wal_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(wal_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(WAL_EXTENSION)
        {
            continue;
        }

        let name = entry.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| StorageError::corrupted_file(&path, "file name is not UTF-8"))?;
        let index =
            get_mem_index_from_wal(name).map_err(|e| StorageError::corrupted_file(&path, e.to_string()))?;
        entries.push((index, path));
    }

    entries.sort_by_key(|(index, _)| *index);
    Ok(entries)
}

/// Remove `*.tmp` files left by interrupted table writes
pub fn remove_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_tmp = entry
            .file_name()
            .to_str()
            .map(|n| n.ends_with(TMP_SUFFIX))
            .unwrap_or(false);
        if is_tmp && entry.file_type()?.is_file() {
            warn!(path = %entry.path().display(), "removing orphaned temporary file");
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Name recorded in an output group for the WAL segment a flush replaces
pub(crate) fn wal_replace_name(generation: u64) -> String {
    format!("{}/{}", WAL_DIR_NAME, wal_file_name(generation))
}

/// A file named in an output group's `replaces` list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replaced {
    Wal(u64),
    Sst(usize, u64),
}

fn parse_replaced(name: &str) -> Result<Replaced> {
    match name.strip_prefix(WAL_DIR_NAME).and_then(|s| s.strip_prefix('/')) {
        Some(wal) => get_mem_index_from_wal(wal).map(Replaced::Wal),
        None => get_level_and_seq_from_sst(name).map(|(level, seq)| Replaced::Sst(level, seq)),
    }
}

pub(crate) struct RecoveredTree {
    pub levels: LevelSet,

    /// First unused node sequence
    pub next_seq: u64,

    /// Highest WAL generation referenced by a table
    pub wal_watermark: Option<u64>,
}

pub(crate) fn construct_tree(
    config: &TreeConfig,
    cache: Option<Arc<BlockCache>>,
) -> Result<RecoveredTree> {
    fs::create_dir_all(&config.dir)?;
    fs::create_dir_all(config.wal_dir())?;

    remove_temp_files(&config.dir)?;

    let entries = get_stored_sst_entries(&config.dir)?;
    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.level >= config.max_level {
            return Err(StorageError::corrupted_file(
                &entry.path,
                format!("level {} exceeds max_level {}", entry.level, config.max_level),
            ));
        }
        let node = Node::open(&entry.path, entry.level, entry.seq, cache.clone())?;
        nodes.push(Arc::new(node));
    }

    // Sequences and generations already used, including by deleted files
    let mut max_seq = nodes.iter().map(|n| n.seq()).max();
    let mut wal_watermark: Option<u64> = None;
    for node in &nodes {
        for name in &node.group().replaces {
            match parse_replaced(name)? {
                Replaced::Wal(generation) => {
                    wal_watermark = Some(wal_watermark.map_or(generation, |w| w.max(generation)))
                }
                Replaced::Sst(_, seq) => max_seq = Some(max_seq.map_or(seq, |m| m.max(seq))),
            }
        }
    }

    let nodes = reconcile(config, nodes)?;

    let mut by_level: Vec<Vec<Arc<Node>>> = vec![Vec::new(); config.max_level];
    for node in nodes {
        by_level[node.level()].push(node);
    }
    let levels = LevelSet::from_nodes(by_level)?;

    let next_seq = max_seq.map_or(0, |m| m + 1);
    info!(
        dir = %config.dir.display(),
        nodes = levels.all_nodes().len(),
        next_seq,
        "sstables loaded"
    );

    Ok(RecoveredTree {
        levels,
        next_seq,
        wal_watermark,
    })
}

/// Finish or roll back interrupted publications; returns the surviving nodes
fn reconcile(config: &TreeConfig, nodes: Vec<Arc<Node>>) -> Result<Vec<Arc<Node>>> {
    let mut groups: AHashMap<u64, Vec<&Arc<Node>>> = AHashMap::new();
    for node in &nodes {
        groups.entry(node.group().id).or_default().push(node);
    }

    let mut doomed: AHashSet<u64> = AHashSet::new();
    let mut stale_wals = Vec::new();

    let newest = groups.keys().copied().max();
    for (id, members) in &groups {
        if Some(*id) == newest && !is_complete(members) {
            warn!(group = id, tables = members.len(), "rolling back incomplete output group");
            doomed.extend(members.iter().map(|n| n.seq()));
            continue;
        }

        for name in &members[0].group().replaces {
            match parse_replaced(name)? {
                Replaced::Wal(generation) => {
                    let path = config.wal_dir().join(wal_file_name(generation));
                    if path.exists() {
                        stale_wals.push(path);
                    }
                }
                Replaced::Sst(level, seq) => {
                    if nodes.iter().any(|n| n.level() == level && n.seq() == seq) {
                        doomed.insert(seq);
                    }
                }
            }
        }
    }

    let mut survivors = Vec::with_capacity(nodes.len());
    for node in nodes {
        if doomed.contains(&node.seq()) {
            warn!(file = %node.file_name(), "removing superseded sstable");
            // File goes away with the last reference
            node.mark_obsolete();
        } else {
            survivors.push(node);
        }
    }

    for path in &stale_wals {
        warn!(path = %path.display(), "removing WAL segment already flushed");
        fs::remove_file(path)?;
    }

    if !doomed.is_empty() {
        crate::storage::sync_dir(&config.dir)?;
    }
    if !stale_wals.is_empty() {
        crate::storage::sync_dir(&config.wal_dir())?;
    }
    Ok(survivors)
}

/// Indices 0..=last all present, and the last one says so
fn is_complete(members: &[&Arc<Node>]) -> bool {
    let mut indices: Vec<u32> = members.iter().map(|n| n.group().index).collect();
    indices.sort_unstable();
    indices.dedup();

    let last = members.iter().find(|n| n.group().last).map(|n| n.group().index);
    match last {
        Some(last) => indices.len() == last as usize + 1 && indices.iter().enumerate().all(|(i, x)| i as u32 == *x),
        None => false,
    }
}

pub(crate) struct RecoveredMemTables {
    pub active: Arc<dyn MemTable>,
    pub writer: WalWriter,
    pub generation: u64,

    /// First generation not yet used on disk or by any table
    pub next_generation: u64,

    /// Oldest first
    pub read_only: Vec<Arc<ReadOnlyMemTable>>,
}

pub(crate) fn construct_memtables(
    config: &TreeConfig,
    wal_watermark: Option<u64>,
) -> Result<RecoveredMemTables> {
    let wal_dir = config.wal_dir();
    let mut segments = get_stored_wal_entries(&wal_dir)?;

    let used = segments
        .last()
        .map(|(generation, _)| *generation)
        .into_iter()
        .chain(wal_watermark)
        .max();
    let mut next_generation = used.map_or(0, |g| g + 1);

    let active_segment = segments.pop();

    let mut read_only = Vec::with_capacity(segments.len());
    for (generation, path) in segments {
        let memtable = (config.memtable_factory)();
        let summary = WalReader::open(&path)?.restore_memtable(memtable.as_ref())?;

        // Sealed segments were synced before the switch, so a bad record
        // here is corruption rather than a torn tail. Its WAL is the only
        // copy of everything after it.
        if summary.is_torn() {
            return Err(StorageError::corrupted_file(
                &path,
                format!(
                    "sealed WAL segment replays only {} of {} bytes",
                    summary.valid_len, summary.file_len
                ),
            ));
        }

        if memtable.is_empty() {
            debug!(generation, "removing empty WAL segment");
            fs::remove_file(&path)?;
            continue;
        }

        debug!(generation, records = summary.records, "replayed WAL segment");
        read_only.push(Arc::new(ReadOnlyMemTable {
            memtable,
            wal_path: path,
            generation,
        }));
    }

    let (active, writer, generation) = match active_segment {
        Some((generation, path)) => {
            let memtable = (config.memtable_factory)();
            let summary = WalReader::open(&path)?.restore_memtable(memtable.as_ref())?;
            if summary.is_torn() {
                warn!(
                    generation,
                    dropped_bytes = summary.file_len - summary.valid_len,
                    "truncating torn WAL tail"
                );
            }
            let writer = WalWriter::open_at(&path, summary.valid_len, config.durability)?;
            debug!(generation, records = summary.records, "replayed active WAL segment");
            (memtable, writer, generation)
        }
        None => {
            let generation = next_generation;
            next_generation += 1;
            let writer =
                WalWriter::create(wal_dir.join(wal_file_name(generation)), config.durability)?;
            ((config.memtable_factory)(), writer, generation)
        }
    };

    info!(
        generation,
        active_entries = active.len(),
        pending_flushes = read_only.len(),
        "memtables restored"
    );

    Ok(RecoveredMemTables {
        active,
        writer,
        generation,
        next_generation,
        read_only,
    })
}
