//! Background flush and leveled compaction
//!
//! ## Worker
//! One thread selects over the flush channel, the compact channel and the
//! shutdown channel. Every change to the set of files on disk happens on it,
//! one request at a time. A failed request is logged and retried after
//! `retry_interval`.
//!
//! ## Trigger
//! - L0: node count >= `l0_compaction_trigger`
//! - L1..L(max-2): total size > `sst_size * level_multiplier^level`
//! - Deepest level: never (with a single level, L0 is merged into itself
//!   while its nodes overlap)
//!
//! ## Merge
//! L0 contributes all of its nodes, deeper levels their oldest node. The
//! overlapping nodes of the target level join the merge. On duplicate keys
//! the shallower level wins, and within L0 the newer node.

use super::level::check_disjoint;
use super::memtable::ReadOnlyMemTable;
use super::merging_iterator::{KvIterator, MergingIterator};
use super::node::Node;
use super::recovery::wal_replace_name;
use super::sstable::{publish_group, PendingTable, TableWriter};
use super::tree::TreeInner;
use crate::{Result, StorageError};
use crossbeam::channel::{self, select, Receiver};
use serde::Serialize;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Cumulative background work counters
#[derive(Debug, Default)]
pub struct CompactionStats {
    flushes: AtomicU64,
    compactions: AtomicU64,
    bytes_flushed: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`CompactionStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CompactionStatsSnapshot {
    pub flushes: u64,
    pub compactions: u64,
    pub bytes_flushed: u64,

    /// Input bytes of level compactions
    pub bytes_read: u64,

    /// Output bytes of level compactions
    pub bytes_written: u64,

    pub failures: u64,
}

impl CompactionStats {
    pub fn snapshot(&self) -> CompactionStatsSnapshot {
        CompactionStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

enum Request {
    Flush(Arc<ReadOnlyMemTable>),
    Compact(usize),
}

pub(crate) struct CompactionWorker {
    inner: Arc<TreeInner>,
    flush_rx: Receiver<Arc<ReadOnlyMemTable>>,
    compact_rx: Receiver<usize>,
    shutdown_rx: Receiver<()>,

    /// Failed requests waiting for `retry_at`
    deferred: Vec<Request>,
    retry_at: Option<Instant>,
}

impl CompactionWorker {
    pub fn spawn(
        inner: Arc<TreeInner>,
        flush_rx: Receiver<Arc<ReadOnlyMemTable>>,
        compact_rx: Receiver<usize>,
        shutdown_rx: Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let worker = Self {
            inner,
            flush_rx,
            compact_rx,
            shutdown_rx,
            deferred: Vec::new(),
            retry_at: None,
        };

        let handle = thread::Builder::new()
            .name("lsmkv-compaction".into())
            .spawn(move || worker.run())?;
        Ok(handle)
    }

    fn run(mut self) {
        debug!("compaction worker started");

        loop {
            if self.inner.is_closed() {
                break;
            }

            let retry = match self.retry_at {
                Some(at) => channel::at(at),
                None => channel::never(),
            };

            // `None` means the retry timer fired
            let request = select! {
                recv(self.shutdown_rx) -> _ => break,
                recv(self.flush_rx) -> msg => match msg {
                    Ok(rom) => Some(Request::Flush(rom)),
                    Err(_) => break,
                },
                recv(self.compact_rx) -> msg => match msg {
                    Ok(level) => Some(Request::Compact(level)),
                    Err(_) => break,
                },
                recv(retry) -> _ => None,
            };

            match request {
                Some(request) => self.handle(request),
                None => {
                    self.retry_at = None;
                    for request in std::mem::take(&mut self.deferred) {
                        self.handle(request);
                    }
                }
            }
        }

        debug!(deferred = self.deferred.len(), "compaction worker stopped");
    }

    fn handle(&mut self, request: Request) {
        let result = match &request {
            Request::Flush(rom) => flush_through(&self.inner, rom),
            Request::Compact(level) => compact_level(&self.inner, *level),
        };

        match result {
            Ok(()) => self.inner.finish_request(),
            Err(e) => {
                self.inner.stats.failures.fetch_add(1, Ordering::Relaxed);
                match &request {
                    Request::Flush(rom) => {
                        error!(generation = rom.generation, error = %e, "flush failed, will retry")
                    }
                    Request::Compact(level) => {
                        error!(level, error = %e, "compaction failed, will retry")
                    }
                }
                // Stays counted as pending until it succeeds
                self.deferred.push(request);
                self.retry_at
                    .get_or_insert_with(|| Instant::now() + self.inner.config.retry_interval);
            }
        }
    }
}

/// Flush queued memtables oldest first, up to and including `rom`.
///
/// L0 order must follow memtable age, so a memtable is never flushed ahead
/// of an older one still queued.
fn flush_through(inner: &TreeInner, rom: &ReadOnlyMemTable) -> Result<()> {
    loop {
        let front = inner.read_only.read().first().cloned();
        match front {
            Some(front) if front.generation <= rom.generation => compact_memtable(inner, &front)?,
            _ => return Ok(()),
        }
    }
}

/// Turn one read-only memtable into level-0 nodes and retire its WAL segment
pub(crate) fn compact_memtable(inner: &TreeInner, rom: &ReadOnlyMemTable) -> Result<()> {
    let entries = rom.memtable.all();

    let mut writer = TableWriter::new(
        &inner.config,
        0,
        &inner.next_seq,
        vec![wal_replace_name(rom.generation)],
    );
    for (key, value) in &entries {
        if let Err(e) = writer.add(key, value) {
            writer.abandon();
            return Err(e);
        }
    }
    let tables = writer.finish()?;

    let nodes = publish_and_open(inner, &tables)?;
    let bytes: u64 = tables.iter().map(|t| t.file_size).sum();
    let count = nodes.len();

    // Visible in L0 before it leaves the queue
    inner.levels.append_l0(nodes);
    inner
        .read_only
        .write()
        .retain(|r| r.generation != rom.generation);
    rom.memtable.close();

    match fs::remove_file(&rom.wal_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %rom.wal_path.display(), error = %e, "failed to remove flushed WAL segment")
        }
    }
    if let Err(e) = crate::storage::sync_dir(&inner.config.wal_dir()) {
        warn!(error = %e, "failed to sync WAL directory");
    }

    inner.stats.flushes.fetch_add(1, Ordering::Relaxed);
    inner.stats.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
    debug!(
        generation = rom.generation,
        entries = entries.len(),
        tables = count,
        bytes,
        "memtable flushed"
    );

    if needs_compaction(inner, 0) {
        inner.enqueue_compaction(0);
    }
    Ok(())
}

/// Whether `level` is over its threshold
pub(crate) fn needs_compaction(inner: &TreeInner, level: usize) -> bool {
    let max_level = inner.levels.max_level();
    if level >= max_level {
        return false;
    }

    if level == 0 {
        let nodes = inner.levels.snapshot(0);
        if nodes.len() < inner.config.l0_compaction_trigger {
            return false;
        }
        if max_level > 1 {
            return true;
        }
        // Single level: merging only helps while ranges overlap
        let mut sorted: Vec<Arc<Node>> = nodes.iter().cloned().collect();
        sorted.sort_by(|a, b| a.start_key().cmp(b.start_key()));
        return check_disjoint(0, &sorted).is_err();
    }

    if level == max_level - 1 {
        return false;
    }
    inner.levels.total_size(level) > inner.config.level_max_bytes(level)
}

/// Merge `level` into the next level (or into itself when it is the only one)
pub(crate) fn compact_level(inner: &TreeInner, level: usize) -> Result<()> {
    if !needs_compaction(inner, level) {
        return Ok(());
    }

    let max_level = inner.levels.max_level();
    let target = if max_level == 1 { 0 } else { level + 1 };

    // Inputs, newest first
    let mut inputs: Vec<Arc<Node>> = if level == 0 {
        let mut nodes: Vec<Arc<Node>> = inner.levels.snapshot(0).iter().cloned().collect();
        nodes.sort_by(|a, b| b.seq().cmp(&a.seq()));
        nodes
    } else {
        match inner.levels.snapshot(level).iter().min_by_key(|n| n.seq()) {
            Some(node) => vec![Arc::clone(node)],
            None => return Ok(()),
        }
    };
    if inputs.is_empty() {
        return Ok(());
    }

    let start = inputs
        .iter()
        .map(|n| n.start_key().to_vec())
        .min()
        .unwrap_or_default();
    let end = inputs
        .iter()
        .map(|n| n.end_key().to_vec())
        .max()
        .unwrap_or_default();

    if target != level {
        inputs.extend(inner.levels.overlapping(target, &start, &end));
    }

    let replaces: Vec<String> = inputs.iter().map(|n| n.file_name()).collect();
    let consumed: Vec<u64> = inputs.iter().map(|n| n.seq()).collect();
    let bytes_read: u64 = inputs.iter().map(|n| n.size()).sum();

    let sources: Vec<KvIterator> = inputs
        .iter()
        .map(|n| Box::new(n.iter()) as KvIterator)
        .collect();

    let mut writer = TableWriter::new(&inner.config, target, &inner.next_seq, replaces);
    for item in MergingIterator::new(sources) {
        let added = item.and_then(|(key, value)| writer.add(&key, &value));
        if let Err(e) = added {
            writer.abandon();
            return Err(e);
        }
    }
    let tables = writer.finish()?;
    if tables.is_empty() {
        return Err(StorageError::Corruption(format!(
            "compaction of level {} produced no output",
            level
        )));
    }

    let outputs = publish_and_open(inner, &tables)?;
    let bytes_written: u64 = outputs.iter().map(|n| n.size()).sum();
    let output_count = outputs.len();

    let removed = match inner.levels.replace(level, target, &consumed, outputs.clone()) {
        Ok(removed) => removed,
        Err(e) => {
            outputs.iter().for_each(|n| n.mark_obsolete());
            return Err(e);
        }
    };
    for node in &removed {
        node.mark_obsolete();
    }

    inner.stats.compactions.fetch_add(1, Ordering::Relaxed);
    inner.stats.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
    inner.stats.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
    info!(
        level,
        target,
        inputs = consumed.len(),
        outputs = output_count,
        bytes_read,
        bytes_written,
        "compaction finished"
    );

    if needs_compaction(inner, level) {
        inner.enqueue_compaction(level);
    }
    if target != level && needs_compaction(inner, target) {
        inner.enqueue_compaction(target);
    }
    Ok(())
}

/// Publish a finished group and open its tables; on failure nothing of the
/// group is left behind
fn publish_and_open(inner: &TreeInner, tables: &[PendingTable]) -> Result<Vec<Arc<Node>>> {
    publish_group(&inner.config.dir, tables)?;

    let mut nodes = Vec::with_capacity(tables.len());
    for table in tables {
        match Node::open(&table.path, table.level, table.seq, inner.cache.clone()) {
            Ok(node) => nodes.push(Arc::new(node)),
            Err(e) => {
                drop(nodes);
                tables.iter().for_each(PendingTable::discard);
                return Err(e);
            }
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TreeConfig;
    use crate::storage::lsm::tree::Tree;
    use std::time::Duration;
    use tempfile::TempDir;

    fn value(i: u32) -> Vec<u8> {
        format!("value_{:08}_{}", i, "x".repeat(40)).into_bytes()
    }

    #[test]
    fn test_flush_moves_memtable_to_level_zero() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_l0_compaction_trigger(100);
        let tree = Tree::open(config).unwrap();

        for i in 0..200u32 {
            tree.put(format!("key_{:05}", i).as_bytes(), &value(i)).unwrap();
        }
        assert!(tree.wait_idle(Duration::from_secs(10)));

        let stats = tree.stats();
        assert!(stats.compaction.flushes > 0);
        assert!(stats.levels[0].nodes > 0);
        assert_eq!(stats.read_only_memtables, 0);

        // Flushed WAL segments are gone; only the active one remains
        let wal_count = fs::read_dir(dir.path().join("walfile")).unwrap().count();
        assert_eq!(wal_count, 1);
    }

    #[test]
    fn test_failed_flush_is_retried() {
        let dir = TempDir::new().unwrap();
        // The first flush output cannot be created over a directory
        fs::create_dir(dir.path().join("0_0.sst.tmp")).unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_l0_compaction_trigger(100);
        let tree = Tree::open(config).unwrap();

        for i in 0..300u32 {
            tree.put(format!("key_{:05}", i).as_bytes(), &value(i)).unwrap();
        }
        assert!(tree.wait_idle(Duration::from_secs(10)));

        let stats = tree.stats();
        assert!(stats.compaction.failures >= 1);
        assert!(stats.compaction.flushes >= 1);
        assert_eq!(stats.read_only_memtables, 0);
        assert!(!dir.path().join("0_0.sst").exists());

        for i in 0..300u32 {
            assert_eq!(
                tree.get(format!("key_{:05}", i).as_bytes()).unwrap(),
                Some(value(i)),
                "key {}",
                i
            );
        }
    }

    #[test]
    fn test_level_zero_compaction_produces_disjoint_level_one() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path());
        let tree = Tree::open(config).unwrap();

        for round in 0..4u32 {
            for i in 0..100u32 {
                tree.put(format!("key_{:05}", i * 3 + round).as_bytes(), &value(round))
                    .unwrap();
            }
        }
        assert!(tree.wait_idle(Duration::from_secs(10)));

        let stats = tree.stats();
        assert!(stats.compaction.compactions > 0);
        assert!(stats.levels[1..].iter().any(|l| l.nodes > 0));

        let inner = tree.inner();
        for level in 1..inner.levels.max_level() {
            check_disjoint(level, &inner.levels.snapshot(level)).unwrap();
        }
    }

    #[test]
    fn test_merge_prefers_newer_level_zero_node() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path());
        let tree = Tree::open(config).unwrap();

        // Same keys rewritten across several flushes
        for round in 0..6u32 {
            for i in 0..80u32 {
                tree.put(format!("key_{:05}", i).as_bytes(), &value(round)).unwrap();
            }
        }
        assert!(tree.wait_idle(Duration::from_secs(10)));

        for i in 0..80u32 {
            assert_eq!(
                tree.get(format!("key_{:05}", i).as_bytes()).unwrap(),
                Some(value(5))
            );
        }
    }

    #[test]
    fn test_single_level_tree_compacts_into_itself() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_max_level(1);
        let tree = Tree::open(config).unwrap();

        for round in 0..4u32 {
            for i in 0..100u32 {
                tree.put(format!("key_{:05}", i).as_bytes(), &value(round)).unwrap();
            }
        }
        assert!(tree.wait_idle(Duration::from_secs(10)));

        assert!(!needs_compaction(tree.inner(), 0));
        for i in 0..100u32 {
            assert_eq!(
                tree.get(format!("key_{:05}", i).as_bytes()).unwrap(),
                Some(value(3))
            );
        }
    }

    #[test]
    fn test_deepest_level_never_triggers() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_max_level(2);
        let tree = Tree::open(config).unwrap();

        for i in 0..2000u32 {
            tree.put(format!("key_{:05}", i).as_bytes(), &value(i)).unwrap();
        }
        assert!(tree.wait_idle(Duration::from_secs(20)));
        assert!(!needs_compaction(tree.inner(), 1));
        assert!(tree.stats().levels[1].nodes > 0);
    }
}
