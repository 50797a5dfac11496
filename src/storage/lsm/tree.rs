//! LSM-tree coordinator
//!
//! ## Write path
//! WAL append, memtable insert, then a size check under one mutex. A full
//! memtable is frozen, queued as read-only and handed to the background
//! worker without blocking the writer.
//!
//! ## Read path
//! Active memtable, read-only memtables (newest first), every L0 node
//! (newest first), then one node per deeper level found by binary search.
//! Data only ever moves towards places a lookup checks later, and each
//! move publishes the new copy before retiring the old one.
//!
//! ## Locks
//! - `state` (writer + active memtable), then `read_only`
//! - level locks in ascending order, each held only to clone a snapshot

use super::cache::BlockCache;
use super::compaction::{needs_compaction, CompactionStats, CompactionStatsSnapshot, CompactionWorker};
use super::level::{find_node, LevelSet, LevelStats};
use super::memtable::{MemTable, ReadOnlyMemTable};
use super::recovery::{construct_memtables, construct_tree};
use crate::config::TreeConfig;
use crate::storage::wal::{wal_file_name, WalWriter};
use crate::{Result, StorageError};
use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Active memtable generation
pub(crate) struct ActiveState {
    pub writer: WalWriter,
    pub memtable: Arc<dyn MemTable>,
    pub generation: u64,
    pub next_generation: u64,
}

/// State shared between the tree handle and the background worker
pub(crate) struct TreeInner {
    pub config: TreeConfig,
    pub state: Mutex<ActiveState>,

    /// Oldest first
    pub read_only: RwLock<Vec<Arc<ReadOnlyMemTable>>>,

    pub levels: LevelSet,
    pub next_seq: AtomicU64,
    pub cache: Option<Arc<BlockCache>>,
    pub stats: CompactionStats,

    /// Requests sent to the worker and not yet completed
    pending: AtomicUsize,
    closed: AtomicBool,

    flush_tx: Sender<Arc<ReadOnlyMemTable>>,
    compact_tx: Sender<usize>,
}

impl TreeInner {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn enqueue_flush(&self, rom: Arc<ReadOnlyMemTable>) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.flush_tx.send(rom).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn enqueue_compaction(&self, level: usize) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.compact_tx.send(level).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn finish_request(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Freeze the active memtable and start a new generation
    fn switch_memtable(&self, state: &mut ActiveState) -> Result<()> {
        // Nothing changes unless both steps succeed
        state.writer.sync()?;
        let next_generation = state.next_generation;
        let next_writer = WalWriter::create(
            self.config.wal_dir().join(wal_file_name(next_generation)),
            self.config.durability,
        )?;

        let mut old_writer = std::mem::replace(&mut state.writer, next_writer);
        let wal_path = old_writer.path().to_path_buf();
        if let Err(e) = old_writer.close() {
            error!(path = %wal_path.display(), error = %e, "failed to close WAL segment");
        }

        let memtable = std::mem::replace(&mut state.memtable, (self.config.memtable_factory)());
        let rom = Arc::new(ReadOnlyMemTable {
            memtable,
            wal_path,
            generation: state.generation,
        });
        state.generation = next_generation;
        state.next_generation = next_generation + 1;

        self.read_only.write().push(Arc::clone(&rom));
        debug!(
            frozen = rom.generation,
            bytes = rom.memtable.size(),
            entries = rom.memtable.len(),
            "memtable switched"
        );
        self.enqueue_flush(rom);
        Ok(())
    }
}

/// Snapshot of the tree's shape and background work
#[derive(Clone, Debug, Serialize)]
pub struct TreeStats {
    pub generation: u64,
    pub active_memtable_bytes: u64,
    pub active_memtable_entries: usize,
    pub read_only_memtables: usize,
    pub levels: Vec<LevelStats>,
    pub next_seq: u64,
    pub pending_work: usize,
    pub compaction: CompactionStatsSnapshot,
    pub block_cache_hits: u64,
    pub block_cache_misses: u64,
}

/// An LSM-tree key-value store rooted at one directory
///
/// Keys and values are arbitrary non-empty byte strings compared
/// lexicographically. One process may open a directory at a time.
///
/// # Example
/// ```no_run
/// use lsmkv::{Tree, TreeConfig};
///
/// let tree = Tree::open(TreeConfig::new("./data"))?;
/// tree.put(b"hello", b"world")?;
/// assert_eq!(tree.get(b"hello")?, Some(b"world".to_vec()));
/// tree.close()?;
/// # Ok::<(), lsmkv::StorageError>(())
/// ```
pub struct Tree {
    inner: Arc<TreeInner>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Tree {
    /// Open (or create) the tree under `config.dir`, recovering any
    /// existing SSTables and WAL segments
    pub fn open(config: TreeConfig) -> Result<Self> {
        config.validate()?;

        let cache = BlockCache::new(config.block_cache_capacity).map(Arc::new);
        let recovered = construct_tree(&config, cache.clone())?;
        let memtables = construct_memtables(&config, recovered.wal_watermark)?;

        let (flush_tx, flush_rx) = channel::unbounded();
        let (compact_tx, compact_rx) = channel::unbounded();
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);

        let inner = Arc::new(TreeInner {
            state: Mutex::new(ActiveState {
                writer: memtables.writer,
                memtable: memtables.active,
                generation: memtables.generation,
                next_generation: memtables.next_generation,
            }),
            read_only: RwLock::new(memtables.read_only.clone()),
            levels: recovered.levels,
            next_seq: AtomicU64::new(recovered.next_seq),
            cache,
            stats: CompactionStats::default(),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            flush_tx,
            compact_tx,
            config,
        });

        let worker = CompactionWorker::spawn(Arc::clone(&inner), flush_rx, compact_rx, shutdown_rx)?;

        for rom in memtables.read_only {
            inner.enqueue_flush(rom);
        }
        for level in 0..inner.levels.max_level() {
            if needs_compaction(&inner, level) {
                inner.enqueue_compaction(level);
            }
        }

        info!(
            dir = %inner.config.dir.display(),
            max_level = inner.config.max_level,
            sst_size = inner.config.sst_size,
            "tree opened"
        );

        Ok(Self {
            inner,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Insert or overwrite `key`. Durable per the configured durability
    /// level once this returns `Ok`.
    ///
    /// A failed put leaves no trace: if the memtable rejects the record after
    /// it was logged, the record is cut from the WAL again.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("key must not be empty".into()));
        }

        let mut state = self.inner.state.lock();
        if self.inner.is_closed() {
            return Err(StorageError::Closed);
        }

        let logged_len = state.writer.len();
        state.writer.write(key, value)?;
        if let Err(e) = state.memtable.put(key, value) {
            if let Err(cut) = state.writer.truncate(logged_len) {
                error!(error = %cut, "failed to roll back rejected WAL record");
            }
            return Err(e);
        }

        if state.memtable.size() * 5 / 4 <= self.inner.config.sst_size {
            return Ok(());
        }
        self.inner.switch_memtable(&mut state)
    }

    /// Latest value of `key`, or `None` if it was never written
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("key must not be empty".into()));
        }
        if self.inner.is_closed() {
            return Err(StorageError::Closed);
        }

        if let Some(value) = self.inner.state.lock().memtable.get(key) {
            return Ok(Some(value));
        }

        let read_only = self.inner.read_only.read().clone();
        for rom in read_only.iter().rev() {
            if let Some(value) = rom.memtable.get(key) {
                return Ok(Some(value));
            }
        }

        // L0: every node, newest first
        let l0 = self.inner.levels.snapshot(0);
        for node in l0.iter().rev() {
            if let Some(value) = node.get(key)? {
                return Ok(Some(value));
            }
        }

        for level in 1..self.inner.levels.max_level() {
            let nodes = self.inner.levels.snapshot(level);
            if let Some(node) = find_node(&nodes, key) {
                if let Some(value) = node.get(key)? {
                    return Ok(Some(value));
                }
            }
        }

        Ok(None)
    }

    /// Block until no flush or compaction is queued or running, or until
    /// `timeout` passes. Returns `true` when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn stats(&self) -> TreeStats {
        let (generation, active_memtable_bytes, active_memtable_entries) = {
            let state = self.inner.state.lock();
            (state.generation, state.memtable.size(), state.memtable.len())
        };
        let (block_cache_hits, block_cache_misses) =
            self.inner.cache.as_ref().map(|c| c.stats()).unwrap_or((0, 0));

        TreeStats {
            generation,
            active_memtable_bytes,
            active_memtable_entries,
            read_only_memtables: self.inner.read_only.read().len(),
            levels: self.inner.levels.stats(),
            next_seq: self.inner.next_seq.load(Ordering::SeqCst),
            pending_work: self.inner.pending.load(Ordering::SeqCst),
            compaction: self.inner.stats.snapshot(),
            block_cache_hits,
            block_cache_misses,
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.inner.config
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &TreeInner {
        &self.inner
    }

    /// Stop the worker (letting in-flight work finish), sync the WAL and
    /// release every file. Queued memtables are not flushed; their WAL
    /// segments are replayed on the next open. Idempotent.
    pub fn close(&self) -> Result<()> {
        {
            // Serialize with in-flight puts
            let _state = self.inner.state.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("compaction worker panicked");
            }
        }

        let mut state = self.inner.state.lock();
        let synced = state.writer.close();
        state.memtable.close();
        drop(state);

        for rom in self.inner.read_only.read().iter() {
            rom.memtable.close();
        }
        for node in self.inner.levels.all_nodes() {
            node.close();
        }

        info!(dir = %self.inner.config.dir.display(), "tree closed");
        synced
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "failed to close tree");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use crate::storage::lsm::level::check_disjoint;
    use crate::storage::lsm::memtable::{BTreeMemTable, MemTableFactory, MemTableKind};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn key(i: u32) -> Vec<u8> {
        format!("key_{:06}", i).into_bytes()
    }

    fn value(i: u32, round: u32) -> Vec<u8> {
        format!("value_{}_{}_{}", i, round, "v".repeat(32)).into_bytes()
    }

    /// Refuses one key, stores everything else
    struct RejectingMemTable {
        inner: BTreeMemTable,
        rejected: &'static [u8],
    }

    impl MemTable for RejectingMemTable {
        fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            if key == self.rejected {
                return Err(StorageError::InvalidArgument("rejected key".into()));
            }
            self.inner.put(key, value)
        }

        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.inner.get(key)
        }

        fn all(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
            self.inner.all()
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn close(&self) {
            self.inner.close()
        }
    }

    fn rejecting_factory(rejected: &'static [u8]) -> MemTableFactory {
        Arc::new(move || {
            Arc::new(RejectingMemTable {
                inner: BTreeMemTable::new(),
                rejected,
            }) as Arc<dyn MemTable>
        })
    }

    fn assert_levels_disjoint(tree: &Tree) {
        let levels = &tree.inner().levels;
        for level in 1..levels.max_level() {
            check_disjoint(level, &levels.snapshot(level)).unwrap();
        }
    }

    #[test]
    fn test_put_get_basic() {
        let dir = TempDir::new().unwrap();
        let tree = Tree::open(TreeConfig::for_testing(dir.path())).unwrap();

        tree.put(b"hello", b"world").unwrap();
        assert_eq!(tree.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(tree.get(b"missing").unwrap(), None);

        tree.put(b"hello", b"again").unwrap();
        assert_eq!(tree.get(b"hello").unwrap(), Some(b"again".to_vec()));
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let tree = Tree::open(TreeConfig::for_testing(dir.path())).unwrap();
        assert!(matches!(tree.put(b"", b"v"), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(tree.get(b""), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_closed_tree_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let tree = Tree::open(TreeConfig::for_testing(dir.path())).unwrap();
        tree.put(b"k", b"v").unwrap();
        tree.close().unwrap();

        assert!(matches!(tree.put(b"k", b"v"), Err(StorageError::Closed)));
        assert!(matches!(tree.get(b"k"), Err(StorageError::Closed)));
        assert!(tree.close().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_max_level(0);
        assert!(matches!(Tree::open(config), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_rejected_put_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_sst_size(1024 * 1024);
        {
            let tree =
                Tree::open(config.clone().with_memtable_factory(rejecting_factory(b"poison")))
                    .unwrap();
            tree.put(b"a", b"1").unwrap();
            assert!(matches!(
                tree.put(b"poison", b"x"),
                Err(StorageError::InvalidArgument(_))
            ));
            tree.put(b"b", b"2").unwrap();
            assert_eq!(tree.get(b"poison").unwrap(), None);
            tree.close().unwrap();
        }

        // A plain memtable would accept the record if it were replayed
        let tree = Tree::open(config).unwrap();
        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get(b"poison").unwrap(), None);
    }

    #[test]
    fn test_failed_wal_append_leaves_memtable_untouched() {
        let dir = TempDir::new().unwrap();
        let tree = Tree::open(TreeConfig::for_testing(dir.path())).unwrap();
        tree.put(b"before", b"1").unwrap();

        tree.inner().state.lock().writer.close().unwrap();
        assert!(tree.put(b"after", b"2").is_err());

        assert_eq!(tree.get(b"before").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"after").unwrap(), None);
        assert_eq!(tree.stats().active_memtable_entries, 1);
    }

    #[test]
    fn test_reopen_after_clean_close() {
        let dir = TempDir::new().unwrap();
        {
            let tree = Tree::open(TreeConfig::for_testing(dir.path())).unwrap();
            for i in 0..500 {
                tree.put(&key(i), &value(i, 0)).unwrap();
            }
            for i in 0..500 {
                if i % 3 == 0 {
                    tree.put(&key(i), &value(i, 1)).unwrap();
                }
            }
            tree.close().unwrap();
        }

        let tree = Tree::open(TreeConfig::for_testing(dir.path())).unwrap();
        for i in 0..500 {
            let round = if i % 3 == 0 { 1 } else { 0 };
            assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i, round)), "key {}", i);
        }
    }

    #[test]
    fn test_reopen_without_close() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_durability(DurabilityLevel::Synchronous);
        {
            let tree = Tree::open(config.clone()).unwrap();
            for i in 0..300 {
                tree.put(&key(i), &value(i, 0)).unwrap();
            }
            // Skip close and Drop, as if the process died. The worker must be
            // idle so it does not race the reopened tree.
            assert!(tree.wait_idle(Duration::from_secs(10)));
            std::mem::forget(tree);
        }

        let tree = Tree::open(config).unwrap();
        for i in 0..300 {
            assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i, 0)), "key {}", i);
        }
    }

    #[test]
    fn test_recovers_torn_wal_tail() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_sst_size(1024 * 1024);
        {
            let tree = Tree::open(config.clone()).unwrap();
            tree.put(b"a", b"1").unwrap();
            tree.put(b"b", b"2").unwrap();
            tree.close().unwrap();
        }

        // Half-written trailing record
        let wal = config.wal_dir().join(wal_file_name(0));
        let mut data = fs::read(&wal).unwrap();
        data.extend_from_slice(&[40, 0, 0, 0, 1, 2]);
        fs::write(&wal, &data).unwrap();

        {
            let tree = Tree::open(config.clone()).unwrap();
            assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
            assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
            tree.put(b"c", b"3").unwrap();
            tree.close().unwrap();
        }

        let tree = Tree::open(config).unwrap();
        assert_eq!(tree.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_flush_visibility() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_l0_compaction_trigger(1000);
        let tree = Tree::open(config).unwrap();

        // Everything written so far stays readable through every switch
        for i in 0..400 {
            tree.put(&key(i), &value(i, 0)).unwrap();
            for j in (0..=i).step_by(37) {
                assert_eq!(tree.get(&key(j)).unwrap(), Some(value(j, 0)), "key {} after {}", j, i);
            }
        }

        assert!(tree.wait_idle(Duration::from_secs(10)));
        assert!(tree.stats().compaction.flushes > 0);
        for i in 0..400 {
            assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i, 0)));
        }
    }

    #[test]
    fn test_random_round_trip_with_compaction() {
        let dir = TempDir::new().unwrap();
        let config = TreeConfig::for_testing(dir.path()).with_memtable(MemTableKind::SkipList);
        let mut rng = StdRng::seed_from_u64(42);
        let mut expected: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        {
            let tree = Tree::open(config.clone()).unwrap();
            for round in 0..3000u32 {
                let i = rng.gen_range(0..800u32);
                let v = value(i, round);
                tree.put(&key(i), &v).unwrap();
                expected.insert(key(i), v);
            }
            assert!(tree.wait_idle(Duration::from_secs(30)));

            let stats = tree.stats();
            assert!(stats.compaction.flushes >= 2);
            assert!(stats.compaction.compactions >= 1);
            assert_levels_disjoint(&tree);

            for (k, v) in &expected {
                assert_eq!(tree.get(k).unwrap().as_ref(), Some(v));
            }
            assert_eq!(tree.get(&key(9999)).unwrap(), None);
        }

        let tree = Tree::open(config).unwrap();
        assert_levels_disjoint(&tree);
        for (k, v) in &expected {
            assert_eq!(tree.get(k).unwrap().as_ref(), Some(v));
        }
    }

    #[test]
    fn test_concurrent_readers_during_compaction() {
        let dir = TempDir::new().unwrap();
        let tree = Arc::new(Tree::open(TreeConfig::for_testing(dir.path())).unwrap());

        for i in 0..200 {
            tree.put(&key(i), &value(i, 0)).unwrap();
        }

        let readers: Vec<_> = (0..4)
            .map(|r| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(r);
                    for _ in 0..3000 {
                        let i = rng.gen_range(0..200u32);
                        let found = tree.get(&key(i)).unwrap();
                        assert!(found.is_some(), "key {} went missing", i);
                    }
                })
            })
            .collect();

        // Keep flushes and compactions busy while readers run
        for round in 1..6 {
            for i in 200..600 {
                tree.put(&key(i), &value(i, round)).unwrap();
            }
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert!(tree.wait_idle(Duration::from_secs(30)));
        assert_levels_disjoint(&tree);
        for i in 0..200 {
            assert_eq!(tree.get(&key(i)).unwrap(), Some(value(i, 0)));
        }
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = TempDir::new().unwrap();
        let tree = Arc::new(Tree::open(TreeConfig::for_testing(dir.path())).unwrap());

        let writers: Vec<_> = (0..4u32)
            .map(|w| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..250 {
                        tree.put(&key(w * 1000 + i), &value(i, w)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert!(tree.wait_idle(Duration::from_secs(30)));
        for w in 0..4u32 {
            for i in 0..250 {
                assert_eq!(tree.get(&key(w * 1000 + i)).unwrap(), Some(value(i, w)));
            }
        }
    }

    #[test]
    fn test_stats_reflect_writes() {
        let dir = TempDir::new().unwrap();
        let tree = Tree::open(TreeConfig::for_testing(dir.path())).unwrap();
        tree.put(b"k1", b"v1").unwrap();
        tree.put(b"k2", b"v2").unwrap();

        let stats = tree.stats();
        assert_eq!(stats.active_memtable_entries, 2);
        assert_eq!(stats.active_memtable_bytes, 8);
        assert_eq!(stats.levels.len(), tree.config().max_level);

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"active_memtable_entries\":2"));
    }
}
