//! LSM-Tree Storage Engine
//!
//! ## Architecture
//! - **MemTable**: In-memory sorted write buffer backed by a WAL segment
//! - **Read-only queue**: Frozen memtables waiting for flush
//! - **Level 0**: Flushed SSTables, ranges may overlap
//! - **Levels 1+**: Compacted SSTables, disjoint ranges per level
//! - **Worker**: One background thread for flush and compaction
//!
//! ## On-disk layout
//! ```text
//! <dir>/<level>_<seq>.sst
//! <dir>/walfile/<generation>.wal
//! ```

pub mod memtable;
pub mod skiplist;
pub mod bloom;
pub mod sstable;
pub mod node;
pub mod cache;
pub mod level;
pub mod merging_iterator;
pub mod compaction;
pub mod recovery;
pub mod tree;

pub use memtable::{BTreeMemTable, MemTable, MemTableFactory, MemTableKind, ReadOnlyMemTable};
pub use skiplist::SkipListMemTable;
pub use bloom::BloomFilter;
pub use node::Node;
pub use level::LevelStats;
pub use merging_iterator::MergingIterator;
pub use compaction::CompactionStatsSnapshot;
pub use recovery::{get_level_and_seq_from_sst, get_mem_index_from_wal, get_stored_sst_entries};
pub use tree::{Tree, TreeStats};
