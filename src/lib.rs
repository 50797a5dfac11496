//! lsmkv Storage Engine
//!
//! Embedded key-value store built on a log-structured merge tree.
//!
//! ## Features
//! - Arbitrary byte-string keys and values, lexicographic order
//! - Write-ahead log per memtable generation, replayed on open
//! - Leveled SSTables with per-block bloom filters and snappy compression
//! - Background flush and compaction on a single worker thread
//! - Crash-safe publication of SSTables without a manifest
//!
//! ## Example
//! ```no_run
//! use lsmkv::{Tree, TreeConfig};
//!
//! let tree = Tree::open(TreeConfig::new("./data"))?;
//! tree.put(b"key", b"value")?;
//! assert_eq!(tree.get(b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), lsmkv::StorageError>(())
//! ```
//!
//! The library logs through `tracing`; installing a subscriber is up to the
//! application.

pub mod config;
pub mod storage;

mod error;

pub use config::{DurabilityLevel, TreeConfig};
pub use error::{Result, StorageError};
pub use storage::lsm::{MemTable, MemTableFactory, MemTableKind, Tree, TreeStats};
