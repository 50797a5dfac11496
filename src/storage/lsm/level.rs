//! Level set: per-level, copy-on-write node lists
//!
//! Level 0 is ordered by sequence and its ranges may overlap. Levels >= 1 are
//! sorted by start key and pairwise disjoint, so a lookup touches at most one
//! node per level.
//!
//! Each level sits behind its own `RwLock<Arc<Vec<Arc<Node>>>>`. Readers hold
//! the lock only to clone the `Arc`; writers build a new vector and swap it in.
//! Multi-level writers take the locks in ascending level order.

use super::node::Node;
use crate::{Result, StorageError};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

pub type NodeList = Arc<Vec<Arc<Node>>>;

/// Per-level summary
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LevelStats {
    pub level: usize,
    pub nodes: usize,
    pub bytes: u64,
    pub entries: u64,
}

pub struct LevelSet {
    levels: Vec<RwLock<NodeList>>,
}

impl LevelSet {
    pub fn new(max_level: usize) -> Self {
        Self {
            levels: (0..max_level)
                .map(|_| RwLock::new(Arc::new(Vec::new())))
                .collect(),
        }
    }

    /// Build from loaded nodes; `by_level[l]` holds level `l` in any order
    pub fn from_nodes(by_level: Vec<Vec<Arc<Node>>>) -> Result<Self> {
        let mut levels = Vec::with_capacity(by_level.len());
        for (level, mut nodes) in by_level.into_iter().enumerate() {
            sort_level(level, &mut nodes);
            if level > 0 {
                check_disjoint(level, &nodes)?;
            }
            levels.push(RwLock::new(Arc::new(nodes)));
        }
        Ok(Self { levels })
    }

    pub fn max_level(&self) -> usize {
        self.levels.len()
    }

    /// Current node list of `level`
    pub fn snapshot(&self, level: usize) -> NodeList {
        Arc::clone(&*self.levels[level].read())
    }

    pub fn node_count(&self, level: usize) -> usize {
        self.snapshot(level).len()
    }

    pub fn total_size(&self, level: usize) -> u64 {
        self.snapshot(level).iter().map(|n| n.size()).sum()
    }

    /// Append flushed nodes to level 0
    pub fn append_l0(&self, nodes: Vec<Arc<Node>>) {
        let mut guard = self.levels[0].write();
        let mut next = Vec::with_capacity(guard.len() + nodes.len());
        next.extend(guard.iter().cloned());
        next.extend(nodes);
        sort_level(0, &mut next);
        *guard = Arc::new(next);
    }

    /// Remove `consumed` (by sequence) from `source` and `target` and insert
    /// `outputs` into `target`, as one step visible to readers.
    ///
    /// Returns the removed nodes. Fails without changing anything if the new
    /// target level would overlap.
    pub fn replace(
        &self,
        source: usize,
        target: usize,
        consumed: &[u64],
        outputs: Vec<Arc<Node>>,
    ) -> Result<Vec<Arc<Node>>> {
        if source > target || target >= self.levels.len() {
            return Err(StorageError::InvalidArgument(format!(
                "invalid compaction levels {} -> {}",
                source, target
            )));
        }

        let is_consumed = |node: &Arc<Node>| consumed.contains(&node.seq());

        // Ascending lock order
        let mut source_guard = self.levels[source].write();
        let mut target_guard = if source == target {
            None
        } else {
            Some(self.levels[target].write())
        };

        let current_target = match &target_guard {
            Some(guard) => Arc::clone(&**guard),
            None => Arc::clone(&*source_guard),
        };

        let mut removed = Vec::new();
        let mut next_target = Vec::with_capacity(current_target.len() + outputs.len());
        for node in current_target.iter() {
            if is_consumed(node) {
                removed.push(Arc::clone(node));
            } else {
                next_target.push(Arc::clone(node));
            }
        }
        next_target.extend(outputs);
        sort_level(target, &mut next_target);
        if target > 0 {
            check_disjoint(target, &next_target)?;
        }

        match target_guard.as_mut() {
            Some(guard) => {
                let mut next_source = Vec::with_capacity(source_guard.len());
                for node in source_guard.iter() {
                    if is_consumed(node) {
                        removed.push(Arc::clone(node));
                    } else {
                        next_source.push(Arc::clone(node));
                    }
                }
                *source_guard = Arc::new(next_source);
                **guard = Arc::new(next_target);
            }
            None => {
                *source_guard = Arc::new(next_target);
            }
        }

        Ok(removed)
    }

    /// Nodes of `level` whose range intersects `[start, end]`
    pub fn overlapping(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<Arc<Node>> {
        self.snapshot(level)
            .iter()
            .filter(|n| n.overlaps(start, end))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> Vec<LevelStats> {
        (0..self.levels.len())
            .map(|level| {
                let nodes = self.snapshot(level);
                LevelStats {
                    level,
                    nodes: nodes.len(),
                    bytes: nodes.iter().map(|n| n.size()).sum(),
                    entries: nodes.iter().map(|n| n.num_entries()).sum(),
                }
            })
            .collect()
    }

    /// Every node, level by level
    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        (0..self.levels.len())
            .flat_map(|level| self.snapshot(level).iter().cloned().collect::<Vec<_>>())
            .collect()
    }
}

/// The single node of a sorted, disjoint level whose range contains `key`
pub fn find_node<'a>(nodes: &'a [Arc<Node>], key: &[u8]) -> Option<&'a Arc<Node>> {
    let idx = nodes.partition_point(|n| n.end_key() < key);
    nodes.get(idx).filter(|n| n.start_key() <= key)
}

fn sort_level(level: usize, nodes: &mut [Arc<Node>]) {
    if level == 0 {
        nodes.sort_by_key(|n| n.seq());
    } else {
        nodes.sort_by(|a, b| a.start_key().cmp(b.start_key()));
    }
}

/// Sorted nodes of a level >= 1 must not share any key
pub fn check_disjoint(level: usize, nodes: &[Arc<Node>]) -> Result<()> {
    for pair in nodes.windows(2) {
        if pair[0].end_key() >= pair[1].start_key() {
            return Err(StorageError::Corruption(format!(
                "level {} nodes {} and {} overlap",
                level,
                pair[0].file_name(),
                pair[1].file_name()
            )));
        }
    }
    Ok(())
}
