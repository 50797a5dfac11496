//! Streaming k-way merge over sorted sources
//!
//! Sources are given in priority order: index 0 holds the newest data. When
//! several sources carry the same key, only the entry of the lowest-indexed
//! source is yielded. Memory use is one pending entry per source.
//!
//! A source error ends the merge: it is yielded once, then iteration stops.

use crate::{Result, StorageError};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

pub type KvIterator = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send>;

#[derive(Debug)]
struct HeapItem {
    key: Vec<u8>,
    value: Vec<u8>,
    source_id: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source_id == other.source_id
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Key ascending, then newest source first
        self.key
            .cmp(&other.key)
            .then(self.source_id.cmp(&other.source_id))
    }
}

pub struct MergingIterator {
    heap: BinaryHeap<Reverse<HeapItem>>,
    sources: Vec<KvIterator>,
    last_key: Option<Vec<u8>>,
    error: Option<StorageError>,
    finished: bool,
}

impl MergingIterator {
    pub fn new(sources: Vec<KvIterator>) -> Self {
        let mut iter = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            last_key: None,
            error: None,
            finished: false,
        };

        for source_id in 0..iter.sources.len() {
            iter.refill_from_source(source_id);
        }
        iter
    }

    fn refill_from_source(&mut self, source_id: usize) {
        let Some(source) = self.sources.get_mut(source_id) else {
            return;
        };
        match source.next() {
            Some(Ok((key, value))) => self.heap.push(Reverse(HeapItem {
                key,
                value,
                source_id,
            })),
            Some(Err(e)) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergingIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(e) = self.error.take() {
                self.finished = true;
                return Some(Err(e));
            }

            let Reverse(item) = match self.heap.pop() {
                Some(item) => item,
                None => {
                    self.finished = true;
                    return None;
                }
            };

            self.refill_from_source(item.source_id);

            // Older versions of a key already yielded
            if self.last_key.as_deref() == Some(item.key.as_slice()) {
                continue;
            }

            self.last_key = Some(item.key.clone());
            return Some(Ok((item.key, item.value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(entries: &[(&str, &str)]) -> KvIterator {
        let items: Vec<Result<(Vec<u8>, Vec<u8>)>> = entries
            .iter()
            .map(|(k, v)| Ok((k.as_bytes().to_vec(), v.as_bytes().to_vec())))
            .collect();
        Box::new(items.into_iter())
    }

    fn collect(iter: MergingIterator) -> Vec<(String, String)> {
        iter.map(|r| {
            let (k, v) = r.unwrap();
            (String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap())
        })
        .collect()
    }

    #[test]
    fn test_merging_iterator_basic() {
        let iter = MergingIterator::new(vec![
            source(&[("a", "1"), ("c", "3"), ("e", "5")]),
            source(&[("b", "2"), ("d", "4"), ("f", "6")]),
        ]);

        let keys: Vec<String> = collect(iter).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn test_newest_source_wins() {
        let iter = MergingIterator::new(vec![
            source(&[("b", "new"), ("d", "new")]),
            source(&[("a", "mid"), ("b", "mid")]),
            source(&[("a", "old"), ("b", "old"), ("d", "old"), ("e", "old")]),
        ]);

        assert_eq!(
            collect(iter),
            vec![
                ("a".to_string(), "mid".to_string()),
                ("b".to_string(), "new".to_string()),
                ("d".to_string(), "new".to_string()),
                ("e".to_string(), "old".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_sources() {
        let iter = MergingIterator::new(vec![source(&[]), source(&[("x", "1")]), source(&[])]);
        assert_eq!(collect(iter), vec![("x".to_string(), "1".to_string())]);
        assert_eq!(MergingIterator::new(Vec::new()).count(), 0);
    }

    #[test]
    fn test_source_error_stops_merge() {
        let failing: Vec<Result<(Vec<u8>, Vec<u8>)>> = vec![
            Ok((b"a".to_vec(), b"1".to_vec())),
            Err(StorageError::Corruption("bad block".into())),
        ];
        let mut iter = MergingIterator::new(vec![
            Box::new(failing.into_iter()),
            source(&[("b", "2"), ("c", "3")]),
        ]);

        assert_eq!(iter.next().unwrap().unwrap().0, b"a".to_vec());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
