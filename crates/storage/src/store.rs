//! Ordered in-memory table store
//!
//! `TableStore` holds the current committed image of every table in one
//! `BTreeMap` behind a `parking_lot::RwLock`.
//!
//! # Design
//!
//! - BTreeMap: ordered keys, prefix scans are a single range walk
//! - RwLock: readers share, a commit applies its whole batch under one write
//!   guard so no reader observes half a commit
//! - Per-record versions: every write stamps the commit version, which the
//!   concurrency layer uses for first-committer-wins validation
//!
//! The store never assigns versions itself; versions come from the
//! transaction manager.

use crate::key::{Key, Partition, Table};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

/// A record value plus the version of the commit that wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    /// Encoded record
    pub value: Vec<u8>,
    /// Commit version that wrote this value
    pub version: u64,
}

/// Committed image of all tables
pub struct TableStore {
    data: RwLock<BTreeMap<Key, VersionedRecord>>,
    /// Highest applied commit version
    version: AtomicU64,
}

impl TableStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Get current version
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Set version (used during recovery)
    pub fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    /// Get total number of records
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Get a record by key
    pub fn get(&self, key: &Key) -> Option<VersionedRecord> {
        self.data.read().get(key).cloned()
    }

    /// Version of a key, 0 when absent
    pub fn version_of(&self, key: &Key) -> u64 {
        self.data.read().get(key).map(|r| r.version).unwrap_or(0)
    }

    /// Check if a key exists
    pub fn contains(&self, key: &Key) -> bool {
        self.data.read().contains_key(key)
    }

    /// List records under `(partition, table, prefix)`, in key order
    pub fn scan_prefix(
        &self,
        partition: &Partition,
        table: Table,
        prefix: &[u8],
    ) -> Vec<(Key, VersionedRecord)> {
        let start = Key::new(partition.clone(), table, prefix.to_vec());
        let data = self.data.read();
        data.range((Bound::Included(start), Bound::Unbounded))
            .take_while(|(k, _)| k.has_prefix(partition, table, prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Queue partitions that currently hold at least one record
    pub fn queue_partitions(&self) -> Vec<String> {
        let data = self.data.read();
        let mut out: Vec<String> = Vec::new();
        for key in data.keys() {
            if let Partition::Queue(name) = &key.partition {
                if out.last() != Some(name) {
                    out.push(name.clone());
                }
            }
        }
        out
    }

    /// Apply a batch of writes and deletes atomically
    ///
    /// All writes are stamped with `version`. Readers see either none or all
    /// of the batch.
    pub fn apply_batch(&self, writes: &[(Key, Vec<u8>)], deletes: &[Key], version: u64) {
        let mut data = self.data.write();
        for (key, value) in writes {
            data.insert(
                key.clone(),
                VersionedRecord {
                    value: value.clone(),
                    version,
                },
            );
        }
        for key in deletes {
            data.remove(key);
        }
        drop(data);
        self.version.fetch_max(version, Ordering::AcqRel);
    }

    /// Copy of every record, in key order (checkpointing)
    pub fn entries(&self) -> Vec<(Key, VersionedRecord)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore")
            .field("version", &self.version())
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn outgoing(id: u8) -> Key {
        Key::global(Table::Outgoing, vec![id])
    }

    #[test]
    fn test_store_creation() {
        let store = TableStore::new();
        assert!(store.is_empty());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_apply_batch_and_get() {
        let store = TableStore::new();
        store.apply_batch(&[(outgoing(1), b"a".to_vec())], &[], 1);

        let rec = store.get(&outgoing(1)).unwrap();
        assert_eq!(rec.value, b"a");
        assert_eq!(rec.version, 1);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = TableStore::new();
        assert!(store.get(&outgoing(1)).is_none());
        assert_eq!(store.version_of(&outgoing(1)), 0);
    }

    #[test]
    fn test_delete_in_batch() {
        let store = TableStore::new();
        store.apply_batch(&[(outgoing(1), b"a".to_vec())], &[], 1);
        store.apply_batch(&[(outgoing(2), b"b".to_vec())], &[outgoing(1)], 2);

        assert!(!store.contains(&outgoing(1)));
        assert!(store.contains(&outgoing(2)));
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn test_overwrite_bumps_record_version() {
        let store = TableStore::new();
        store.apply_batch(&[(outgoing(1), b"a".to_vec())], &[], 1);
        store.apply_batch(&[(outgoing(1), b"b".to_vec())], &[], 5);
        assert_eq!(store.version_of(&outgoing(1)), 5);
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let store = TableStore::new();
        store.apply_batch(
            &[
                (Key::in_queue("q", Table::Incoming, b"a\0\x02".to_vec()), vec![2]),
                (Key::in_queue("q", Table::Incoming, b"a\0\x01".to_vec()), vec![1]),
                (Key::in_queue("q", Table::Incoming, b"b\0\x01".to_vec()), vec![3]),
                (Key::in_queue("q", Table::History, b"a\0\x01".to_vec()), vec![4]),
                (Key::in_queue("r", Table::Incoming, b"a\0\x01".to_vec()), vec![5]),
            ],
            &[],
            1,
        );

        let hits = store.scan_prefix(&Partition::queue("q"), Table::Incoming, b"a\0");
        let values: Vec<u8> = hits.iter().map(|(_, v)| v.value[0]).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_scan_empty_prefix_covers_table() {
        let store = TableStore::new();
        store.apply_batch(
            &[
                (outgoing(1), vec![1]),
                (outgoing(2), vec![2]),
                (Key::global(Table::Recovery, vec![1]), vec![3]),
            ],
            &[],
            1,
        );
        assert_eq!(store.scan_prefix(&Partition::Global, Table::Outgoing, &[]).len(), 2);
    }

    #[test]
    fn test_queue_partitions() {
        let store = TableStore::new();
        store.apply_batch(
            &[
                (Key::in_queue("b", Table::Incoming, vec![1]), vec![]),
                (Key::in_queue("a", Table::Incoming, vec![1]), vec![]),
                (Key::in_queue("a", Table::History, vec![1]), vec![]),
                (outgoing(1), vec![]),
            ],
            &[],
            1,
        );
        assert_eq!(store.queue_partitions(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_concurrent_batches_on_disjoint_keys() {
        use std::thread;
        let store = Arc::new(TableStore::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for j in 0..50u8 {
                        let key = Key::global(Table::Outgoing, vec![i, j]);
                        store.apply_batch(&[(key, vec![j])], &[], (i as u64) * 100 + j as u64 + 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 400);
        assert_eq!(store.version(), 750);
    }

    #[test]
    fn test_debug_impl() {
        let store = TableStore::new();
        let debug_str = format!("{:?}", store);
        assert!(debug_str.contains("TableStore"));
        assert!(debug_str.contains("records"));
    }
}
