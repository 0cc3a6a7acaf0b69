//! Store transactions with read/write set tracking
//!
//! A [`StoreTransaction`] buffers every write until commit and records the
//! version of every key it read. Validation at commit compares those versions
//! with the store: if any changed, another transaction committed first and
//! this one fails with [`CommitError::Conflict`].
//!
//! Reads see the transaction's own buffered writes (read-your-writes).
//!
//! ## Scopes
//!
//! A transaction is opened against a [`Scope`]. `Scope::Global` may touch any
//! partition; `Scope::Queue(name)` only that queue's partition. Touching a key
//! outside the scope is an `InvalidOperation`.

use ferry_core::{Error, Result};
use ferry_storage::{Key, Partition, Table, TableStore};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use thiserror::Error as ThisError;

/// Which partitions a transaction may touch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every partition
    Global,
    /// One queue's partition
    Queue(String),
}

impl Scope {
    /// Scope of a single queue
    pub fn queue(name: impl Into<String>) -> Self {
        Scope::Queue(name.into())
    }

    /// Check whether `partition` is reachable from this scope
    pub fn permits(&self, partition: &Partition) -> bool {
        match (self, partition) {
            (Scope::Global, _) => true,
            (Scope::Queue(name), Partition::Queue(p)) => name == p,
            (Scope::Queue(_), Partition::Global) => false,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Queue(name) => write!(f, "queue:{}", name),
        }
    }
}

/// Transaction lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting reads and writes
    Active,
    /// Writes applied
    Committed,
    /// Discarded
    Aborted {
        /// Why
        reason: String,
    },
}

/// Commit failures
#[derive(Debug, ThisError)]
pub enum CommitError {
    /// A key read by the transaction was changed by a concurrent commit
    #[error("conflict on {key}: read version {read}, current version {current}")]
    Conflict {
        /// Conflicting key
        key: String,
        /// Version observed by the transaction
        read: u64,
        /// Version in the store at validation
        current: u64,
    },

    /// The WAL append failed; nothing was applied
    #[error("WAL error: {0}")]
    Wal(String),

    /// The transaction is not active
    #[error("invalid transaction state: {0}")]
    InvalidState(String),
}

impl From<CommitError> for Error {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::Conflict { .. } => Error::Conflict(e.to_string()),
            CommitError::Wal(msg) => Error::Storage(msg),
            CommitError::InvalidState(msg) => Error::InvalidOperation(msg),
        }
    }
}

/// A unit of work against a [`TableStore`]
pub struct StoreTransaction<'a> {
    /// Transaction id (WAL entries)
    pub txn_id: u64,
    /// Current status
    pub status: TransactionStatus,
    store: &'a TableStore,
    scope: Scope,
    read_set: FxHashMap<Key, u64>,
    /// `None` marks a delete
    write_set: BTreeMap<Key, Option<Vec<u8>>>,
}

impl<'a> StoreTransaction<'a> {
    /// Open a transaction on `store`
    pub fn new(txn_id: u64, store: &'a TableStore, scope: Scope) -> Self {
        Self {
            txn_id,
            status: TransactionStatus::Active,
            store,
            scope,
            read_set: FxHashMap::default(),
            write_set: BTreeMap::new(),
        }
    }

    /// Scope the transaction was opened with
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Store the transaction runs against
    pub fn store(&self) -> &'a TableStore {
        self.store
    }

    /// Check if the transaction still accepts operations
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// True when nothing was written
    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty()
    }

    fn check(&self, partition: &Partition) -> Result<()> {
        if !self.is_active() {
            return Err(Error::InvalidOperation(format!(
                "transaction {} is not active: {:?}",
                self.txn_id, self.status
            )));
        }
        if !self.scope.permits(partition) {
            return Err(Error::InvalidOperation(format!(
                "{} transaction cannot touch partition {}",
                self.scope, partition
            )));
        }
        Ok(())
    }

    fn observe(&mut self, key: &Key, version: u64) {
        self.read_set.entry(key.clone()).or_insert(version);
    }

    /// Read a record
    pub fn get(&mut self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.check(&key.partition)?;
        if let Some(buffered) = self.write_set.get(key) {
            return Ok(buffered.clone());
        }
        match self.store.get(key) {
            Some(record) => {
                self.observe(key, record.version);
                Ok(Some(record.value))
            }
            None => {
                self.observe(key, 0);
                Ok(None)
            }
        }
    }

    /// Check whether a record exists
    pub fn contains(&mut self, key: &Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace a record
    pub fn put(&mut self, key: Key, value: Vec<u8>) -> Result<()> {
        self.check(&key.partition)?;
        self.write_set.insert(key, Some(value));
        Ok(())
    }

    /// Delete a record (no-op if absent at commit)
    pub fn delete(&mut self, key: Key) -> Result<()> {
        self.check(&key.partition)?;
        self.write_set.insert(key, None);
        Ok(())
    }

    /// List records under `(partition, table, prefix)` in key order
    ///
    /// Buffered writes are merged over the committed image. Every committed
    /// record returned joins the read set.
    pub fn scan_prefix(
        &mut self,
        partition: &Partition,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Key, Vec<u8>)>> {
        self.check(partition)?;

        let mut merged: BTreeMap<Key, Vec<u8>> = BTreeMap::new();
        for (key, record) in self.store.scan_prefix(partition, table, prefix) {
            self.observe(&key, record.version);
            merged.insert(key, record.value);
        }
        for (key, value) in &self.write_set {
            if !key.has_prefix(partition, table, prefix) {
                continue;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Validate the read set against the store (first committer wins)
    pub fn validate(&self) -> std::result::Result<(), CommitError> {
        for (key, read) in &self.read_set {
            let current = self.store.version_of(key);
            if current != *read {
                return Err(CommitError::Conflict {
                    key: key.to_string(),
                    read: *read,
                    current,
                });
            }
        }
        Ok(())
    }

    /// Buffered writes split into `(puts, deletes)`
    pub fn write_batch(&self) -> (Vec<(Key, Vec<u8>)>, Vec<Key>) {
        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for (key, value) in &self.write_set {
            match value {
                Some(v) => puts.push((key.clone(), v.clone())),
                None => deletes.push(key.clone()),
            }
        }
        (puts, deletes)
    }

    /// Mark the transaction aborted and drop its buffered writes
    pub fn mark_aborted(&mut self, reason: impl Into<String>) {
        self.write_set.clear();
        self.status = TransactionStatus::Aborted {
            reason: reason.into(),
        };
    }

    pub(crate) fn mark_committed(&mut self) {
        self.status = TransactionStatus::Committed;
    }
}

impl std::fmt::Debug for StoreTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransaction")
            .field("txn_id", &self.txn_id)
            .field("scope", &self.scope)
            .field("status", &self.status)
            .field("reads", &self.read_set.len())
            .field("writes", &self.write_set.len())
            .finish()
    }
}
