//! Transaction manager for coordinating commit operations
//!
//! Provides atomic commit by orchestrating:
//! 1. Validation (first-committer-wins)
//! 2. WAL writing (durability)
//! 3. Storage application (visibility)
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. Acquire commit lock
//! 2. validate() - Check the read set for conflicts
//! 3. IF conflicts: abort and return CommitError::Conflict
//! 4. Allocate commit_version (increment global version)
//! 5. Append BeginTxn, Put/Delete..., CommitTxn to WAL (DURABILITY POINT)
//! 6. apply_batch() to storage - Apply to in-memory tables
//! 7. Return Ok(commit_version)
//! ```
//!
//! If a crash occurs before step 5 completes: the transaction is not durable
//! and is discarded on replay. After step 5: it is replayed.

use crate::transaction::{CommitError, Scope, StoreTransaction, TransactionStatus};
use ferry_durability::{Wal, WalEntry};
use ferry_storage::TableStore;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Manages transaction lifecycle and atomic commits
///
/// # Thread Safety
///
/// The commit operation is serialized via an internal lock to prevent TOCTOU
/// races between validation and storage application: no other transaction can
/// modify storage between the time we validate and the time we apply.
pub struct TransactionManager {
    /// Global version counter
    ///
    /// Monotonically increasing. Each committed write transaction increments by 1.
    version: AtomicU64,

    /// Next transaction ID (WAL entries)
    next_txn_id: AtomicU64,

    /// Commit serialization lock
    commit_lock: Mutex<()>,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(initial_version: u64) -> Self {
        Self::with_txn_id(initial_version, 0)
    }

    /// Create a manager whose txn ids start after `max_txn_id`
    ///
    /// Used after replay so new transactions never reuse an id in the WAL.
    pub fn with_txn_id(initial_version: u64, max_txn_id: u64) -> Self {
        TransactionManager {
            version: AtomicU64::new(initial_version),
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            commit_lock: Mutex::new(()),
        }
    }

    /// Get current global version
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Allocate next transaction ID
    pub fn next_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate next commit version
    ///
    /// Gaps occur when a transaction fails after allocation (WAL write
    /// failure); version numbers are not contiguous.
    pub fn allocate_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Begin a transaction on `store`
    pub fn begin<'a>(&self, store: &'a TableStore, scope: Scope) -> StoreTransaction<'a> {
        StoreTransaction::new(self.next_txn_id(), store, scope)
    }

    /// Commit a transaction atomically
    ///
    /// `wal` is `None` for ephemeral stores.
    ///
    /// # Returns
    /// - Ok(commit_version) on success (the current version for read-only
    ///   transactions, which never touch the WAL)
    /// - Err(CommitError) if validation or the WAL append fails; the
    ///   transaction is then Aborted and nothing was applied
    pub fn commit(
        &self,
        txn: &mut StoreTransaction<'_>,
        wal: Option<&Mutex<Wal>>,
    ) -> Result<u64, CommitError> {
        let _commit_guard = self.commit_lock.lock();

        if !txn.is_active() {
            return Err(CommitError::InvalidState(format!(
                "transaction {} is {:?}",
                txn.txn_id, txn.status
            )));
        }

        if let Err(e) = txn.validate() {
            tracing::debug!(txn_id = txn.txn_id, error = %e, "commit validation failed");
            txn.mark_aborted(e.to_string());
            return Err(e);
        }

        if txn.is_read_only() {
            txn.mark_committed();
            return Ok(self.current_version());
        }

        let commit_version = self.allocate_version();
        let (puts, deletes) = txn.write_batch();

        if let Some(wal) = wal {
            let entries = wal_entries(txn.txn_id, commit_version, &puts, &deletes);
            if let Err(e) = wal.lock().append_batch(&entries) {
                tracing::error!(
                    txn_id = txn.txn_id,
                    commit_version = commit_version,
                    error = %e,
                    "WAL append failed, transaction aborted"
                );
                txn.mark_aborted(format!("WAL write failed: {}", e));
                return Err(CommitError::Wal(e.to_string()));
            }
        }

        // DURABILITY POINT passed: apply for visibility
        txn.store().apply_batch(&puts, &deletes, commit_version);
        txn.mark_committed();
        Ok(commit_version)
    }

    /// Block commits until the guard drops
    ///
    /// Checkpointing holds this while it snapshots the tables and rewrites
    /// the WAL so no commit lands in between.
    pub fn pause_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Explicitly abort a transaction
    ///
    /// Nothing is written to the WAL; buffered writes are discarded.
    pub fn abort(&self, txn: &mut StoreTransaction<'_>, reason: impl Into<String>) {
        if txn.status == TransactionStatus::Active {
            txn.mark_aborted(reason);
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("version", &self.current_version())
            .finish()
    }
}

fn wal_entries(
    txn_id: u64,
    version: u64,
    puts: &[(ferry_storage::Key, Vec<u8>)],
    deletes: &[ferry_storage::Key],
) -> Vec<WalEntry> {
    let mut entries = Vec::with_capacity(puts.len() + deletes.len() + 2);
    entries.push(WalEntry::BeginTxn {
        txn_id,
        timestamp: chrono::Utc::now().timestamp_micros(),
    });
    for (key, value) in puts {
        entries.push(WalEntry::Put {
            txn_id,
            key: key.clone(),
            value: value.clone(),
            version,
        });
    }
    for key in deletes {
        entries.push(WalEntry::Delete {
            txn_id,
            key: key.clone(),
            version,
        });
    }
    entries.push(WalEntry::CommitTxn { txn_id, version });
    entries
}
