//! Crash recovery by WAL replay
//!
//! ## Recovery Sequence
//!
//! 1. Read every valid frame of the log
//! 2. Group frames by txn_id
//! 3. Keep transactions that reached CommitTxn, in commit order
//! 4. Discard aborted and orphaned (no commit marker) transactions
//! 5. Report the valid prefix length so the writer can drop a torn tail
//!
//! ## Key Principle
//!
//! After crash recovery, the store must correspond to a **prefix of the
//! committed transaction history**. No partial transactions may be visible.

use crate::wal::{Wal, WalEntry, WalError};
use ferry_storage::Key;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Replay options
#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Fail when a frame fails its checksum instead of truncating there
    pub fail_on_corruption: bool,
    /// Log every discarded transaction
    pub verbose: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        RecoveryOptions {
            fail_on_corruption: true,
            verbose: false,
        }
    }
}

impl RecoveryOptions {
    /// Tolerate a corrupt frame by discarding it and everything after it
    pub fn permissive() -> Self {
        RecoveryOptions {
            fail_on_corruption: false,
            verbose: true,
        }
    }
}

/// Replay statistics
#[derive(Debug, Default, Clone)]
pub struct RecoveryResult {
    /// WAL entries read
    pub wal_entries_replayed: u64,
    /// Transactions successfully recovered
    pub transactions_recovered: u64,
    /// Orphaned transactions (no commit marker)
    pub orphaned_transactions: u64,
    /// Aborted transactions discarded
    pub aborted_transactions: u64,
    /// Bytes after the valid prefix (torn tail or corruption)
    pub bytes_truncated: u64,
    /// The log held a frame that failed its checksum
    pub corruption_detected: bool,
    /// Highest txn_id seen
    pub max_txn_id: u64,
    /// Highest committed version seen
    pub final_version: u64,
    /// Total recovery time (microseconds)
    pub recovery_time_micros: u64,
}

impl RecoveryResult {
    /// Get human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "WAL replay complete: {} transactions, {} entries, {} orphaned, {} aborted, {} bytes truncated, version {}, {:.2}ms",
            self.transactions_recovered,
            self.wal_entries_replayed,
            self.orphaned_transactions,
            self.aborted_transactions,
            self.bytes_truncated,
            self.final_version,
            self.recovery_time_micros as f64 / 1000.0,
        )
    }

    /// Check if replay had any issues (corruption, orphaned txns, torn tail)
    pub fn has_issues(&self) -> bool {
        self.corruption_detected || self.orphaned_transactions > 0 || self.bytes_truncated > 0
    }
}

/// Replay errors
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Corrupt frame and corruption is not tolerated
    #[error("corrupt WAL frame at offset {0}")]
    Corruption(u64),

    /// WAL error
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
}

impl From<RecoveryError> for ferry_core::Error {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::Corruption(offset) => {
                ferry_core::Error::Corruption(format!("WAL frame at offset {}", offset))
            }
            RecoveryError::Wal(w) => w.into(),
        }
    }
}

/// One write of a recovered transaction
#[derive(Debug, Clone, PartialEq)]
pub enum WalOp {
    /// Record write
    Put(Key, Vec<u8>),
    /// Record delete
    Delete(Key),
}

/// A transaction that reached its commit marker
#[derive(Debug, Clone)]
pub struct CommittedTxn {
    /// Transaction id
    pub txn_id: u64,
    /// Commit version
    pub version: u64,
    /// Writes in log order
    pub ops: Vec<WalOp>,
}

impl CommittedTxn {
    /// Split into the batch shape `TableStore::apply_batch` takes
    pub fn into_batch(self) -> (Vec<(Key, Vec<u8>)>, Vec<Key>) {
        let mut writes = Vec::new();
        let mut deletes = Vec::new();
        for op in self.ops {
            match op {
                WalOp::Put(key, value) => writes.push((key, value)),
                WalOp::Delete(key) => deletes.push(key),
            }
        }
        (writes, deletes)
    }
}

/// Output of a replay
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// Committed transactions in commit order
    pub transactions: Vec<CommittedTxn>,
    /// Statistics
    pub result: RecoveryResult,
    /// Length of the valid log prefix
    pub valid_len: u64,
}

/// WAL replay engine
pub struct WalReplay;

impl WalReplay {
    /// Replay the log at `wal_path`
    pub fn replay(
        wal_path: &Path,
        options: &RecoveryOptions,
    ) -> Result<ReplayOutcome, RecoveryError> {
        let start = std::time::Instant::now();
        info!("Starting WAL replay from {}", wal_path.display());

        let read = Wal::read_all(wal_path)?;
        if read.corrupt && options.fail_on_corruption {
            return Err(RecoveryError::Corruption(read.valid_len));
        }
        if read.corrupt {
            warn!(
                offset = read.valid_len,
                discarded = read.trailing_bytes,
                "corrupt WAL frame, discarding the rest of the log"
            );
        } else if read.trailing_bytes > 0 {
            debug!(
                offset = read.valid_len,
                bytes = read.trailing_bytes,
                "torn WAL tail"
            );
        }

        let mut outcome = ReplayOutcome {
            valid_len: read.valid_len,
            ..Default::default()
        };
        let result = &mut outcome.result;
        result.bytes_truncated = read.trailing_bytes;
        result.corruption_detected = read.corrupt;

        let mut pending: HashMap<u64, Vec<WalOp>> = HashMap::new();

        for entry in read.entries {
            result.wal_entries_replayed += 1;
            result.max_txn_id = result.max_txn_id.max(entry.txn_id());

            match entry {
                WalEntry::BeginTxn { txn_id, .. } => {
                    pending.insert(txn_id, Vec::new());
                }
                WalEntry::Put {
                    txn_id, key, value, ..
                } => {
                    pending.entry(txn_id).or_default().push(WalOp::Put(key, value));
                }
                WalEntry::Delete { txn_id, key, .. } => {
                    pending.entry(txn_id).or_default().push(WalOp::Delete(key));
                }
                WalEntry::CommitTxn { txn_id, version } => {
                    if let Some(ops) = pending.remove(&txn_id) {
                        result.transactions_recovered += 1;
                        result.final_version = result.final_version.max(version);
                        outcome.transactions.push(CommittedTxn {
                            txn_id,
                            version,
                            ops,
                        });
                    }
                }
                WalEntry::AbortTxn { txn_id } => {
                    if pending.remove(&txn_id).is_some() {
                        result.aborted_transactions += 1;
                    }
                }
            }
        }

        result.orphaned_transactions = pending.len() as u64;
        if options.verbose {
            for (txn_id, ops) in &pending {
                warn!("Orphaned transaction {} with {} entries", txn_id, ops.len());
            }
        }

        result.recovery_time_micros = start.elapsed().as_micros() as u64;
        info!("{}", result.summary());
        Ok(outcome)
    }
}
