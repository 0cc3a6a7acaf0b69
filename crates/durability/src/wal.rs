//! WAL (Write-Ahead Log) entry types and log file
//!
//! This module defines all WAL entry types for the durability layer:
//! - BeginTxn: Start of a store transaction
//! - Put: Insert or overwrite of one record
//! - Delete: Removal of one record
//! - CommitTxn: Successful transaction completion (the durability point)
//! - AbortTxn: Transaction discarded after it began writing
//!
//! A store transaction is durable exactly when its CommitTxn frame is on
//! disk. Replay applies only transactions whose CommitTxn it reads.

use crate::encoding::{decode_entry, encode_entry};
use crate::mode::DurabilityMode;
use ferry_storage::Key;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// WAL entry types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WalEntry {
    /// Begin transaction
    BeginTxn {
        /// Transaction identifier (unique within the log)
        txn_id: u64,
        /// Wall-clock start, microseconds since the epoch
        timestamp: i64,
    },

    /// Record write
    Put {
        /// Owning transaction
        txn_id: u64,
        /// Key being written
        key: Key,
        /// Encoded record
        value: Vec<u8>,
        /// Commit version stamped on the record
        version: u64,
    },

    /// Record delete
    Delete {
        /// Owning transaction
        txn_id: u64,
        /// Key being deleted
        key: Key,
        /// Commit version of the delete
        version: u64,
    },

    /// Commit transaction
    ///
    /// All operations in this transaction are now durable.
    CommitTxn {
        /// Transaction identifier
        txn_id: u64,
        /// Commit version
        version: u64,
    },

    /// Abort transaction
    ///
    /// All operations in this transaction should be discarded.
    AbortTxn {
        /// Transaction identifier
        txn_id: u64,
    },
}

impl WalEntry {
    /// Get transaction ID
    pub fn txn_id(&self) -> u64 {
        match self {
            WalEntry::BeginTxn { txn_id, .. }
            | WalEntry::Put { txn_id, .. }
            | WalEntry::Delete { txn_id, .. }
            | WalEntry::CommitTxn { txn_id, .. }
            | WalEntry::AbortTxn { txn_id } => *txn_id,
        }
    }

    /// Get version (if applicable)
    pub fn version(&self) -> Option<u64> {
        match self {
            WalEntry::Put { version, .. }
            | WalEntry::Delete { version, .. }
            | WalEntry::CommitTxn { version, .. } => Some(*version),
            _ => None,
        }
    }

    /// Check if entry is a transaction boundary
    pub fn is_txn_boundary(&self) -> bool {
        matches!(
            self,
            WalEntry::BeginTxn { .. } | WalEntry::CommitTxn { .. } | WalEntry::AbortTxn { .. }
        )
    }
}

/// WAL errors
#[derive(Debug, Error)]
pub enum WalError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Frame ends before its declared length
    #[error("incomplete entry at {offset}: need {needed} bytes, have {have}")]
    Incomplete {
        /// File offset of the frame
        offset: u64,
        /// Bytes available
        have: usize,
        /// Bytes the frame needs
        needed: usize,
    },

    /// Frame payload does not match its checksum
    #[error("checksum mismatch at {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// File offset of the frame
        offset: u64,
        /// Stored checksum
        expected: u32,
        /// Computed checksum
        actual: u32,
    },
}

impl From<WalError> for ferry_core::Error {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(io) => ferry_core::Error::Io(io),
            WalError::Serialization(msg) => ferry_core::Error::Serialization(msg),
            other => ferry_core::Error::Corruption(other.to_string()),
        }
    }
}

/// Everything readable from a log file
#[derive(Debug, Default)]
pub struct WalReadResult {
    /// Decoded entries, in file order
    pub entries: Vec<WalEntry>,
    /// Length of the valid prefix of the file
    pub valid_len: u64,
    /// Bytes after the valid prefix
    pub trailing_bytes: u64,
    /// The first invalid frame failed its checksum (as opposed to ending early)
    pub corrupt: bool,
}

/// Append-only write-ahead log file
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    mode: DurabilityMode,
    len: u64,
    unsynced_commits: usize,
    last_sync: Instant,
}

impl Wal {
    /// Open (or create) the log at `path`, appending after existing content
    pub fn open(path: impl AsRef<Path>, mode: DurabilityMode) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "opened WAL");

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            mode,
            len,
            unsynced_commits: 0,
            last_sync: Instant::now(),
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Check if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Durability mode
    pub fn mode(&self) -> DurabilityMode {
        self.mode
    }

    /// Commits appended since the last fsync
    pub fn unsynced_commits(&self) -> usize {
        self.unsynced_commits
    }

    /// Append one committed transaction's frames and honor the durability mode
    ///
    /// Returns once the frames are written (and, in Strict mode, fsynced).
    pub fn append_batch(&mut self, entries: &[WalEntry]) -> Result<(), WalError> {
        for entry in entries {
            let frame = encode_entry(entry)?;
            self.writer.write_all(&frame)?;
            self.len += frame.len() as u64;
        }
        self.writer.flush()?;
        self.unsynced_commits += 1;

        if self.mode.sync_due(self.unsynced_commits, self.last_sync.elapsed()) {
            self.sync()?;
        }
        Ok(())
    }

    /// Append a single entry without forcing a sync
    pub fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
        let frame = encode_entry(entry)?;
        self.writer.write_all(&frame)?;
        self.len += frame.len() as u64;
        Ok(())
    }

    /// Flush buffered frames and fsync the file
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced_commits = 0;
        self.last_sync = Instant::now();
        Ok(())
    }

    /// Cut the file back to `len` bytes (drops a torn tail before appending)
    pub fn truncate(&mut self, len: u64) -> Result<(), WalError> {
        if len >= self.len {
            return Ok(());
        }
        self.writer.flush()?;
        self.writer.get_ref().set_len(len)?;
        self.writer.get_ref().sync_all()?;
        warn!(
            path = %self.path.display(),
            from = self.len,
            to = len,
            "truncated WAL tail"
        );
        self.len = len;
        Ok(())
    }

    /// Read every valid frame of the log at `path`
    ///
    /// Stops at the first frame that is incomplete or fails its checksum;
    /// everything before it is a prefix of the written history.
    pub fn read_all(path: impl AsRef<Path>) -> Result<WalReadResult, WalError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(WalReadResult::default());
        }

        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;

        let mut result = WalReadResult::default();
        let mut offset = 0usize;
        while offset < buf.len() {
            match decode_entry(&buf[offset..], offset as u64) {
                Ok((entry, consumed)) => {
                    result.entries.push(entry);
                    offset += consumed;
                }
                Err(WalError::Incomplete { .. }) => break,
                Err(WalError::ChecksumMismatch { .. }) | Err(WalError::Serialization(_)) => {
                    result.corrupt = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        result.valid_len = offset as u64;
        result.trailing_bytes = (buf.len() - offset) as u64;
        Ok(result)
    }

    /// Atomically replace the log at `path` with `entries`
    ///
    /// Writes a sibling temp file, fsyncs it, renames it over the log, and
    /// returns a log open for appending.
    pub fn rewrite(
        path: impl AsRef<Path>,
        entries: &[WalEntry],
        mode: DurabilityMode,
    ) -> Result<Self, WalError> {
        let path = path.as_ref();
        let tmp = path.with_extension("compact");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            for entry in entries {
                writer.write_all(&encode_entry(entry)?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Self::open(path, mode)
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("len", &self.len)
            .finish()
    }
}
