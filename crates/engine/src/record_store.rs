//! Durable record store
//!
//! `RecordStore` assembles the layers below it into one transactional store:
//!
//! - `TableStore` holds the committed image of every table
//! - `TransactionManager` validates and commits `StoreTransaction`s
//! - `Wal` makes each commit durable before it becomes visible
//!
//! Opening a store replays its WAL into a fresh `TableStore`; a torn tail
//! left by a crash is truncated before the first new append.
//!
//! # Layout
//!
//! ```text
//! <path>/
//!   wal/current.wal
//! ```

use ferry_concurrency::{Scope, StoreTransaction, TransactionManager};
use ferry_core::{Error, Result};
use ferry_durability::{DurabilityMode, RecoveryOptions, Wal, WalEntry, WalReplay};
use ferry_storage::{Key, Table, TableStore};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Meta record holding the store's stable identifier
pub(crate) const STORE_ID_KEY: &[u8] = b"store_id";

/// Directory under the store path holding the log
const WAL_DIR: &str = "wal";
/// Active log file
const WAL_FILE: &str = "current.wal";

/// Transactional, crash-recoverable record store
pub struct RecordStore {
    id: Uuid,
    tables: TableStore,
    manager: TransactionManager,
    wal: Option<Mutex<Wal>>,
    mode: DurabilityMode,
    path: Option<PathBuf>,
}

impl RecordStore {
    /// Open (or create) a store at `path`
    ///
    /// With `DurabilityMode::None` nothing is read from or written to disk.
    pub fn open(path: impl AsRef<Path>, mode: DurabilityMode) -> Result<Self> {
        Self::open_with_options(path, mode, &RecoveryOptions::default())
    }

    /// Open with explicit replay options
    pub fn open_with_options(
        path: impl AsRef<Path>,
        mode: DurabilityMode,
        options: &RecoveryOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !mode.requires_wal() {
            let mut store = Self::ephemeral()?;
            store.path = Some(path);
            return Ok(store);
        }

        std::fs::create_dir_all(path.join(WAL_DIR))?;
        let wal_path = path.join(WAL_DIR).join(WAL_FILE);

        let outcome = WalReplay::replay(&wal_path, options)?;
        let tables = TableStore::new();
        for txn in outcome.transactions {
            let version = txn.version;
            let (writes, deletes) = txn.into_batch();
            tables.apply_batch(&writes, &deletes, version);
        }
        tables.set_version(outcome.result.final_version);

        let mut wal = Wal::open(&wal_path, mode)?;
        if wal.len() > outcome.valid_len {
            wal.truncate(outcome.valid_len)?;
        }

        let manager =
            TransactionManager::with_txn_id(outcome.result.final_version, outcome.result.max_txn_id);

        let mut store = Self {
            id: Uuid::nil(),
            tables,
            manager,
            wal: Some(Mutex::new(wal)),
            mode,
            path: Some(path),
        };
        store.id = store.load_or_assign_id()?;
        info!(
            store_id = %store.id,
            records = store.tables.len(),
            version = store.tables.version(),
            "record store opened"
        );
        Ok(store)
    }

    /// Create a store with no disk I/O
    pub fn ephemeral() -> Result<Self> {
        let mut store = Self {
            id: Uuid::nil(),
            tables: TableStore::new(),
            manager: TransactionManager::default(),
            wal: None,
            mode: DurabilityMode::None,
            path: None,
        };
        store.id = store.load_or_assign_id()?;
        Ok(store)
    }

    fn load_or_assign_id(&self) -> Result<Uuid> {
        self.run_in_transaction(Scope::Global, |txn| {
            let key = Key::global(Table::Meta, STORE_ID_KEY);
            if let Some(bytes) = txn.get(&key)? {
                return Uuid::from_slice(&bytes)
                    .map_err(|e| Error::Corruption(format!("store id: {}", e)));
            }
            let id = Uuid::new_v4();
            txn.put(key, id.as_bytes().to_vec())?;
            debug!(store_id = %id, "assigned store id");
            Ok(id)
        })
    }

    /// Stable identifier, persisted on first open
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Directory the store lives in, `None` when ephemeral
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Durability mode
    pub fn durability_mode(&self) -> DurabilityMode {
        self.mode
    }

    /// Commits not yet fsynced; always zero without a WAL
    pub fn unsynced_commits(&self) -> usize {
        self.wal
            .as_ref()
            .map_or(0, |wal| wal.lock().unsynced_commits())
    }

    /// Committed image (read-only inspection)
    pub fn tables(&self) -> &TableStore {
        &self.tables
    }

    /// Begin an explicit transaction
    pub fn begin(&self, scope: Scope) -> StoreTransaction<'_> {
        self.manager.begin(&self.tables, scope)
    }

    /// Commit an explicit transaction
    ///
    /// A stale read fails with `Error::Conflict`; the caller decides whether
    /// to retry.
    pub fn commit(&self, txn: &mut StoreTransaction<'_>) -> Result<u64> {
        self.manager
            .commit(txn, self.wal.as_ref())
            .map_err(Error::from)
    }

    /// Run `f` in a transaction and commit it
    ///
    /// If `f` fails, the transaction is aborted and its error returned.
    pub fn run_in_transaction<T, F>(&self, scope: Scope, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> Result<T>,
    {
        let mut txn = self.begin(scope);
        match f(&mut txn) {
            Ok(value) => {
                self.commit(&mut txn)?;
                Ok(value)
            }
            Err(e) => {
                self.manager.abort(&mut txn, e.to_string());
                Err(e)
            }
        }
    }

    /// Force buffered WAL writes to disk
    pub fn flush(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.lock().sync()?;
        }
        Ok(())
    }

    /// Rewrite the WAL as a single transaction holding the current image
    ///
    /// Commits are paused for the duration.
    pub fn checkpoint(&self) -> Result<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };

        let _paused = self.manager.pause_commits();
        let mut wal = wal.lock();

        let txn_id = self.manager.next_txn_id();
        let version = self.tables.version();
        let records = self.tables.entries();
        let mut entries = Vec::with_capacity(records.len() + 2);
        entries.push(WalEntry::BeginTxn {
            txn_id,
            timestamp: chrono::Utc::now().timestamp_micros(),
        });
        for (key, record) in records {
            entries.push(WalEntry::Put {
                txn_id,
                key,
                value: record.value,
                version,
            });
        }
        entries.push(WalEntry::CommitTxn { txn_id, version });

        let before = wal.len();
        *wal = Wal::rewrite(wal.path().to_path_buf(), &entries, self.mode)?;
        info!(
            before_bytes = before,
            after_bytes = wal.len(),
            records = entries.len() - 2,
            "WAL checkpoint complete"
        );
        Ok(())
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("path", &self.path)
            .field("tables", &self.tables)
            .finish()
    }
}
