//! When the write-ahead log reaches the disk
//!
//! Only [`DurabilityMode::Strict`] makes every commit durable before it
//! returns. `Batched` leaves a loss window, so callers that must not lose a
//! write (a prepare marker) force a sync themselves. `None` keeps nothing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// WAL sync policy of a store
///
/// In configuration it is a tagged table:
///
/// ```toml
/// [durability]
/// mode = "batched"
/// interval_ms = 50
/// batch_size = 500
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DurabilityMode {
    /// Memory only; nothing is written to disk
    None,

    /// Every commit is fsynced before it returns
    Strict,

    /// Commits are fsynced in groups
    ///
    /// A crash loses at most `batch_size` commits or `interval_ms` of them,
    /// whichever bound is hit first.
    Batched {
        /// Longest gap between syncs
        interval_ms: u64,
        /// Most commits between syncs
        batch_size: usize,
    },
}

impl DurabilityMode {
    /// Whether the store keeps a log at all
    pub fn requires_wal(&self) -> bool {
        !matches!(self, DurabilityMode::None)
    }

    /// Whether every acknowledged commit is on disk when it returns
    pub fn is_crash_safe(&self) -> bool {
        matches!(self, DurabilityMode::Strict)
    }

    /// Decide whether the log must be synced now
    ///
    /// `unsynced` counts commits appended since the last sync.
    pub fn sync_due(&self, unsynced: usize, since_last_sync: Duration) -> bool {
        match *self {
            DurabilityMode::None => false,
            DurabilityMode::Strict => unsynced > 0,
            DurabilityMode::Batched {
                interval_ms,
                batch_size,
            } => {
                unsynced >= batch_size
                    || (unsynced > 0 && since_last_sync >= Duration::from_millis(interval_ms))
            }
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Strict
    }
}
