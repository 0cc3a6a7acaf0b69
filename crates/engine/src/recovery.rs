//! Startup recovery of interrupted enlistments
//!
//! ## Recovery Sequence
//!
//! 1. Enumerate every recovery marker (enlistments that prepared and never
//!    finished)
//! 2. Re-enlist each one with the coordinator, which drives it to the logged
//!    outcome: commit when a commit decision exists, rollback otherwise
//! 3. Tell the coordinator recovery is complete
//! 4. Fail if any marker survived: the store must not open with doubt left
//! 5. Reverse orphans: provisional records whose transaction never prepared
//!    (presumed abort)
//!
//! Each marker stays on disk until its enlistment's terminal step commits, so
//! a crash during recovery is itself recovered at the next start.

use crate::coordinator::TransactionCoordinator;
use crate::enlistment::{EnlistmentState, TransactionEnlistment};
use crate::tables::QueueStorage;
use ferry_core::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Markers found at start
    pub markers_found: usize,
    /// Enlistments driven to commit
    pub committed: usize,
    /// Enlistments driven to rollback
    pub rolled_back: usize,
    /// Transactions without a marker whose provisional records were reversed
    pub orphans_reversed: usize,
    /// Wall time
    pub elapsed: Duration,
}

impl RecoveryReport {
    /// Get human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Queue recovery complete: {} markers, {} committed, {} rolled back, {} orphans reversed, {:.2}ms",
            self.markers_found,
            self.committed,
            self.rolled_back,
            self.orphans_reversed,
            self.elapsed.as_secs_f64() * 1000.0,
        )
    }

    /// True when there was nothing to recover
    pub fn is_clean(&self) -> bool {
        self.markers_found == 0 && self.orphans_reversed == 0
    }
}

/// Resolve every in-doubt enlistment of `storage`
///
/// Must complete before the store accepts new transactions.
pub fn recover(
    storage: &Arc<QueueStorage>,
    coordinator: &dyn TransactionCoordinator,
) -> Result<RecoveryReport> {
    let start = Instant::now();
    let rm = storage.id();
    let mut report = RecoveryReport::default();

    let markers = storage.global(|a| a.recovery_information())?;
    report.markers_found = markers.len();

    for marker in markers {
        let enlistment = Arc::new(TransactionEnlistment::recovered(
            Arc::clone(storage),
            marker.enlistment_id,
        ));
        coordinator.reenlist(rm, &marker.information, enlistment.clone())?;
        match enlistment.state() {
            EnlistmentState::Committed => report.committed += 1,
            EnlistmentState::RolledBack => report.rolled_back += 1,
            other => warn!(
                enlistment_id = %marker.enlistment_id,
                state = ?other,
                "enlistment not resolved by re-enlistment"
            ),
        }
    }
    coordinator.recovery_complete(rm)?;

    let remaining = storage.global(|a| a.recovery_information())?;
    if !remaining.is_empty() {
        return Err(Error::Recovery(format!(
            "{} enlistments still in doubt after recovery",
            remaining.len()
        )));
    }

    for tx in storage.global(|a| a.pending_transactions())? {
        storage.global(|a| {
            a.reverse_all_from(tx)?;
            a.delete_message_to_send(tx)?;
            Ok(())
        })?;
        report.orphans_reversed += 1;
    }

    report.elapsed = start.elapsed();
    info!("{}", report.summary());
    Ok(report)
}
