//! Transaction enlistment
//!
//! A [`TransactionEnlistment`] binds one ambient transaction to the records
//! filed under its [`TransactionId`]. It is the durable participant the
//! ambient coordinator drives through prepare, commit, single-phase commit,
//! rollback and in-doubt.
//!
//! ```text
//! Created --prepare--> Prepared --commit--> Committed
//!    |                    |
//!    +------rollback------+--------------> RolledBack
//!    +--single_phase_commit--------------> Committed
//! ```
//!
//! A terminal step that fails leaves the enlistment `Failed` with its
//! recovery marker on disk; the next start resolves it. Terminal steps never
//! report errors to the coordinator and always fire the completion hook.

use crate::coordinator::{
    Enlistment, EnlistmentNotification, PreparingEnlistment, SinglePhaseEnlistment,
    SinglePhaseNotification,
};
use crate::tables::QueueStorage;
use ferry_core::{EnlistmentId, Result, TransactionId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Enlistment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistmentState {
    /// Work is being recorded
    Created,
    /// Recovery marker written, vote cast
    Prepared,
    /// Work finalized, marker removed
    Committed,
    /// Work reversed, marker removed
    RolledBack,
    /// A terminal step failed; recovery will finish it
    Failed,
}

/// What the completion hook is told
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistmentOutcome {
    /// Committed durably
    Committed,
    /// Rolled back durably
    RolledBack,
    /// The terminal step failed
    Failed,
    /// The coordinator lost track of the outcome
    InDoubt,
}

/// Completion hook: `(enlistment id, outcome)`
pub type OnComplete = Box<dyn Fn(EnlistmentId, EnlistmentOutcome) + Send + Sync>;

/// Disposal check run before touching the store
pub type AssertNotDisposed = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Durable participant for one ambient transaction
pub struct TransactionEnlistment {
    id: EnlistmentId,
    storage: Arc<QueueStorage>,
    on_complete: OnComplete,
    assert_not_disposed: AssertNotDisposed,
    state: Mutex<EnlistmentState>,
}

/// Fires the completion hook when dropped, whichever way the step exits
struct CompletionGuard<'a> {
    enlistment: &'a TransactionEnlistment,
    outcome: EnlistmentOutcome,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        (self.enlistment.on_complete)(self.enlistment.id, self.outcome);
    }
}

impl TransactionEnlistment {
    /// New enlistment with a fresh id
    pub fn new(
        storage: Arc<QueueStorage>,
        on_complete: OnComplete,
        assert_not_disposed: AssertNotDisposed,
    ) -> Self {
        let id = TransactionId::new();
        debug!(enlistment_id = %id, "created enlistment");
        Self {
            id,
            storage,
            on_complete,
            assert_not_disposed,
            state: Mutex::new(EnlistmentState::Created),
        }
    }

    /// Enlistment rebuilt from a recovery marker
    pub fn recovered(storage: Arc<QueueStorage>, id: EnlistmentId) -> Self {
        Self {
            id,
            storage,
            on_complete: Box::new(|_, _| {}),
            assert_not_disposed: Box::new(|| Ok(())),
            state: Mutex::new(EnlistmentState::Prepared),
        }
    }

    /// Id every record of this enlistment is filed under
    pub fn id(&self) -> EnlistmentId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> EnlistmentState {
        *self.state.lock()
    }

    fn set_state(&self, state: EnlistmentState) {
        *self.state.lock() = state;
    }

    fn guard(&self) -> CompletionGuard<'_> {
        CompletionGuard {
            enlistment: self,
            outcome: EnlistmentOutcome::Failed,
        }
    }

    fn perform_commit(&self) -> Result<()> {
        (self.assert_not_disposed)()?;
        debug!(enlistment_id = %self.id, "committing enlistment");
        let id = self.id;
        self.storage.global(|actions| {
            actions.remove_reversals_and_finish_moves(id)?;
            actions.mark_ready_to_send(id)?;
            actions.delete_recovery_information(id)?;
            Ok(())
        })?;
        self.set_state(EnlistmentState::Committed);
        debug!(enlistment_id = %self.id, "committed enlistment");
        Ok(())
    }

    /// The prepared vote must follow a marker that is on disk
    fn sync_marker(&self) -> Result<()> {
        let store = self.storage.store();
        if store.durability_mode().is_crash_safe() {
            return Ok(());
        }
        store.flush()
    }

    fn perform_rollback(&self) -> Result<()> {
        (self.assert_not_disposed)()?;
        debug!(enlistment_id = %self.id, "rolling back enlistment");
        let id = self.id;
        self.storage.global(|actions| {
            actions.reverse_all_from(id)?;
            actions.delete_message_to_send(id)?;
            actions.delete_recovery_information(id)?;
            Ok(())
        })?;
        self.set_state(EnlistmentState::RolledBack);
        debug!(enlistment_id = %self.id, "rolled back enlistment");
        Ok(())
    }
}

impl EnlistmentNotification for TransactionEnlistment {
    fn prepare(&self, preparing: &PreparingEnlistment) {
        if let Err(e) = (self.assert_not_disposed)() {
            warn!(enlistment_id = %self.id, error = %e, "cannot prepare enlistment");
            preparing.force_rollback(e.to_string());
            return;
        }

        debug!(enlistment_id = %self.id, "preparing enlistment");
        let id = self.id;
        let information = preparing.recovery_information().to_vec();
        let written = self
            .storage
            .global(|actions| actions.register_recovery_information(id, &information))
            .and_then(|()| self.sync_marker());
        match written {
            Ok(()) => {
                self.set_state(EnlistmentState::Prepared);
                preparing.prepared();
                debug!(enlistment_id = %self.id, "prepared enlistment");
            }
            Err(e) => {
                warn!(enlistment_id = %self.id, error = %e, "failed to write recovery marker");
                preparing.force_rollback(e.to_string());
            }
        }
    }

    fn commit(&self, enlistment: &Enlistment) {
        let mut guard = self.guard();
        match self.perform_commit() {
            Ok(()) => {
                guard.outcome = EnlistmentOutcome::Committed;
                enlistment.done();
            }
            Err(e) => {
                self.set_state(EnlistmentState::Failed);
                warn!(enlistment_id = %self.id, error = %e, "failed to commit enlistment");
            }
        }
    }

    fn rollback(&self, enlistment: &Enlistment) {
        let mut guard = self.guard();
        match self.perform_rollback() {
            Ok(()) => {
                guard.outcome = EnlistmentOutcome::RolledBack;
                enlistment.done();
            }
            Err(e) => {
                self.set_state(EnlistmentState::Failed);
                warn!(enlistment_id = %self.id, error = %e, "failed to roll back enlistment");
            }
        }
    }

    /// Acknowledged without touching the store
    ///
    /// The recovery marker, if one was written, settles the outcome at the
    /// next start.
    fn in_doubt(&self, enlistment: &Enlistment) {
        let _guard = CompletionGuard {
            enlistment: self,
            outcome: EnlistmentOutcome::InDoubt,
        };
        let marker = self.storage.has_recovery_marker(self.id);
        warn!(
            enlistment_id = %self.id,
            marker_present = marker,
            "enlistment in doubt, leaving it to recovery"
        );
        enlistment.done();
    }
}

impl SinglePhaseNotification for TransactionEnlistment {
    fn single_phase_commit(&self, enlistment: &SinglePhaseEnlistment) {
        let mut guard = self.guard();
        match self.perform_commit() {
            Ok(()) => {
                guard.outcome = EnlistmentOutcome::Committed;
                enlistment.committed();
            }
            Err(e) => {
                self.set_state(EnlistmentState::Failed);
                warn!(enlistment_id = %self.id, error = %e, "failed to commit enlistment");
            }
        }
    }
}

impl std::fmt::Debug for TransactionEnlistment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEnlistment")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
