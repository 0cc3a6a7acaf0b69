//! Ambient transaction substrate
//!
//! Queue operations run inside an ambient distributed transaction owned by
//! the caller. This module defines the contract between that transaction and
//! its durable participants, plus [`LocalCoordinator`], an in-process
//! coordinator with a durable decision log.
//!
//! # Protocol
//!
//! ```text
//! one participant:   single_phase_commit
//! several:           prepare(all) -> log Committed -> commit(all)
//! any force_rollback: rollback(all)
//! ```
//!
//! The coordinator presumes abort: a transaction without a logged decision
//! rolled back. A decision is forgotten once every resource manager that
//! prepared acknowledged its commit.

use crate::record_store::RecordStore;
use crate::tables::{decode, encode};
use chrono::{DateTime, Utc};
use ferry_concurrency::Scope;
use ferry_core::{Error, Result};
use ferry_durability::DurabilityMode;
use ferry_storage::{Key, Partition, Table};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Participant contract
// ============================================================================

/// Callbacks a durable participant receives
pub trait EnlistmentNotification: Send + Sync {
    /// Phase one: make the work durable, then vote
    fn prepare(&self, enlistment: &PreparingEnlistment);
    /// Phase two: the transaction committed
    fn commit(&self, enlistment: &Enlistment);
    /// The transaction rolled back
    fn rollback(&self, enlistment: &Enlistment);
    /// The outcome is unknown to the coordinator
    fn in_doubt(&self, enlistment: &Enlistment);
}

/// A participant that can commit in one phase when it is alone
pub trait SinglePhaseNotification: EnlistmentNotification {
    /// Commit without a prepare phase
    fn single_phase_commit(&self, enlistment: &SinglePhaseEnlistment);
}

/// A participant's phase-one vote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vote {
    /// Work is durable; ready to commit
    Prepared,
    /// Cannot prepare; the transaction must roll back
    ForceRollback(String),
}

/// Handle passed to `prepare`
#[derive(Debug)]
pub struct PreparingEnlistment {
    recovery_information: Vec<u8>,
    vote: Mutex<Option<Vote>>,
}

impl PreparingEnlistment {
    /// Create a handle carrying the coordinator's recovery token
    pub fn new(recovery_information: Vec<u8>) -> Self {
        Self {
            recovery_information,
            vote: Mutex::new(None),
        }
    }

    /// Token the participant must persist to be re-enlisted after a crash
    pub fn recovery_information(&self) -> &[u8] {
        &self.recovery_information
    }

    /// Vote to commit
    pub fn prepared(&self) {
        *self.vote.lock() = Some(Vote::Prepared);
    }

    /// Vote to roll back
    pub fn force_rollback(&self, reason: impl Into<String>) {
        *self.vote.lock() = Some(Vote::ForceRollback(reason.into()));
    }

    /// The vote, if one was cast
    pub fn vote(&self) -> Option<Vote> {
        self.vote.lock().clone()
    }
}

/// Handle passed to `commit`, `rollback` and `in_doubt`
#[derive(Debug, Default)]
pub struct Enlistment {
    done: AtomicBool,
}

impl Enlistment {
    /// Fresh handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge the notification
    pub fn done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Whether the participant acknowledged
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Outcome reported through a [`SinglePhaseEnlistment`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinglePhaseOutcome {
    /// Work committed
    Committed,
    /// Work rolled back
    Aborted(String),
}

/// Handle passed to `single_phase_commit`
#[derive(Debug, Default)]
pub struct SinglePhaseEnlistment {
    outcome: Mutex<Option<SinglePhaseOutcome>>,
}

impl SinglePhaseEnlistment {
    /// Fresh handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a successful commit
    pub fn committed(&self) {
        *self.outcome.lock() = Some(SinglePhaseOutcome::Committed);
    }

    /// Report that the work was rolled back instead
    pub fn aborted(&self, reason: impl Into<String>) {
        *self.outcome.lock() = Some(SinglePhaseOutcome::Aborted(reason.into()));
    }

    /// The reported outcome; `None` means the participant never answered
    pub fn outcome(&self) -> Option<SinglePhaseOutcome> {
        self.outcome.lock().clone()
    }
}

// ============================================================================
// Transaction and coordinator capabilities
// ============================================================================

/// The caller's ambient transaction
pub trait TransactionContext: Send + Sync {
    /// Stable identity of the transaction
    fn key(&self) -> Uuid;

    /// Enlist a durable participant on behalf of resource manager `resource_manager_id`
    fn enlist_durable(
        &self,
        resource_manager_id: Uuid,
        participant: Arc<dyn SinglePhaseNotification>,
    ) -> Result<()>;
}

/// Recovery side of the ambient transaction substrate
pub trait TransactionCoordinator: Send + Sync {
    /// Reconstruct the transaction behind `recovery_information` and drive
    /// `participant` to its outcome (commit or rollback)
    fn reenlist(
        &self,
        resource_manager_id: Uuid,
        recovery_information: &[u8],
        participant: Arc<dyn EnlistmentNotification>,
    ) -> Result<()>;

    /// Every marker of `resource_manager_id` was re-enlisted
    fn recovery_complete(&self, resource_manager_id: Uuid) -> Result<()>;
}

// ============================================================================
// LocalCoordinator
// ============================================================================

/// Token a participant persists at prepare time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryToken {
    /// Coordinator that owns the decision
    pub coordinator_id: Uuid,
    /// Transaction the participant prepared for
    pub transaction: Uuid,
}

/// A logged commit decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Transaction
    pub transaction: Uuid,
    /// Resource managers that have not acknowledged the commit yet
    pub pending: Vec<Uuid>,
    /// When the decision was logged
    pub decided_at: DateTime<Utc>,
}

fn decision_key(transaction: Uuid) -> Key {
    Key::global(Table::Decisions, transaction.as_bytes().to_vec())
}

/// In-process coordinator with a durable decision log
pub struct LocalCoordinator {
    log: RecordStore,
}

impl LocalCoordinator {
    /// Open (or create) a coordinator whose decision log lives at `path`
    pub fn open(path: impl AsRef<Path>, mode: DurabilityMode) -> Result<Arc<Self>> {
        let log = RecordStore::open(path, mode)?;
        info!(coordinator_id = %log.id(), "local coordinator opened");
        Ok(Arc::new(Self { log }))
    }

    /// Coordinator whose decisions do not survive the process
    pub fn ephemeral() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            log: RecordStore::ephemeral()?,
        }))
    }

    /// Stable coordinator identity
    pub fn id(&self) -> Uuid {
        self.log.id()
    }

    /// Start a transaction
    pub fn begin(self: &Arc<Self>) -> LocalTransaction {
        let id = Uuid::new_v4();
        debug!(transaction = %id, "begin local transaction");
        LocalTransaction {
            id,
            coordinator: Arc::clone(self),
            participants: Mutex::new(Vec::new()),
            state: Mutex::new(LocalState::Active),
        }
    }

    /// Logged decision for `transaction`
    pub fn decision(&self, transaction: Uuid) -> Result<Option<Decision>> {
        match self.log.tables().get(&decision_key(transaction)) {
            Some(record) => Ok(Some(decode(&record.value)?)),
            None => Ok(None),
        }
    }

    /// Transactions whose commit is not yet acknowledged everywhere
    pub fn pending_decisions(&self) -> Result<Vec<Decision>> {
        self.log
            .tables()
            .scan_prefix(&Partition::Global, Table::Decisions, &[])
            .into_iter()
            .map(|(_, r)| decode(&r.value))
            .collect()
    }

    fn log_commit(&self, transaction: Uuid, pending: Vec<Uuid>) -> Result<()> {
        let decision = Decision {
            transaction,
            pending,
            decided_at: Utc::now(),
        };
        self.log.run_in_transaction(Scope::Global, |txn| {
            txn.put(decision_key(transaction), encode(&decision)?)
        })?;
        self.log.flush()
    }

    /// Record that `resource_manager_id` finished committing `transaction`
    fn acknowledge(&self, transaction: Uuid, resource_manager_id: Uuid) -> Result<()> {
        self.log.run_in_transaction(Scope::Global, |txn| {
            let key = decision_key(transaction);
            let Some(bytes) = txn.get(&key)? else {
                return Ok(());
            };
            let mut decision: Decision = decode(&bytes)?;
            decision.pending.retain(|rm| *rm != resource_manager_id);
            if decision.pending.is_empty() {
                debug!(transaction = %transaction, "forgetting decision");
                txn.delete(key)
            } else {
                txn.put(key, encode(&decision)?)
            }
        })
    }

    fn token(&self, transaction: Uuid) -> Result<Vec<u8>> {
        encode(&RecoveryToken {
            coordinator_id: self.id(),
            transaction,
        })
    }
}

impl TransactionCoordinator for LocalCoordinator {
    fn reenlist(
        &self,
        resource_manager_id: Uuid,
        recovery_information: &[u8],
        participant: Arc<dyn EnlistmentNotification>,
    ) -> Result<()> {
        let token: RecoveryToken = decode(recovery_information)?;
        if token.coordinator_id != self.id() {
            return Err(Error::Recovery(format!(
                "transaction {} belongs to coordinator {}",
                token.transaction, token.coordinator_id
            )));
        }

        let enlistment = Enlistment::new();
        match self.decision(token.transaction)? {
            Some(_) => {
                debug!(transaction = %token.transaction, "re-enlisted: committed");
                participant.commit(&enlistment);
                if enlistment.is_done() {
                    self.acknowledge(token.transaction, resource_manager_id)?;
                }
            }
            None => {
                debug!(transaction = %token.transaction, "re-enlisted: presumed abort");
                participant.rollback(&enlistment);
            }
        }
        Ok(())
    }

    fn recovery_complete(&self, resource_manager_id: Uuid) -> Result<()> {
        debug!(resource_manager = %resource_manager_id, "recovery complete");
        Ok(())
    }
}

impl std::fmt::Debug for LocalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCoordinator")
            .field("id", &self.id())
            .finish()
    }
}

// ============================================================================
// LocalTransaction
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalState {
    Active,
    Prepared,
    Committed,
    RolledBack,
    InDoubt,
    Abandoned,
}

type Participant = (Uuid, Arc<dyn SinglePhaseNotification>);

/// A transaction driven by a [`LocalCoordinator`]
///
/// Dropping an unfinished transaction rolls it back.
pub struct LocalTransaction {
    id: Uuid,
    coordinator: Arc<LocalCoordinator>,
    participants: Mutex<Vec<Participant>>,
    state: Mutex<LocalState>,
}

impl LocalTransaction {
    /// Transaction identity
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of enlisted participants
    pub fn participant_count(&self) -> usize {
        self.participants.lock().len()
    }

    fn participants(&self) -> Vec<Participant> {
        self.participants.lock().clone()
    }

    fn set_state(&self, state: LocalState) {
        *self.state.lock() = state;
    }

    /// Run phase one against every participant
    ///
    /// On a rollback vote (or no vote) every participant is rolled back and
    /// `Error::TransactionAborted` returned.
    pub fn prepare(&self) -> Result<()> {
        let state = *self.state.lock();
        if state != LocalState::Active {
            return Err(Error::InvalidOperation(format!(
                "cannot prepare transaction {} in state {:?}",
                self.id, state
            )));
        }

        let token = self.coordinator.token(self.id)?;
        for (rm, participant) in self.participants() {
            let preparing = PreparingEnlistment::new(token.clone());
            participant.prepare(&preparing);
            let reason = match preparing.vote() {
                Some(Vote::Prepared) => continue,
                Some(Vote::ForceRollback(reason)) => reason,
                None => format!("resource manager {} did not vote", rm),
            };
            warn!(transaction = %self.id, resource_manager = %rm, reason = %reason, "prepare failed");
            self.rollback_all();
            return Err(Error::TransactionAborted(reason));
        }
        self.set_state(LocalState::Prepared);
        Ok(())
    }

    /// Commit the transaction
    ///
    /// A lone participant that has not prepared commits in a single phase.
    /// `Error::InDoubt` means it did not report an outcome.
    pub fn commit(self) -> Result<()> {
        let participants = self.participants();
        let state = *self.state.lock();

        if state == LocalState::Active && participants.len() <= 1 {
            let Some((rm, participant)) = participants.into_iter().next() else {
                self.set_state(LocalState::Committed);
                return Ok(());
            };
            let enlistment = SinglePhaseEnlistment::new();
            participant.single_phase_commit(&enlistment);
            return match enlistment.outcome() {
                Some(SinglePhaseOutcome::Committed) => {
                    self.set_state(LocalState::Committed);
                    Ok(())
                }
                Some(SinglePhaseOutcome::Aborted(reason)) => {
                    self.set_state(LocalState::RolledBack);
                    Err(Error::TransactionAborted(reason))
                }
                None => {
                    self.set_state(LocalState::InDoubt);
                    Err(Error::InDoubt(format!(
                        "resource manager {} did not report a single-phase outcome for {}",
                        rm, self.id
                    )))
                }
            };
        }

        if state == LocalState::Active {
            self.prepare()?;
        } else if state != LocalState::Prepared {
            return Err(Error::InvalidOperation(format!(
                "cannot commit transaction {} in state {:?}",
                self.id, state
            )));
        }

        let rms: Vec<Uuid> = participants.iter().map(|(rm, _)| *rm).collect();
        if let Err(e) = self.coordinator.log_commit(self.id, rms) {
            warn!(transaction = %self.id, error = %e, "could not log commit decision");
            self.rollback_all();
            return Err(Error::TransactionAborted(format!(
                "commit decision not logged: {}",
                e
            )));
        }
        self.set_state(LocalState::Committed);

        for (rm, participant) in participants {
            let enlistment = Enlistment::new();
            participant.commit(&enlistment);
            if enlistment.is_done() {
                if let Err(e) = self.coordinator.acknowledge(self.id, rm) {
                    warn!(transaction = %self.id, error = %e, "could not record acknowledgement");
                }
            } else {
                warn!(transaction = %self.id, resource_manager = %rm, "commit not acknowledged");
            }
        }
        Ok(())
    }

    /// Roll the transaction back
    pub fn rollback(self) -> Result<()> {
        let state = *self.state.lock();
        match state {
            LocalState::Active | LocalState::Prepared => {
                self.rollback_all();
                Ok(())
            }
            other => Err(Error::InvalidOperation(format!(
                "cannot roll back transaction {} in state {:?}",
                self.id, other
            ))),
        }
    }

    /// Drop without notifying anyone, as if the process died here
    pub fn abandon(self) {
        self.set_state(LocalState::Abandoned);
    }

    fn rollback_all(&self) {
        self.set_state(LocalState::RolledBack);
        for (rm, participant) in self.participants() {
            let enlistment = Enlistment::new();
            participant.rollback(&enlistment);
            if !enlistment.is_done() {
                debug!(transaction = %self.id, resource_manager = %rm, "rollback not acknowledged");
            }
        }
    }
}

impl TransactionContext for LocalTransaction {
    fn key(&self) -> Uuid {
        self.id
    }

    fn enlist_durable(
        &self,
        resource_manager_id: Uuid,
        participant: Arc<dyn SinglePhaseNotification>,
    ) -> Result<()> {
        let state = *self.state.lock();
        if state != LocalState::Active {
            return Err(Error::InvalidOperation(format!(
                "cannot enlist in transaction {} in state {:?}",
                self.id, state
            )));
        }
        debug!(transaction = %self.id, resource_manager = %resource_manager_id, "enlisted");
        self.participants
            .lock()
            .push((resource_manager_id, participant));
        Ok(())
    }
}

impl Drop for LocalTransaction {
    fn drop(&mut self) {
        let state = *self.state.lock();
        if matches!(state, LocalState::Active | LocalState::Prepared) {
            debug!(transaction = %self.id, "dropped unfinished transaction, rolling back");
            self.rollback_all();
        }
    }
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .field("participants", &self.participant_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Participant that records what it was told
    #[derive(Default)]
    struct Probe {
        refuse_prepare: bool,
        silent: bool,
        prepares: AtomicUsize,
        commits: AtomicUsize,
        single_phase: AtomicUsize,
        rollbacks: AtomicUsize,
        token: Mutex<Vec<u8>>,
    }

    impl EnlistmentNotification for Probe {
        fn prepare(&self, e: &PreparingEnlistment) {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            *self.token.lock() = e.recovery_information().to_vec();
            if self.refuse_prepare {
                e.force_rollback("refused");
            } else {
                e.prepared();
            }
        }
        fn commit(&self, e: &Enlistment) {
            self.commits.fetch_add(1, Ordering::SeqCst);
            e.done();
        }
        fn rollback(&self, e: &Enlistment) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            e.done();
        }
        fn in_doubt(&self, e: &Enlistment) {
            e.done();
        }
    }

    impl SinglePhaseNotification for Probe {
        fn single_phase_commit(&self, e: &SinglePhaseEnlistment) {
            self.single_phase.fetch_add(1, Ordering::SeqCst);
            if !self.silent {
                e.committed();
            }
        }
    }

    fn count(c: &AtomicUsize) -> usize {
        c.load(Ordering::SeqCst)
    }

    #[test]
    fn test_single_participant_commits_in_one_phase() {
        let coordinator = LocalCoordinator::ephemeral().unwrap();
        let probe = Arc::new(Probe::default());
        let tx = coordinator.begin();
        tx.enlist_durable(Uuid::new_v4(), probe.clone()).unwrap();
        tx.commit().unwrap();

        assert_eq!(count(&probe.single_phase), 1);
        assert_eq!(count(&probe.prepares), 0);
    }

    #[test]
    fn test_silent_single_phase_is_in_doubt() {
        let coordinator = LocalCoordinator::ephemeral().unwrap();
        let probe = Arc::new(Probe {
            silent: true,
            ..Default::default()
        });
        let tx = coordinator.begin();
        tx.enlist_durable(Uuid::new_v4(), probe.clone()).unwrap();
        assert!(matches!(tx.commit(), Err(Error::InDoubt(_))));
        assert_eq!(count(&probe.rollbacks), 0);
    }

    #[test]
    fn test_two_participants_use_two_phases_and_forget_decision() {
        let coordinator = LocalCoordinator::ephemeral().unwrap();
        let a = Arc::new(Probe::default());
        let b = Arc::new(Probe::default());
        let tx = coordinator.begin();
        let id = tx.id();
        tx.enlist_durable(Uuid::new_v4(), a.clone()).unwrap();
        tx.enlist_durable(Uuid::new_v4(), b.clone()).unwrap();
        tx.commit().unwrap();

        for p in [&a, &b] {
            assert_eq!(count(&p.prepares), 1);
            assert_eq!(count(&p.commits), 1);
            assert_eq!(count(&p.single_phase), 0);
        }
        assert!(coordinator.decision(id).unwrap().is_none());

        let token: RecoveryToken = decode(&a.token.lock()).unwrap();
        assert_eq!(token.transaction, id);
        assert_eq!(token.coordinator_id, coordinator.id());
    }

    #[test]
    fn test_force_rollback_rolls_back_everyone() {
        let coordinator = LocalCoordinator::ephemeral().unwrap();
        let ok = Arc::new(Probe::default());
        let refusing = Arc::new(Probe {
            refuse_prepare: true,
            ..Default::default()
        });
        let tx = coordinator.begin();
        tx.enlist_durable(Uuid::new_v4(), ok.clone()).unwrap();
        tx.enlist_durable(Uuid::new_v4(), refusing.clone()).unwrap();

        assert!(matches!(tx.commit(), Err(Error::TransactionAborted(_))));
        assert_eq!(count(&ok.rollbacks), 1);
        assert_eq!(count(&refusing.rollbacks), 1);
        assert_eq!(count(&ok.commits), 0);
    }

    #[test]
    fn test_drop_rolls_back() {
        let coordinator = LocalCoordinator::ephemeral().unwrap();
        let probe = Arc::new(Probe::default());
        {
            let tx = coordinator.begin();
            tx.enlist_durable(Uuid::new_v4(), probe.clone()).unwrap();
        }
        assert_eq!(count(&probe.rollbacks), 1);
    }

    #[test]
    fn test_abandon_notifies_nobody() {
        let coordinator = LocalCoordinator::ephemeral().unwrap();
        let probe = Arc::new(Probe::default());
        let tx = coordinator.begin();
        tx.enlist_durable(Uuid::new_v4(), probe.clone()).unwrap();
        tx.prepare().unwrap();
        tx.abandon();
        assert_eq!(count(&probe.rollbacks), 0);
        assert_eq!(count(&probe.commits), 0);
    }

    #[test]
    fn test_reenlist_follows_logged_decision() {
        let dir = TempDir::new().unwrap();
        let rm = Uuid::new_v4();
        let committed = {
            let coordinator = LocalCoordinator::open(dir.path(), DurabilityMode::Strict).unwrap();
            coordinator.log_commit(Uuid::new_v4(), vec![rm]).unwrap();
            coordinator.pending_decisions().unwrap()[0].transaction
        };

        let coordinator = LocalCoordinator::open(dir.path(), DurabilityMode::Strict).unwrap();
        let probe = Arc::new(Probe::default());
        let token = coordinator.token(committed).unwrap();
        coordinator.reenlist(rm, &token, probe.clone()).unwrap();
        assert_eq!(count(&probe.commits), 1);
        assert!(coordinator.decision(committed).unwrap().is_none());

        let unknown = coordinator.token(Uuid::new_v4()).unwrap();
        coordinator.reenlist(rm, &unknown, probe.clone()).unwrap();
        assert_eq!(count(&probe.rollbacks), 1);
    }

    #[test]
    fn test_reenlist_rejects_foreign_token() {
        let ours = LocalCoordinator::ephemeral().unwrap();
        let theirs = LocalCoordinator::ephemeral().unwrap();
        let token = theirs.token(Uuid::new_v4()).unwrap();
        let err = ours
            .reenlist(Uuid::new_v4(), &token, Arc::new(Probe::default()))
            .unwrap_err();
        assert!(matches!(err, Error::Recovery(_)));
    }

    #[test]
    fn test_enlist_after_prepare_is_rejected() {
        let coordinator = LocalCoordinator::ephemeral().unwrap();
        let tx = coordinator.begin();
        tx.prepare().unwrap();
        assert!(tx
            .enlist_durable(Uuid::new_v4(), Arc::new(Probe::default()))
            .is_err());
    }
}
