//! Crash Recovery Tests
//!
//! A crash between prepare and commit must leave each store fully committed
//! or fully rolled back after restart, never a mix, and no recovery marker.

use crate::*;
use ferry_engine::{
    Enlistment, EnlistmentNotification, PreparingEnlistment, SinglePhaseEnlistment,
    SinglePhaseNotification, TransactionContext,
};
use ferrydb::Error;
use uuid::Uuid;

/// Participant that kills a queue manager the moment commit is decided
struct Crash(Arc<QueueManager>);

impl EnlistmentNotification for Crash {
    fn prepare(&self, e: &PreparingEnlistment) {
        e.prepared();
    }
    fn commit(&self, e: &Enlistment) {
        self.0.dispose_rudely();
        e.done();
    }
    fn rollback(&self, e: &Enlistment) {
        e.done();
    }
    fn in_doubt(&self, e: &Enlistment) {
        e.done();
    }
}

impl SinglePhaseNotification for Crash {
    fn single_phase_commit(&self, e: &SinglePhaseEnlistment) {
        e.committed();
    }
}

#[test]
fn test_crash_after_prepare_without_decision_rolls_back() {
    let f = Fixture::new();
    {
        let a = f.open("a");
        let b = f.open("b");
        fill_orders(&f, &b, &["keep me"]);

        let tx = f.coordinator.begin();
        a.send(&tx, &remote_orders(), payload("M1")).unwrap();
        b.receive(&tx, "orders", None).unwrap().unwrap();
        tx.prepare().unwrap();
        tx.abandon();
    }
    assert_eq!(f.inspect("a").markers, 1);
    assert_eq!(f.inspect("b").markers, 1);

    let a = f.open("a");
    let b = f.open("b");
    assert_eq!(a.recovery_report().rolled_back, 1);
    assert!(a.get_messages_currently_sending().unwrap().is_empty());
    let back = b.peek("orders", None).unwrap().unwrap();
    assert_eq!(back.data, b"keep me");
    assert_eq!(back.send_attempts, 0);
    drop((a, b));

    for name in ["a", "b"] {
        let image = f.inspect(name);
        assert_eq!(image.markers, 0);
        assert_eq!(image.pending_transactions, 0);
    }
}

#[test]
fn test_crash_after_commit_decision_commits() {
    let f = Fixture::new();
    {
        let qm = Arc::new(f.open("a"));
        let tx = f.coordinator.begin();
        tx.enlist_durable(Uuid::new_v4(), Arc::new(Crash(Arc::clone(&qm))))
            .unwrap();
        qm.send(&tx, &remote_orders(), payload("M1")).unwrap();
        tx.commit().unwrap();
        assert!(qm.is_disposed());
    }
    let image = f.inspect("a");
    assert_eq!(image.markers, 1);
    assert!(image.outgoing.is_empty());

    let qm = f.open("a");
    assert_eq!(qm.recovery_report().committed, 1);
    let sending = qm.get_messages_currently_sending().unwrap();
    assert_eq!(sending.len(), 1);
    assert_eq!(sending[0].state, OutgoingState::ReadyToSend);
    assert!(f.coordinator.pending_decisions().unwrap().is_empty());
    drop(qm);

    let image = f.inspect("a");
    assert_eq!(image.markers, 0);
    assert_eq!(image.pending_transactions, 0);
}

#[test]
fn test_crash_before_prepare_is_reversed_on_open() {
    let f = Fixture::new();
    {
        let qm = f.open("a");
        let tx = f.coordinator.begin();
        qm.send(&tx, &remote_orders(), payload("M1")).unwrap();
        qm.dispose_rudely();
        // rollback cannot reach the disposed store
        drop(tx);
    }
    assert_eq!(f.inspect("a").pending_transactions, 1);

    let qm = f.open("a");
    assert_eq!(qm.recovery_report().orphans_reversed, 1);
    assert!(qm.get_messages_currently_sending().unwrap().is_empty());
}

#[test]
fn test_open_fails_when_coordinator_is_unknown() {
    let f = Fixture::new();
    {
        let a = f.open("a");
        let b = f.open("b");
        let tx = f.coordinator.begin();
        a.send(&tx, &remote_orders(), payload("M1")).unwrap();
        b.send(&tx, &remote_orders(), payload("M2")).unwrap();
        tx.prepare().unwrap();
        tx.abandon();
    }

    let stranger = LocalCoordinator::ephemeral().unwrap();
    let err = QueueManager::builder()
        .path(f.store_path("a"))
        .coordinator(stranger)
        .open()
        .unwrap_err();
    assert!(matches!(err, Error::Recovery(_)));

    // The right coordinator still resolves it
    let a = f.open("a");
    assert_eq!(a.recovery_report().rolled_back, 1);
}

#[test]
fn test_clean_reopen_reports_nothing() {
    let f = Fixture::new();
    drop(f.open("a"));
    let qm = f.open("a");
    assert_eq!(qm.recovery_report().markers_found, 0);
    assert_eq!(qm.recovery_report().orphans_reversed, 0);
}
