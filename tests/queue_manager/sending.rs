//! Transactional Send Tests
//!
//! Messages queued for transmission become visible to the transport only
//! after the ambient transaction commits.

use crate::*;
use ferrydb::{Error, TransactionContext};

#[test]
fn test_committed_send_is_ready_and_leaves_no_marker() {
    let f = Fixture::new();
    let qm = f.open("a");

    let tx = f.coordinator.begin();
    let id = qm.send(&tx, &remote_orders(), payload("M1")).unwrap();
    assert!(qm.get_messages_currently_sending().unwrap().is_empty());
    tx.commit().unwrap();

    let sending = qm.get_messages_currently_sending().unwrap();
    assert_eq!(sending.len(), 1);
    assert_eq!(sending[0].message.id, id);
    assert_eq!(sending[0].state, OutgoingState::ReadyToSend);
    assert_eq!(sending[0].message.queue, "orders");
    drop(qm);

    let image = f.inspect("a");
    assert_eq!(image.markers, 0);
    assert_eq!(image.pending_transactions, 0);
    assert_eq!(image.outgoing, vec![OutgoingState::ReadyToSend]);
}

#[test]
fn test_rolled_back_send_leaves_nothing() {
    let f = Fixture::new();
    let qm = f.open("a");

    let tx = f.coordinator.begin();
    qm.send(&tx, &remote_orders(), payload("M1")).unwrap();
    qm.send(&tx, &remote_orders(), payload("M2")).unwrap();
    tx.rollback().unwrap();

    assert!(qm.get_messages_currently_sending().unwrap().is_empty());
    drop(qm);

    let image = f.inspect("a");
    assert_eq!(image.markers, 0);
    assert_eq!(image.pending_transactions, 0);
    assert!(image.outgoing.is_empty());
}

#[test]
fn test_dropped_transaction_rolls_back() {
    let f = Fixture::new();
    let qm = f.open("a");
    {
        let tx = f.coordinator.begin();
        qm.send(&tx, &remote_orders(), payload("M1")).unwrap();
    }
    assert!(qm.get_messages_currently_sending().unwrap().is_empty());
}

#[test]
fn test_two_stores_commit_through_two_phases() {
    let f = Fixture::new();
    let a = f.open("a");
    let b = f.open("b");

    let tx = f.coordinator.begin();
    let key = tx.key();
    a.send(&tx, &remote_orders(), payload("to remote")).unwrap();
    b.enqueue_directly_to(&tx, "orders", None, payload("local")).unwrap();
    assert_eq!(tx.participant_count(), 2);
    tx.commit().unwrap();

    assert_eq!(a.get_messages_currently_sending().unwrap().len(), 1);
    assert_eq!(b.get_number_of_messages("orders").unwrap(), 1);
    assert!(f.coordinator.decision(key).unwrap().is_none());
    drop((a, b));

    assert_eq!(f.inspect("a").markers, 0);
    assert_eq!(f.inspect("b").markers, 0);
}

#[test]
fn test_send_rejects_bad_queue_name() {
    let f = Fixture::new();
    let qm = f.open("a");
    let tx = f.coordinator.begin();
    let uri = QueueUri::new(ferrydb::Endpoint::new("remote", 2200), "", None);
    let err = qm.send(&tx, &uri, payload("x")).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[test]
fn test_message_ids_stay_unique_across_restarts() {
    let f = Fixture::new();
    let first = {
        let qm = f.open("a");
        let tx = f.coordinator.begin();
        let id = qm.send(&tx, &remote_orders(), payload("1")).unwrap();
        tx.commit().unwrap();
        id
    };

    let qm = f.open("a");
    let tx = f.coordinator.begin();
    let second = qm.send(&tx, &remote_orders(), payload("2")).unwrap();
    tx.commit().unwrap();

    assert_eq!(first.source_instance_id, second.source_instance_id);
    assert!(second.message_identifier > first.message_identifier);
}
