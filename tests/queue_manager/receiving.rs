//! Transactional Receive Tests
//!
//! Receive locks a message for the ambient transaction; commit consumes it
//! into the processed history, rollback makes it visible again unchanged.

use crate::*;
use ferrydb::Error;
use std::thread;
use std::time::Duration;

// =============================================================================
// RECEIVE / ROLLBACK
// =============================================================================

#[test]
fn test_rolled_back_receive_is_visible_again_exactly_once() {
    let f = Fixture::new();
    let qm = f.open("a");
    fill_orders(&f, &qm, &["M2"]);

    let tx = f.coordinator.begin();
    let received = qm.receive(&tx, "orders", None).unwrap().unwrap();
    assert_eq!(received.data, b"M2");
    assert!(qm.peek("orders", None).unwrap().is_none());
    tx.rollback().unwrap();

    let tx = f.coordinator.begin();
    let again = qm.receive(&tx, "orders", None).unwrap().unwrap();
    assert_eq!(again.id, received.id);
    assert_eq!(again.send_attempts, 0);
    assert!(qm.receive(&tx, "orders", None).unwrap().is_none());
    tx.commit().unwrap();

    assert_eq!(qm.get_number_of_messages("orders").unwrap(), 0);
}

#[test]
fn test_committed_receive_moves_to_processed_history() {
    let f = Fixture::new();
    let qm = f.open("a");
    fill_orders(&f, &qm, &["first", "second"]);

    let tx = f.coordinator.begin();
    let m = qm.receive(&tx, "orders", None).unwrap().unwrap();
    assert_eq!(m.data, b"first");
    tx.commit().unwrap();

    let history = qm.get_all_processed_messages("orders").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message.id, m.id);
    let left = qm.get_all_messages("orders", None).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].data, b"second");
}

#[test]
fn test_uncommitted_enqueue_is_invisible() {
    let f = Fixture::new();
    let qm = f.open("a");

    let tx = f.coordinator.begin();
    qm.enqueue_directly_to(&tx, "orders", None, payload("x")).unwrap();
    assert_eq!(qm.get_number_of_messages("orders").unwrap(), 0);
    assert!(qm.peek("orders", None).unwrap().is_none());
    tx.commit().unwrap();

    assert_eq!(qm.get_number_of_messages("orders").unwrap(), 1);
}

#[test]
fn test_enqueue_to_missing_queue() {
    let f = Fixture::new();
    let qm = f.open("a");
    let tx = f.coordinator.begin();
    let err = qm
        .enqueue_directly_to(&tx, "missing", None, payload("x"))
        .unwrap_err();
    assert!(matches!(err, Error::QueueNotFound(_)));
}

// =============================================================================
// PEEK
// =============================================================================

#[test]
fn test_peek_does_not_consume() {
    let f = Fixture::new();
    let qm = f.open("a");
    fill_orders(&f, &qm, &["x"]);

    let peeked = qm.peek("orders", None).unwrap().unwrap();
    assert_eq!(qm.peek("orders", None).unwrap().unwrap().id, peeked.id);
    assert_eq!(qm.peek_by_id("orders", &peeked.id).unwrap().unwrap().data, b"x");
    assert_eq!(qm.get_number_of_messages("orders").unwrap(), 1);
}

// =============================================================================
// SUBQUEUES / MOVE
// =============================================================================

#[test]
fn test_move_to_subqueue_on_commit() {
    let f = Fixture::new();
    let qm = f.open("a");
    fill_orders(&f, &qm, &["x"]);
    let message = qm.peek("orders", None).unwrap().unwrap();

    let tx = f.coordinator.begin();
    qm.move_to(&tx, "errors", &message).unwrap();
    assert!(qm.peek("orders", Some("errors")).unwrap().is_none());
    tx.commit().unwrap();

    assert!(qm.peek("orders", None).unwrap().is_none());
    let moved = qm.peek("orders", Some("errors")).unwrap().unwrap();
    assert_eq!(moved.id, message.id);
    assert_eq!(moved.subqueue.as_deref(), Some("errors"));
    assert_eq!(qm.subqueues("orders").unwrap(), vec!["errors".to_string()]);
}

#[test]
fn test_rolled_back_move_restores_source() {
    let f = Fixture::new();
    let qm = f.open("a");
    fill_orders(&f, &qm, &["x"]);

    let tx = f.coordinator.begin();
    let message = qm.receive(&tx, "orders", None).unwrap().unwrap();
    qm.move_to(&tx, "errors", &message).unwrap();
    tx.rollback().unwrap();

    assert_eq!(qm.peek("orders", None).unwrap().unwrap().id, message.id);
    assert!(qm.peek("orders", Some("errors")).unwrap().is_none());
    assert!(qm.get_all_processed_messages("orders").unwrap().is_empty());
}

#[test]
fn test_enqueue_into_subqueue() {
    let f = Fixture::new();
    let qm = f.open("a");
    let tx = f.coordinator.begin();
    qm.enqueue_directly_to(&tx, "orders", Some("priority"), payload("p"))
        .unwrap();
    tx.commit().unwrap();

    assert!(qm.peek("orders", None).unwrap().is_none());
    assert_eq!(qm.get_all_messages("orders", Some("priority")).unwrap().len(), 1);
    assert_eq!(qm.get_number_of_messages("orders").unwrap(), 1);
}

// =============================================================================
// BLOCKING RECEIVE
// =============================================================================

#[test]
fn test_receive_timeout_wakes_on_commit() {
    let f = Fixture::new();
    let qm = Arc::new(f.open("a"));

    let producer = {
        let qm = Arc::clone(&qm);
        let coordinator = f.coordinator.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let tx = coordinator.begin();
            qm.enqueue_directly_to(&tx, "orders", None, payload("late"))
                .unwrap();
            tx.commit().unwrap();
        })
    };

    let tx = f.coordinator.begin();
    let message = qm
        .receive_timeout(&tx, "orders", None, Duration::from_secs(10))
        .unwrap();
    assert_eq!(message.data, b"late");
    tx.commit().unwrap();
    producer.join().unwrap();
}

#[test]
fn test_receive_timeout_elapses() {
    let f = Fixture::new();
    let qm = f.open("a");
    let tx = f.coordinator.begin();
    let err = qm
        .receive_timeout(&tx, "orders", None, Duration::from_millis(30))
        .unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn test_empty_subqueue_name_is_rejected() {
    let f = Fixture::new();
    let qm = f.open("a");
    fill_orders(&f, &qm, &["a"]);

    let tx = f.coordinator.begin();
    let err = qm.receive(&tx, "orders", Some("")).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    tx.commit().unwrap();

    assert!(matches!(
        qm.peek("orders", Some("")),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        qm.get_all_messages("orders", Some("a/b")),
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(qm.get_number_of_messages("orders").unwrap(), 1);
}
