//! Transport-side Tests
//!
//! The transport takes committed messages (`InFlight`), then confirms them
//! (`Sent`, outgoing history) or reports the endpoint unreachable (retry with
//! backoff, `Failed` once attempts run out).

use crate::*;
use ferrydb::{Endpoint, QueueEvent};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

fn send_committed(f: &Fixture, qm: &QueueManager, bodies: &[&str]) {
    let tx = f.coordinator.begin();
    for body in bodies {
        qm.send(&tx, &remote_orders(), payload(body)).unwrap();
    }
    tx.commit().unwrap();
}

#[test]
fn test_take_then_mark_sent() {
    let f = Fixture::new();
    let qm = f.open("a");
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    qm.subscribe(Arc::new(move |e: &QueueEvent| sink.lock().unwrap().push(e.clone())));

    send_committed(&f, &qm, &["a", "b"]);
    let taken = qm.take_messages_to_send(10).unwrap();
    assert_eq!(taken.len(), 2);
    assert!(taken.iter().all(|r| r.state == OutgoingState::InFlight));
    assert!(qm.take_messages_to_send(10).unwrap().is_empty());

    let ids: Vec<_> = taken.iter().map(|r| r.message.id).collect();
    assert_eq!(qm.mark_sent(&ids).unwrap(), 2);
    assert!(qm.get_messages_currently_sending().unwrap().is_empty());

    let history = qm.get_all_sent_messages().unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.state == OutgoingState::Sent));

    let events = events.lock().unwrap();
    let queued = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::MessageQueuedForSend { .. }))
        .count();
    let sent = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::MessageSent { .. }))
        .count();
    assert_eq!((queued, sent), (2, 2));
}

#[test]
fn test_take_respects_limit() {
    let f = Fixture::new();
    let qm = f.open("a");
    send_committed(&f, &qm, &["a", "b", "c"]);
    assert_eq!(qm.take_messages_to_send(2).unwrap().len(), 2);
    assert_eq!(qm.take_messages_to_send(2).unwrap().len(), 1);
}

#[test]
fn test_failure_reschedules_with_backoff() {
    let f = Fixture::new();
    let qm = f.open("a");
    send_committed(&f, &qm, &["a"]);
    qm.take_messages_to_send(10).unwrap();

    let failure = qm.failed_to_send_to(&Endpoint::new("remote", 2200)).unwrap();
    assert_eq!(failure.rescheduled, 1);
    assert!(failure.failed.is_empty());

    let sending = qm.get_messages_currently_sending().unwrap();
    assert_eq!(sending[0].state, OutgoingState::ReadyToSend);
    assert_eq!(sending[0].message.send_attempts, 1);
    // Not due for another second
    assert!(qm.take_messages_to_send(10).unwrap().is_empty());
}

#[test]
fn test_failure_of_other_endpoint_is_ignored() {
    let f = Fixture::new();
    let qm = f.open("a");
    send_committed(&f, &qm, &["a"]);
    qm.take_messages_to_send(10).unwrap();

    let failure = qm.failed_to_send_to(&Endpoint::new("elsewhere", 2200)).unwrap();
    assert_eq!(failure.rescheduled, 0);
    assert_eq!(
        qm.get_messages_currently_sending().unwrap()[0].state,
        OutgoingState::InFlight
    );
}

#[test]
fn test_message_fails_after_max_attempts() {
    let f = Fixture::new();
    let qm = QueueManager::builder()
        .path(f.store_path("a"))
        .max_send_attempts(1)
        .coordinator(f.coordinator.clone())
        .open()
        .unwrap();
    send_committed(&f, &qm, &["doomed"]);
    qm.take_messages_to_send(10).unwrap();

    let failure = qm.failed_to_send_to(&Endpoint::new("remote", 2200)).unwrap();
    assert_eq!(failure.failed.len(), 1);
    assert!(qm.get_messages_currently_sending().unwrap().is_empty());
    let history = qm.get_all_sent_messages().unwrap();
    assert_eq!(history[0].state, OutgoingState::Failed);
}

#[test]
fn test_wait_for_all_messages_to_be_sent() {
    let f = Fixture::new();
    let qm = Arc::new(f.open("a"));
    qm.wait_for_all_messages_to_be_sent(Duration::from_millis(10))
        .unwrap();

    send_committed(&f, &qm, &["a"]);
    let err = qm
        .wait_for_all_messages_to_be_sent(Duration::from_millis(30))
        .unwrap_err();
    assert!(err.is_timeout());

    let transport = {
        let qm = Arc::clone(&qm);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let taken = qm.take_messages_to_send(10).unwrap();
            let ids: Vec<_> = taken.iter().map(|r| r.message.id).collect();
            qm.mark_sent(&ids).unwrap();
        })
    };
    qm.wait_for_all_messages_to_be_sent(Duration::from_secs(10))
        .unwrap();
    transport.join().unwrap();
}
