//! Lifecycle Tests
//!
//! Configuration, disposal, history retention and log compaction.

use crate::*;
use ferrydb::{HistoryConfig, QueueManagerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_open_from_toml_config() {
    let f = Fixture::new();
    let file = f.dir.path().join("ferry.toml");
    std::fs::write(
        &file,
        format!(
            "path = {:?}\nmax_send_attempts = 7\n\n[endpoint]\nhost = \"node-1\"\nport = 2301\n",
            f.store_path("a")
        ),
    )
    .unwrap();

    let config = QueueManagerConfig::from_file(&file).unwrap();
    let qm = QueueManager::open(config, f.coordinator.clone()).unwrap();
    assert_eq!(qm.endpoint().host, "node-1");
    assert_eq!(qm.config().max_send_attempts, 7);
    assert_eq!(qm.path(), Some(f.store_path("a").as_path()));
}

#[test]
fn test_queues_survive_reopen() {
    let f = Fixture::new();
    {
        let qm = f.open("a");
        qm.create_queues(&["audit", "orders"]).unwrap();
    }
    let qm = f.open("a");
    assert_eq!(
        qm.queues().unwrap(),
        vec!["audit".to_string(), "orders".to_string()]
    );
}

#[test]
fn test_dispose_waits_for_in_flight_transaction() {
    let f = Fixture::new();
    let qm = Arc::new(f.open("a"));
    let committed = Arc::new(AtomicBool::new(false));

    let tx = f.coordinator.begin();
    qm.send(&tx, &remote_orders(), payload("late")).unwrap();
    let worker = {
        let committed = Arc::clone(&committed);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            tx.commit().unwrap();
            committed.store(true, Ordering::SeqCst);
        })
    };

    qm.dispose().unwrap();
    worker.join().unwrap();
    assert!(committed.load(Ordering::SeqCst));
    drop(qm);

    let image = f.inspect("a");
    assert_eq!(image.outgoing, vec![OutgoingState::ReadyToSend]);
    assert_eq!(image.markers, 0);
}

#[test]
fn test_purge_history_without_processed_history() {
    let f = Fixture::new();
    let qm = QueueManager::builder()
        .path(f.store_path("a"))
        .history(HistoryConfig {
            enable_processed_message_history: false,
            ..Default::default()
        })
        .coordinator(f.coordinator.clone())
        .open()
        .unwrap();
    qm.create_queues(&["orders"]).unwrap();
    fill_orders(&f, &qm, &["a", "b"]);

    let tx = f.coordinator.begin();
    qm.receive(&tx, "orders", None).unwrap();
    qm.receive(&tx, "orders", None).unwrap();
    tx.commit().unwrap();
    assert_eq!(qm.get_all_processed_messages("orders").unwrap().len(), 2);

    let purged = qm.purge_history().unwrap();
    assert_eq!(purged.processed, 2);
    assert!(qm.get_all_processed_messages("orders").unwrap().is_empty());
}

#[test]
fn test_purge_history_keeps_recent_entries() {
    let f = Fixture::new();
    let qm = f.open("a");
    fill_orders(&f, &qm, &["a"]);
    let tx = f.coordinator.begin();
    qm.receive(&tx, "orders", None).unwrap();
    tx.commit().unwrap();

    let purged = qm.purge_history().unwrap();
    assert_eq!(purged.processed, 0);
    assert_eq!(qm.get_all_processed_messages("orders").unwrap().len(), 1);
}

#[test]
fn test_purge_history_with_maximum_ages() {
    let f = Fixture::new();
    let qm = QueueManager::builder()
        .path(f.store_path("a"))
        .history(HistoryConfig {
            number_of_messages_to_keep_in_processed_history: 0,
            oldest_message_in_processed_history_secs: u64::MAX,
            oldest_message_in_outgoing_history_secs: u64::MAX,
            ..Default::default()
        })
        .coordinator(f.coordinator.clone())
        .open()
        .unwrap();
    qm.create_queues(&["orders"]).unwrap();
    fill_orders(&f, &qm, &["a"]);
    let tx = f.coordinator.begin();
    qm.receive(&tx, "orders", None).unwrap();
    tx.commit().unwrap();

    let purged = qm.purge_history().unwrap();
    assert_eq!(purged.processed, 0);
    assert_eq!(qm.get_all_processed_messages("orders").unwrap().len(), 1);
}

#[test]
fn test_checkpoint_then_reopen() {
    let f = Fixture::new();
    {
        let qm = f.open("a");
        fill_orders(&f, &qm, &["a", "b"]);
        let tx = f.coordinator.begin();
        qm.receive(&tx, "orders", None).unwrap();
        tx.commit().unwrap();
        qm.checkpoint().unwrap();
        fill_orders(&f, &qm, &["c"]);
    }
    let qm = f.open("a");
    let bodies: Vec<Vec<u8>> = qm
        .get_all_messages("orders", None)
        .unwrap()
        .into_iter()
        .map(|m| m.data)
        .collect();
    assert_eq!(bodies, vec![b"b".to_vec(), b"c".to_vec()]);
    assert_eq!(qm.get_all_processed_messages("orders").unwrap().len(), 1);
}

#[test]
fn test_ephemeral_queue_manager() {
    init_tracing();
    let coordinator = LocalCoordinator::ephemeral().unwrap();
    let qm = QueueManager::ephemeral(coordinator.clone()).unwrap();
    assert!(qm.path().is_none());
    qm.create_queues(&["orders"]).unwrap();

    let tx = coordinator.begin();
    qm.enqueue_directly_to(&tx, "orders", None, payload("x")).unwrap();
    tx.commit().unwrap();
    assert_eq!(qm.get_number_of_messages("orders").unwrap(), 1);
}
