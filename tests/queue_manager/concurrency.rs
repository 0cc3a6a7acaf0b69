//! Concurrency Tests
//!
//! Transactions on disjoint queues never block each other; transactions
//! racing for the same message produce exactly one winner.

use crate::*;
use std::sync::{Barrier, Mutex};
use std::thread;

#[test]
fn test_disjoint_queues_commit_independently() {
    let f = Fixture::new();
    let qm = Arc::new(f.open("a"));
    let queues = ["q0", "q1", "q2", "q3"];
    qm.create_queues(&queues).unwrap();
    let barrier = Arc::new(Barrier::new(queues.len()));

    let handles: Vec<_> = queues
        .iter()
        .map(|queue| {
            let qm = Arc::clone(&qm);
            let coordinator = f.coordinator.clone();
            let barrier = Arc::clone(&barrier);
            let queue = queue.to_string();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..20 {
                    let tx = coordinator.begin();
                    qm.enqueue_directly_to(&tx, &queue, None, payload(&i.to_string()))
                        .unwrap();
                    tx.commit().unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for queue in queues {
        assert_eq!(qm.get_number_of_messages(queue).unwrap(), 20);
    }
}

#[test]
fn test_racing_receivers_have_one_winner() {
    let f = Fixture::new();
    let qm = Arc::new(f.open("a"));
    fill_orders(&f, &qm, &["only one"]);

    let racers = 4;
    let barrier = Arc::new(Barrier::new(racers));
    let winners = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..racers)
        .map(|_| {
            let qm = Arc::clone(&qm);
            let coordinator = f.coordinator.clone();
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                let tx = coordinator.begin();
                barrier.wait();
                match qm.receive(&tx, "orders", None) {
                    Ok(Some(message)) => {
                        tx.commit().unwrap();
                        winners.lock().unwrap().push(message.id);
                    }
                    Ok(None) => {}
                    Err(e) => assert!(e.is_conflict(), "unexpected error: {}", e),
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(winners.lock().unwrap().len(), 1);
    assert_eq!(qm.get_number_of_messages("orders").unwrap(), 0);
    assert_eq!(qm.get_all_processed_messages("orders").unwrap().len(), 1);
}
