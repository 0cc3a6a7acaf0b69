//! Property Tests
//!
//! Randomized sequences of committed and rolled-back transactions. Whatever
//! the mix, only committed work survives and no provisional state is left.

use crate::*;
use proptest::prelude::*;

/// One transaction: how many sends, how many local enqueues, and its fate
fn batch() -> impl Strategy<Value = (usize, usize, bool)> {
    (0usize..4, 0usize..4, any::<bool>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn only_committed_work_survives(batches in prop::collection::vec(batch(), 1..8)) {
        let f = Fixture::new();
        let mut sends = 0;
        let mut enqueued = 0;
        {
            let qm = f.open("a");
            for (send_count, enqueue_count, commit) in &batches {
                let tx = f.coordinator.begin();
                for i in 0..*send_count {
                    qm.send(&tx, &remote_orders(), payload(&format!("s{}", i))).unwrap();
                }
                for i in 0..*enqueue_count {
                    qm.enqueue_directly_to(&tx, "orders", None, payload(&format!("e{}", i)))
                        .unwrap();
                }
                if *commit {
                    tx.commit().unwrap();
                    sends += send_count;
                    enqueued += enqueue_count;
                } else {
                    tx.rollback().unwrap();
                }
            }
            prop_assert_eq!(qm.get_messages_currently_sending().unwrap().len(), sends);
            prop_assert_eq!(qm.get_number_of_messages("orders").unwrap(), enqueued);
        }

        let image = f.inspect("a");
        prop_assert_eq!(image.markers, 0);
        prop_assert_eq!(image.pending_transactions, 0);
        prop_assert_eq!(image.outgoing.len(), sends);
        prop_assert!(image.outgoing.iter().all(|s| *s == OutgoingState::ReadyToSend));
    }

    #[test]
    fn rolled_back_receives_restore_the_queue(
        bodies in prop::collection::vec("[a-z]{1,6}", 1..6),
        take in 0usize..6,
    ) {
        let f = Fixture::new();
        let qm = f.open("a");
        let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
        fill_orders(&f, &qm, &refs);

        let tx = f.coordinator.begin();
        let mut received = 0;
        for _ in 0..take {
            if qm.receive(&tx, "orders", None).unwrap().is_some() {
                received += 1;
            }
        }
        prop_assert_eq!(received, take.min(bodies.len()));
        tx.rollback().unwrap();

        let after: Vec<Vec<u8>> = qm
            .get_all_messages("orders", None)
            .unwrap()
            .into_iter()
            .map(|m| m.data)
            .collect();
        let expected: Vec<Vec<u8>> = bodies.iter().map(|b| b.as_bytes().to_vec()).collect();
        prop_assert_eq!(after, expected);
    }
}
