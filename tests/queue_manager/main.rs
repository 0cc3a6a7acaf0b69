//! Queue Manager Integration Tests
//!
//! End-to-end behavior of the queue manager against durable stores and a
//! durable local coordinator: transactional send and receive, two-phase
//! commit across stores, crash recovery, contention, and the transport side.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test queue_manager
//!
//! # Recovery scenarios only
//! cargo test --test queue_manager recovery::
//! ```

use ferry_engine::{QueueStorage, RecordStore};
use ferrydb::{
    DurabilityMode, LocalCoordinator, MessagePayload, OutgoingState, QueueManager, QueueUri,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

// Test modules
mod concurrency;
mod lifecycle;
mod properties;
mod receiving;
mod recovery;
mod sending;
mod transport;

// =============================================================================
// SHARED TEST UTILITIES
// =============================================================================

/// Install a test-writer subscriber once per process
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

/// A temp directory holding a durable coordinator and any number of stores
pub struct Fixture {
    pub dir: TempDir,
    pub coordinator: Arc<LocalCoordinator>,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let coordinator =
            LocalCoordinator::open(dir.path().join("dtc"), DurabilityMode::Strict).unwrap();
        Self { dir, coordinator }
    }

    pub fn store_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Open (or reopen) store `name` with queue "orders"
    pub fn open(&self, name: &str) -> QueueManager {
        let qm = QueueManager::builder()
            .path(self.store_path(name))
            .coordinator(self.coordinator.clone())
            .open()
            .unwrap();
        qm.create_queues(&["orders"]).unwrap();
        qm
    }

    /// Read the raw tables of a closed store
    pub fn inspect(&self, name: &str) -> StoreImage {
        let store = RecordStore::open(self.store_path(name), DurabilityMode::Strict).unwrap();
        let storage = QueueStorage::new(Arc::new(store));
        storage
            .global(|a| {
                Ok(StoreImage {
                    markers: a.recovery_information()?.len(),
                    pending_transactions: a.pending_transactions()?.len(),
                    outgoing: a
                        .messages_currently_sending()?
                        .into_iter()
                        .map(|r| r.state)
                        .collect(),
                })
            })
            .unwrap()
    }
}

/// What a closed store holds
#[derive(Debug)]
pub struct StoreImage {
    pub markers: usize,
    pub pending_transactions: usize,
    pub outgoing: Vec<OutgoingState>,
}

pub fn remote_orders() -> QueueUri {
    QueueUri::parse("ferry://remote:2200/orders").unwrap()
}

pub fn payload(body: &str) -> MessagePayload {
    MessagePayload::new(body.as_bytes().to_vec())
}

/// Put `bodies` on local queue "orders" in one committed transaction
pub fn fill_orders(fixture: &Fixture, qm: &QueueManager, bodies: &[&str]) {
    let tx = fixture.coordinator.begin();
    for body in bodies {
        qm.enqueue_directly_to(&tx, "orders", None, payload(body))
            .unwrap();
    }
    tx.commit().unwrap();
}
