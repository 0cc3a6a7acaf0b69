//! # FerryDB
//!
//! Durable, transactional point-to-point message queues.
//!
//! A [`QueueManager`] owns a local store of named queues. Messages sent to
//! remote queues wait in the store until a transport confirms delivery;
//! messages arriving for local queues wait until a consumer receives them.
//! Every change joins the caller's ambient distributed transaction and
//! survives crashes: a transaction that prepared before a crash is resolved
//! with its coordinator when the store is opened again.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ferrydb::prelude::*;
//!
//! let coordinator = LocalCoordinator::open("./dtc", DurabilityMode::Strict)?;
//! let qm = QueueManager::builder()
//!     .path("./queues")
//!     .coordinator(coordinator.clone())
//!     .open()?;
//! qm.create_queues(&["orders"])?;
//!
//! // Deliver locally, then consume, each in its own transaction
//! let tx = coordinator.begin();
//! qm.enqueue_directly_to(&tx, "orders", None, MessagePayload::new("order #1"))?;
//! tx.commit()?;
//!
//! let tx = coordinator.begin();
//! let message = qm.receive(&tx, "orders", None)?;
//! tx.commit()?;
//!
//! qm.dispose()?;
//! ```
//!
//! ## Layers
//!
//! - `ferry-core` - identifiers, messages, records, engine errors
//! - `ferry-storage` - ordered in-memory table store
//! - `ferry-durability` - write-ahead log and replay
//! - `ferry-concurrency` - optimistic store transactions
//! - `ferry-engine` - message tables, enlistment, recovery, coordinator

#![warn(missing_docs)]

mod config;
mod error;
mod observer;
mod queue_manager;

pub mod prelude;

pub use config::{HistoryConfig, QueueManagerConfig, DEFAULT_PORT};
pub use error::{Error, Result};
pub use observer::{QueueEvent, QueueObserver};
pub use queue_manager::{QueueManager, QueueManagerBuilder};

// Re-export the types that appear in the public API
pub use ferry_core::{
    Endpoint, HistoryRecord, Message, MessageId, MessagePayload, OutgoingRecord, OutgoingState,
    QueueUri, SentRecord,
};
pub use ferry_durability::DurabilityMode;
pub use ferry_engine::{
    LocalCoordinator, LocalTransaction, PurgeOutcome, RecoveryReport, SendFailure,
    TransactionContext, TransactionCoordinator,
};
