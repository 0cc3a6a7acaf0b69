//! Storage and enlistment engine for FerryDB
//!
//! Layers, bottom-up:
//! - [`RecordStore`]: WAL-backed table store with serializable transactions
//! - [`SequenceAllocator`]: durable monotonic sequences
//! - [`QueueStorage`] / [`Actions`]: the message state tables
//! - [`TransactionEnlistment`]: durable participant in an ambient transaction
//! - [`recover`]: resolves interrupted enlistments at startup
//!
//! [`coordinator`] defines the ambient transaction contract and ships
//! [`LocalCoordinator`], an in-process coordinator with a durable decision log.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod enlistment;
pub mod record_store;
pub mod recovery;
pub mod sequence;
pub mod tables;

pub use coordinator::{
    Decision, Enlistment, EnlistmentNotification, LocalCoordinator, LocalTransaction,
    PreparingEnlistment, RecoveryToken, SinglePhaseEnlistment, SinglePhaseNotification,
    SinglePhaseOutcome, TransactionContext, TransactionCoordinator, Vote,
};
pub use enlistment::{
    AssertNotDisposed, EnlistmentOutcome, EnlistmentState, OnComplete, TransactionEnlistment,
};
pub use record_store::RecordStore;
pub use recovery::{recover, RecoveryReport};
pub use sequence::{SequenceAllocator, SEQUENCE_BLOCK};
pub use tables::{
    retry_delay, Actions, HistoryRetention, PurgeOutcome, QueueStorage, SendFailure,
};
