//! Core types for FerryDB
//!
//! This crate defines the vocabulary shared by every layer:
//! - Identifiers: [`TransactionId`], [`MessageId`], [`Endpoint`], [`QueueUri`]
//! - Messages and the records holding them in each table
//! - The engine-wide [`Error`] type

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{
    HistoryRecord, IncomingRecord, IncomingState, Message, MessagePayload, MoveRecord,
    OutgoingRecord, OutgoingState, RecoveryMarker, Reversal, SentRecord,
};
pub use types::{validate_name, EnlistmentId, Endpoint, MessageId, QueueUri, TransactionId};
