//! Durability layer for FerryDB
//!
//! This crate implements write-ahead logging:
//! - WalEntry types: BeginTxn, Put, Delete, CommitTxn, AbortTxn
//! - Frame encoding/decoding with CRC32 checksums
//! - Durability modes: None, Strict (default), Batched
//! - Replay: rebuild the committed prefix of history after a crash

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encoding;
pub mod mode;
pub mod replay;
pub mod wal;

pub use encoding::{decode_entry, encode_entry};
pub use mode::DurabilityMode;
pub use replay::{CommittedTxn, RecoveryError, RecoveryOptions, RecoveryResult, ReplayOutcome, WalOp, WalReplay};
pub use wal::{Wal, WalEntry, WalError, WalReadResult};
