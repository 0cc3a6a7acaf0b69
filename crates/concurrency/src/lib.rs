//! Concurrency layer for FerryDB
//!
//! This crate implements optimistic concurrency control (OCC) with:
//! - StoreTransaction: read/write set tracking, read-your-writes, scopes
//! - Conflict detection at commit time (first committer wins)
//! - TransactionManager: serialized validate → WAL → apply commits

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;
pub mod transaction;

pub use manager::TransactionManager;
pub use transaction::{CommitError, Scope, StoreTransaction, TransactionStatus};
