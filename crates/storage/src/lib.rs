//! Storage layer for FerryDB
//!
//! This crate implements the committed image of the record store:
//! - Key: (Partition, Table, id) addressing with ordered prefix scans
//! - TableStore: BTreeMap-based storage with RwLock
//! - Per-record versions for optimistic validation
//!
//! Durability (WAL) and transactions live in their own crates; this layer
//! only holds what has already committed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod key;
pub mod store;

pub use key::{Key, Partition, Table};
pub use store::{TableStore, VersionedRecord};
