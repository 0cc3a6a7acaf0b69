//! Record keys
//!
//! A [`Key`] addresses one record: `(Partition, Table, id bytes)`. Keys are
//! ordered field by field so a BTreeMap range over `(partition, table,
//! prefix)` visits exactly the records whose id starts with `prefix`, in id
//! order. Record ids are big-endian encodings chosen by the tables layer.

use serde::{Deserialize, Serialize};

/// Isolation partition a record lives in
///
/// Per-queue records (incoming, processed history, subqueue catalog) live in
/// that queue's partition; everything cross-cutting lives in `Global`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Partition {
    /// Cross-queue records
    Global,
    /// Records of one queue
    Queue(String),
}

impl Partition {
    /// Partition of a queue
    pub fn queue(name: impl Into<String>) -> Self {
        Partition::Queue(name.into())
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::Global => write!(f, "global"),
            Partition::Queue(name) => write!(f, "queue:{}", name),
        }
    }
}

/// Logical table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Table {
    /// Store metadata (store id, sequence high-water mark)
    Meta = 0,
    /// Queue catalog
    Queues = 1,
    /// Messages queued to send
    Outgoing = 2,
    /// Messages that left the outgoing table
    OutgoingHistory = 3,
    /// Per-transaction undo log
    Reversals = 4,
    /// Recovery markers of prepared enlistments
    Recovery = 5,
    /// Messages delivered to a queue
    Incoming = 6,
    /// Processed messages
    History = 7,
    /// Subqueue catalog of a queue
    Subqueues = 8,
    /// Coordinator decision log
    Decisions = 9,
}

impl Table {
    /// Whether records of this table belong in a queue partition
    pub fn is_per_queue(&self) -> bool {
        matches!(self, Table::Incoming | Table::History | Table::Subqueues)
    }
}

/// Address of one record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    /// Partition
    pub partition: Partition,
    /// Table
    pub table: Table,
    /// Record id within the table
    pub id: Vec<u8>,
}

impl Key {
    /// Create a key
    pub fn new(partition: Partition, table: Table, id: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            table,
            id: id.into(),
        }
    }

    /// Key in the global partition
    pub fn global(table: Table, id: impl Into<Vec<u8>>) -> Self {
        Self::new(Partition::Global, table, id)
    }

    /// Key in a queue partition
    pub fn in_queue(queue: impl Into<String>, table: Table, id: impl Into<Vec<u8>>) -> Self {
        Self::new(Partition::Queue(queue.into()), table, id)
    }

    /// Check whether this key falls under `(partition, table, prefix)`
    pub fn has_prefix(&self, partition: &Partition, table: Table, prefix: &[u8]) -> bool {
        &self.partition == partition && self.table == table && self.id.starts_with(prefix)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}/", self.partition, self.table)?;
        for b in &self.id {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
