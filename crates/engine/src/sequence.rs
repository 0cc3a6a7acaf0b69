//! Monotonic sequence allocation
//!
//! Sequences number messages, arrivals, reversals and history entries. They
//! are handed out from blocks reserved durably in the meta table, so a
//! restart resumes above every value ever issued without a WAL write per
//! allocation.

use crate::record_store::RecordStore;
use ferry_concurrency::Scope;
use ferry_core::{Error, Result};
use ferry_storage::{Key, Table};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Values reserved per meta-table write
pub const SEQUENCE_BLOCK: u64 = 1024;

/// Meta record holding the highest reserved value
pub(crate) const SEQUENCE_HI_KEY: &[u8] = b"sequence_hi";

#[derive(Debug)]
struct Block {
    next: u64,
    /// Last value of the current block (inclusive)
    last: u64,
}

/// Hi-lo sequence allocator over a [`RecordStore`]
pub struct SequenceAllocator {
    store: Arc<RecordStore>,
    block: Mutex<Block>,
}

impl SequenceAllocator {
    /// Create an allocator; the first call reserves a block
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            store,
            block: Mutex::new(Block { next: 1, last: 0 }),
        }
    }

    /// Next value, strictly greater than every value issued before
    pub fn next(&self) -> Result<u64> {
        let mut block = self.block.lock();
        if block.next > block.last {
            let hi = self.reserve()?;
            block.next = hi + 1;
            block.last = hi + SEQUENCE_BLOCK;
        }
        let value = block.next;
        block.next += 1;
        Ok(value)
    }

    /// Persist `hi + SEQUENCE_BLOCK` and return the previous `hi`
    fn reserve(&self) -> Result<u64> {
        self.store.run_in_transaction(Scope::Global, |txn| {
            let key = Key::global(Table::Meta, SEQUENCE_HI_KEY);
            let hi = match txn.get(&key)? {
                Some(bytes) => {
                    let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                        Error::Corruption(format!("sequence high-water mark of {} bytes", bytes.len()))
                    })?;
                    u64::from_be_bytes(raw)
                }
                None => 0,
            };
            let new_hi = hi + SEQUENCE_BLOCK;
            txn.put(key, new_hi.to_be_bytes().to_vec())?;
            debug!(hi = new_hi, "reserved sequence block");
            Ok(hi)
        })
    }
}

impl std::fmt::Debug for SequenceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAllocator")
            .field("block", &*self.block.lock())
            .finish()
    }
}
