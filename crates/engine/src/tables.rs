//! Message state tables
//!
//! Logical tables layered on the [`RecordStore`]:
//!
//! | Table | Partition | Key | Value |
//! |-------|-----------|-----|-------|
//! | Queues | global | name | creation time |
//! | Outgoing | global | tx ++ message id | [`OutgoingRecord`] |
//! | OutgoingHistory | global | sequence | [`SentRecord`] |
//! | Reversals | global | tx ++ sequence | [`Reversal`] |
//! | Recovery | global | enlistment id | [`RecoveryMarker`] |
//! | Incoming | queue | subqueue ++ 0x00 ++ arrival | [`IncomingRecord`] |
//! | History | queue | sequence | [`HistoryRecord`] |
//! | Subqueues | queue | name | empty |
//!
//! All access goes through [`Actions`], which wraps one store transaction.
//! Every mutation made on behalf of an enlistment is filed under its
//! [`TransactionId`] so commit and rollback can find it again, including
//! after a restart.

use crate::record_store::RecordStore;
use crate::sequence::SequenceAllocator;
use chrono::{DateTime, Duration, Utc};
use ferry_concurrency::{Scope, StoreTransaction};
use ferry_core::{
    validate_name, Endpoint, Error, HistoryRecord, IncomingRecord, IncomingState, Message,
    MessageId, MoveRecord, OutgoingRecord, OutgoingState, RecoveryMarker, Result, Reversal,
    SentRecord, TransactionId,
};
use ferry_storage::{Key, Partition, Table};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

// ============================================================================
// Encoding
// ============================================================================

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn queue_key(name: &str) -> Key {
    Key::global(Table::Queues, name.as_bytes())
}

fn subqueue_key(queue: &str, subqueue: &str) -> Key {
    Key::in_queue(queue, Table::Subqueues, subqueue.as_bytes())
}

fn subqueue_prefix(subqueue: Option<&str>) -> Vec<u8> {
    let mut id = subqueue.unwrap_or("").as_bytes().to_vec();
    id.push(0);
    id
}

fn incoming_key(queue: &str, subqueue: Option<&str>, arrival: u64) -> Key {
    let mut id = subqueue_prefix(subqueue);
    id.extend_from_slice(&arrival.to_be_bytes());
    Key::in_queue(queue, Table::Incoming, id)
}

fn outgoing_key(tx: TransactionId, message: &MessageId) -> Key {
    let mut id = tx.as_bytes().to_vec();
    id.extend_from_slice(&message.to_key_bytes());
    Key::global(Table::Outgoing, id)
}

fn reversal_key(tx: TransactionId, seq: u64) -> Key {
    let mut id = tx.as_bytes().to_vec();
    id.extend_from_slice(&seq.to_be_bytes());
    Key::global(Table::Reversals, id)
}

fn recovery_key(id: TransactionId) -> Key {
    Key::global(Table::Recovery, id.as_bytes().to_vec())
}

fn history_key(queue: &str, seq: u64) -> Key {
    Key::in_queue(queue, Table::History, seq.to_be_bytes().to_vec())
}

fn sent_key(seq: u64) -> Key {
    Key::global(Table::OutgoingHistory, seq.to_be_bytes().to_vec())
}

fn tx_from_key(key: &Key) -> Option<TransactionId> {
    let raw: [u8; 16] = key.id.get(..16)?.try_into().ok()?;
    Some(TransactionId::from_bytes(raw))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::Corruption(format!("name: {}", e)))
}

/// Delay before retry number `attempts`
pub fn retry_delay(attempts: u32) -> Duration {
    let attempts = i64::from(attempts);
    Duration::seconds(attempts * attempts)
}

// ============================================================================
// Retention
// ============================================================================

/// How much processed and sent history `purge_history` keeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRetention {
    /// Keep processed messages at all
    pub enable_processed_history: bool,
    /// Keep sent messages at all
    pub enable_outgoing_history: bool,
    /// Newest processed messages per queue that are never purged
    pub processed_to_keep: usize,
    /// Newest sent messages that are never purged
    pub outgoing_to_keep: usize,
    /// Processed messages beyond the kept ones are purged once older than this
    pub oldest_processed: Duration,
    /// Sent messages beyond the kept ones are purged once older than this
    pub oldest_outgoing: Duration,
}

impl Default for HistoryRetention {
    fn default() -> Self {
        Self {
            enable_processed_history: true,
            enable_outgoing_history: true,
            processed_to_keep: 100,
            outgoing_to_keep: 100,
            oldest_processed: Duration::days(3),
            oldest_outgoing: Duration::days(3),
        }
    }
}

/// Records removed by `purge_history`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Processed-history records removed
    pub processed: usize,
    /// Outgoing-history records removed
    pub sent: usize,
}

/// Result of `failed_to_send_to`
#[derive(Debug, Clone, Default)]
pub struct SendFailure {
    /// Records rescheduled for another attempt
    pub rescheduled: usize,
    /// Records that exhausted their attempts
    pub failed: Vec<SentRecord>,
}

// ============================================================================
// QueueStorage
// ============================================================================

/// Entry point to the message state tables
pub struct QueueStorage {
    store: Arc<RecordStore>,
    sequences: SequenceAllocator,
}

impl QueueStorage {
    /// Wrap a record store
    pub fn new(store: Arc<RecordStore>) -> Self {
        let sequences = SequenceAllocator::new(Arc::clone(&store));
        Self { store, sequences }
    }

    /// Resource-manager identity (the store id)
    pub fn id(&self) -> Uuid {
        self.store.id()
    }

    /// Underlying record store
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Next value of the store-wide sequence
    pub fn next_sequence(&self) -> Result<u64> {
        self.sequences.next()
    }

    /// Check the committed queue catalog
    pub fn queue_exists(&self, name: &str) -> bool {
        self.store.tables().contains(&queue_key(name))
    }

    /// Check the committed image for `id`'s recovery marker
    pub fn has_recovery_marker(&self, id: TransactionId) -> bool {
        self.store.tables().contains(&recovery_key(id))
    }

    /// Run `f` in a transaction spanning every queue
    pub fn global<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Actions<'_, '_>) -> Result<T>,
    {
        self.store.run_in_transaction(Scope::Global, |txn| {
            let mut actions = Actions::new(txn, &self.sequences, self.store.id());
            f(&mut actions)
        })
    }

    /// Run `f` in a transaction limited to `queue`'s partition
    pub fn queue<T, F>(&self, queue: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Actions<'_, '_>) -> Result<T>,
    {
        self.store.run_in_transaction(Scope::queue(queue), |txn| {
            let mut actions = Actions::new(txn, &self.sequences, self.store.id());
            f(&mut actions)
        })
    }
}

impl std::fmt::Debug for QueueStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStorage")
            .field("store", &self.store)
            .finish()
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Table operations inside one store transaction
pub struct Actions<'s, 't> {
    txn: &'t mut StoreTransaction<'s>,
    sequences: &'t SequenceAllocator,
    source: Uuid,
}

impl<'s, 't> Actions<'s, 't> {
    fn new(txn: &'t mut StoreTransaction<'s>, sequences: &'t SequenceAllocator, source: Uuid) -> Self {
        Self {
            txn,
            sequences,
            source,
        }
    }

    /// Underlying store transaction
    pub fn transaction(&mut self) -> &mut StoreTransaction<'s> {
        &mut *self.txn
    }

    /// Next value of the store-wide sequence
    pub fn next_sequence(&self) -> Result<u64> {
        self.sequences.next()
    }

    /// Fresh message id originating from this store
    pub fn new_message_id(&self) -> Result<MessageId> {
        Ok(MessageId::new(self.source, self.sequences.next()?))
    }

    fn read<T: DeserializeOwned>(&mut self, key: &Key) -> Result<Option<T>> {
        match self.txn.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&mut self, key: Key, value: &T) -> Result<()> {
        self.txn.put(key, encode(value)?)
    }

    fn scan<T: DeserializeOwned>(
        &mut self,
        partition: &Partition,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Key, T)>> {
        self.txn
            .scan_prefix(partition, table, prefix)?
            .into_iter()
            .map(|(k, v)| Ok((k, decode(&v)?)))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------------

    /// Create a queue; returns false when it already existed
    pub fn create_queue(&mut self, name: &str) -> Result<bool> {
        validate_name(name)?;
        if self.queue_exists(name)? {
            return Ok(false);
        }
        self.write(queue_key(name), &Utc::now())?;
        debug!(queue = name, "created queue");
        Ok(true)
    }

    /// Check the queue catalog
    pub fn queue_exists(&mut self, name: &str) -> Result<bool> {
        self.txn.contains(&queue_key(name))
    }

    fn require_queue(&mut self, name: &str) -> Result<()> {
        if self.queue_exists(name)? {
            Ok(())
        } else {
            Err(Error::QueueNotFound(name.to_string()))
        }
    }

    /// Queue names in lexical order
    pub fn queues(&mut self) -> Result<Vec<String>> {
        self.txn
            .scan_prefix(&Partition::Global, Table::Queues, &[])?
            .into_iter()
            .map(|(k, _)| utf8(&k.id))
            .collect()
    }

    /// Subqueues a message was ever delivered to
    pub fn subqueues(&mut self, queue: &str) -> Result<Vec<String>> {
        self.txn
            .scan_prefix(&Partition::queue(queue), Table::Subqueues, &[])?
            .into_iter()
            .map(|(k, _)| utf8(&k.id))
            .collect()
    }

    fn add_subqueue(&mut self, queue: &str, subqueue: &str) -> Result<()> {
        validate_name(subqueue)?;
        let key = subqueue_key(queue, subqueue);
        if !self.txn.contains(&key)? {
            self.txn.put(key, Vec::new())?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------------

    /// Queue `message` for transmission as part of `tx` (`PendingSend`)
    pub fn enqueue_outgoing(
        &mut self,
        tx: TransactionId,
        endpoint: Endpoint,
        message: Message,
    ) -> Result<()> {
        let key = outgoing_key(tx, &message.id);
        trace!(tx = %tx, message_id = %message.id, endpoint = %endpoint, "enqueue outgoing");
        let record = OutgoingRecord {
            message,
            endpoint,
            transaction_id: tx,
            state: OutgoingState::PendingSend,
            time_to_send: Utc::now(),
        };
        self.write(key, &record)
    }

    fn outgoing_of(&mut self, tx: TransactionId) -> Result<Vec<(Key, OutgoingRecord)>> {
        self.scan(&Partition::Global, Table::Outgoing, tx.as_bytes())
    }

    fn all_outgoing(&mut self) -> Result<Vec<(Key, OutgoingRecord)>> {
        self.scan(&Partition::Global, Table::Outgoing, &[])
    }

    /// Flip `tx`'s `PendingSend` records to `ReadyToSend`
    ///
    /// Idempotent: records already past `PendingSend` are left alone.
    pub fn mark_ready_to_send(&mut self, tx: TransactionId) -> Result<usize> {
        let mut flipped = 0;
        for (key, mut record) in self.outgoing_of(tx)? {
            if record.state == OutgoingState::PendingSend {
                record.state = OutgoingState::ReadyToSend;
                self.write(key, &record)?;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    /// Delete every outgoing record of `tx`; nothing to delete is not an error
    pub fn delete_message_to_send(&mut self, tx: TransactionId) -> Result<usize> {
        let records = self.outgoing_of(tx)?;
        let count = records.len();
        for (key, _) in records {
            self.txn.delete(key)?;
        }
        Ok(count)
    }

    /// Outgoing records waiting for (or in) transmission
    pub fn messages_currently_sending(&mut self) -> Result<Vec<OutgoingRecord>> {
        Ok(self
            .all_outgoing()?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| matches!(r.state, OutgoingState::ReadyToSend | OutgoingState::InFlight))
            .collect())
    }

    /// Hand up to `limit` due `ReadyToSend` records to the transport (`InFlight`)
    pub fn take_messages_to_send(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutgoingRecord>> {
        let mut taken = Vec::new();
        for (key, mut record) in self.all_outgoing()? {
            if taken.len() >= limit {
                break;
            }
            if record.state != OutgoingState::ReadyToSend || record.time_to_send > now {
                continue;
            }
            record.state = OutgoingState::InFlight;
            self.write(key, &record)?;
            taken.push(record);
        }
        Ok(taken)
    }

    /// Move confirmed messages to the outgoing history as `Sent`
    pub fn mark_sent(&mut self, ids: &[MessageId]) -> Result<Vec<SentRecord>> {
        let wanted: BTreeSet<MessageId> = ids.iter().copied().collect();
        let mut sent = Vec::new();
        for (key, record) in self.all_outgoing()? {
            if !wanted.contains(&record.message.id) || record.state == OutgoingState::PendingSend {
                continue;
            }
            self.txn.delete(key)?;
            let entry = SentRecord {
                message: record.message,
                endpoint: record.endpoint,
                state: OutgoingState::Sent,
                completed_at: Utc::now(),
            };
            let seq = self.next_sequence()?;
            self.write(sent_key(seq), &entry)?;
            sent.push(entry);
        }
        Ok(sent)
    }

    /// Return `endpoint`'s in-flight records for another attempt
    ///
    /// Each record's attempt count grows by one and its next attempt is
    /// delayed by [`retry_delay`]. Records reaching `max_attempts` move to
    /// the outgoing history as `Failed`.
    pub fn failed_to_send_to(
        &mut self,
        endpoint: &Endpoint,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<SendFailure> {
        let mut outcome = SendFailure::default();
        for (key, mut record) in self.all_outgoing()? {
            if &record.endpoint != endpoint || record.state != OutgoingState::InFlight {
                continue;
            }
            record.message.send_attempts += 1;
            if record.message.send_attempts >= max_attempts {
                self.txn.delete(key)?;
                let entry = SentRecord {
                    message: record.message,
                    endpoint: record.endpoint,
                    state: OutgoingState::Failed,
                    completed_at: now,
                };
                let seq = self.next_sequence()?;
                self.write(sent_key(seq), &entry)?;
                outcome.failed.push(entry);
            } else {
                record.state = OutgoingState::ReadyToSend;
                record.time_to_send = now + retry_delay(record.message.send_attempts);
                self.write(key, &record)?;
                outcome.rescheduled += 1;
            }
        }
        Ok(outcome)
    }

    /// Outgoing history, oldest first
    pub fn sent_messages(&mut self) -> Result<Vec<SentRecord>> {
        Ok(self
            .scan(&Partition::Global, Table::OutgoingHistory, &[])?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    // ------------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------------

    /// Deliver `message` to its queue as part of `tx` (`Arriving` until commit)
    ///
    /// Returns the arrival sequence.
    pub fn enqueue_incoming(&mut self, tx: TransactionId, message: Message) -> Result<u64> {
        self.require_queue(&message.queue)?;
        let queue = message.queue.clone();
        let subqueue = message.subqueue.clone();
        if let Some(sub) = &subqueue {
            self.add_subqueue(&queue, sub)?;
        }

        let arrival = self.next_sequence()?;
        let record = IncomingRecord {
            message,
            arrival,
            state: IncomingState::Arriving(tx),
        };
        self.write(incoming_key(&queue, subqueue.as_deref(), arrival), &record)?;
        self.add_reversal(
            tx,
            Reversal::Discard {
                queue,
                subqueue,
                arrival,
            },
        )?;
        Ok(arrival)
    }

    fn incoming(
        &mut self,
        queue: &str,
        subqueue: Option<&str>,
    ) -> Result<Vec<(Key, IncomingRecord)>> {
        self.scan(&Partition::queue(queue), Table::Incoming, &subqueue_prefix(subqueue))
    }

    fn all_incoming(&mut self, queue: &str) -> Result<Vec<(Key, IncomingRecord)>> {
        self.scan(&Partition::queue(queue), Table::Incoming, &[])
    }

    /// Lock the first visible message of `(queue, subqueue)` for `tx`
    pub fn receive(
        &mut self,
        tx: TransactionId,
        queue: &str,
        subqueue: Option<&str>,
    ) -> Result<Option<Message>> {
        self.require_queue(queue)?;
        let next = self
            .incoming(queue, subqueue)?
            .into_iter()
            .find(|(_, r)| r.state.is_visible());
        let Some((key, mut record)) = next else {
            return Ok(None);
        };

        record.state = IncomingState::Locked(tx);
        let message = record.message.clone();
        let arrival = record.arrival;
        self.write(key, &record)?;
        self.add_reversal(
            tx,
            Reversal::Unlock {
                queue: queue.to_string(),
                subqueue: subqueue.map(str::to_string),
                arrival,
            },
        )?;
        Ok(Some(message))
    }

    /// First visible message of `(queue, subqueue)`, without locking it
    pub fn peek(&mut self, queue: &str, subqueue: Option<&str>) -> Result<Option<Message>> {
        Ok(self
            .incoming(queue, subqueue)?
            .into_iter()
            .find(|(_, r)| r.state.is_visible())
            .map(|(_, r)| r.message))
    }

    /// Visible message with id `id` in any subqueue of `queue`
    pub fn peek_by_id(&mut self, queue: &str, id: &MessageId) -> Result<Option<Message>> {
        Ok(self
            .all_incoming(queue)?
            .into_iter()
            .find(|(_, r)| r.state.is_visible() && &r.message.id == id)
            .map(|(_, r)| r.message))
    }

    /// Visible messages of `(queue, subqueue)` in arrival order
    pub fn messages(&mut self, queue: &str, subqueue: Option<&str>) -> Result<Vec<Message>> {
        Ok(self
            .incoming(queue, subqueue)?
            .into_iter()
            .filter(|(_, r)| r.state.is_visible())
            .map(|(_, r)| r.message)
            .collect())
    }

    /// Visible messages across every subqueue of `queue`
    pub fn message_count(&mut self, queue: &str) -> Result<usize> {
        Ok(self
            .all_incoming(queue)?
            .iter()
            .filter(|(_, r)| r.state.is_visible())
            .count())
    }

    /// Processed history of `queue`, oldest first
    pub fn processed_messages(&mut self, queue: &str) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .scan(&Partition::queue(queue), Table::History, &[])?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    /// Move message `id` of `queue` into `to_subqueue` as part of `tx`
    ///
    /// The message must be visible or already received by `tx`. Until commit
    /// the source is hidden (`Moving`) and the destination is `Arriving`.
    pub fn move_to(
        &mut self,
        tx: TransactionId,
        queue: &str,
        id: &MessageId,
        to_subqueue: &str,
    ) -> Result<Message> {
        self.require_queue(queue)?;
        let found = self
            .all_incoming(queue)?
            .into_iter()
            .find(|(_, r)| &r.message.id == id);
        let Some((source_key, mut source)) = found else {
            return Err(Error::NotFound(format!("message {} in queue {}", id, queue)));
        };
        let prior_state = source.state;
        match prior_state {
            IncomingState::Queued => {}
            IncomingState::Locked(owner) if owner == tx => {}
            other => {
                return Err(Error::InvalidOperation(format!(
                    "message {} is held by another transaction ({:?})",
                    id, other
                )))
            }
        }

        self.add_subqueue(queue, to_subqueue)?;
        let from_subqueue = source.message.subqueue.clone();
        let from_arrival = source.arrival;
        source.state = IncomingState::Moving(tx);
        self.write(source_key, &source)?;

        let to_arrival = self.next_sequence()?;
        let mut message = source.message;
        message.subqueue = Some(to_subqueue.to_string());
        let destination = IncomingRecord {
            message: message.clone(),
            arrival: to_arrival,
            state: IncomingState::Arriving(tx),
        };
        self.write(incoming_key(queue, Some(to_subqueue), to_arrival), &destination)?;

        self.add_reversal(
            tx,
            Reversal::Move(MoveRecord {
                queue: queue.to_string(),
                from_subqueue,
                from_arrival,
                to_subqueue: Some(to_subqueue.to_string()),
                to_arrival,
                prior_state,
            }),
        )?;
        Ok(message)
    }

    // ------------------------------------------------------------------------
    // Reversals
    // ------------------------------------------------------------------------

    fn add_reversal(&mut self, tx: TransactionId, reversal: Reversal) -> Result<()> {
        let seq = self.next_sequence()?;
        self.write(reversal_key(tx, seq), &reversal)
    }

    fn reversals(&mut self, tx: TransactionId) -> Result<Vec<(Key, Reversal)>> {
        self.scan(&Partition::Global, Table::Reversals, tx.as_bytes())
    }

    fn incoming_record(
        &mut self,
        queue: &str,
        subqueue: Option<&str>,
        arrival: u64,
    ) -> Result<Option<(Key, IncomingRecord)>> {
        let key = incoming_key(queue, subqueue, arrival);
        Ok(self.read(&key)?.map(|r| (key, r)))
    }

    /// Commit path: finalize everything `tx` did to the incoming tables
    ///
    /// Received messages move to the processed history, provisional inserts
    /// and move destinations become visible, move sources are deleted. The
    /// reversal entries are removed. Returns the number of entries applied.
    pub fn remove_reversals_and_finish_moves(&mut self, tx: TransactionId) -> Result<usize> {
        let reversals = self.reversals(tx)?;
        let count = reversals.len();
        for (key, reversal) in reversals {
            match reversal {
                Reversal::Unlock {
                    queue,
                    subqueue,
                    arrival,
                } => {
                    if let Some((k, record)) =
                        self.incoming_record(&queue, subqueue.as_deref(), arrival)?
                    {
                        if record.state == IncomingState::Locked(tx) {
                            self.txn.delete(k)?;
                            let seq = self.next_sequence()?;
                            let entry = HistoryRecord {
                                message: record.message,
                                processed_at: Utc::now(),
                            };
                            self.write(history_key(&queue, seq), &entry)?;
                        }
                    }
                }
                Reversal::Discard {
                    queue,
                    subqueue,
                    arrival,
                } => {
                    self.reveal(tx, &queue, subqueue.as_deref(), arrival)?;
                }
                Reversal::Move(m) => {
                    if let Some((k, record)) =
                        self.incoming_record(&m.queue, m.from_subqueue.as_deref(), m.from_arrival)?
                    {
                        if record.state == IncomingState::Moving(tx) {
                            self.txn.delete(k)?;
                        }
                    }
                    self.reveal(tx, &m.queue, m.to_subqueue.as_deref(), m.to_arrival)?;
                }
            }
            self.txn.delete(key)?;
        }
        Ok(count)
    }

    fn reveal(
        &mut self,
        tx: TransactionId,
        queue: &str,
        subqueue: Option<&str>,
        arrival: u64,
    ) -> Result<()> {
        if let Some((k, mut record)) = self.incoming_record(queue, subqueue, arrival)? {
            if record.state == IncomingState::Arriving(tx) {
                record.state = IncomingState::Queued;
                self.write(k, &record)?;
            }
        }
        Ok(())
    }

    fn discard(
        &mut self,
        tx: TransactionId,
        queue: &str,
        subqueue: Option<&str>,
        arrival: u64,
    ) -> Result<()> {
        if let Some((k, record)) = self.incoming_record(queue, subqueue, arrival)? {
            if record.state == IncomingState::Arriving(tx) {
                self.txn.delete(k)?;
            }
        }
        Ok(())
    }

    /// Rollback path: undo everything `tx` did to the incoming tables
    ///
    /// Entries are undone newest first: locks are released (`Queued`, attempt
    /// counts untouched), provisional inserts and move destinations deleted,
    /// move sources restored to their prior state. Returns the number of
    /// entries undone.
    pub fn reverse_all_from(&mut self, tx: TransactionId) -> Result<usize> {
        let reversals = self.reversals(tx)?;
        let count = reversals.len();
        for (key, reversal) in reversals.into_iter().rev() {
            match reversal {
                Reversal::Unlock {
                    queue,
                    subqueue,
                    arrival,
                } => {
                    if let Some((k, mut record)) =
                        self.incoming_record(&queue, subqueue.as_deref(), arrival)?
                    {
                        if record.state == IncomingState::Locked(tx) {
                            record.state = IncomingState::Queued;
                            self.write(k, &record)?;
                        }
                    }
                }
                Reversal::Discard {
                    queue,
                    subqueue,
                    arrival,
                } => {
                    self.discard(tx, &queue, subqueue.as_deref(), arrival)?;
                }
                Reversal::Move(m) => {
                    self.discard(tx, &m.queue, m.to_subqueue.as_deref(), m.to_arrival)?;
                    if let Some((k, mut record)) =
                        self.incoming_record(&m.queue, m.from_subqueue.as_deref(), m.from_arrival)?
                    {
                        if record.state == IncomingState::Moving(tx) {
                            record.state = m.prior_state;
                            self.write(k, &record)?;
                        }
                    }
                }
            }
            self.txn.delete(key)?;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    /// Durably record that enlistment `id` prepared
    pub fn register_recovery_information(
        &mut self,
        id: TransactionId,
        information: &[u8],
    ) -> Result<()> {
        let marker = RecoveryMarker {
            enlistment_id: id,
            information: information.to_vec(),
        };
        self.write(recovery_key(id), &marker)
    }

    /// Remove `id`'s marker; returns false when there was none
    pub fn delete_recovery_information(&mut self, id: TransactionId) -> Result<bool> {
        let key = recovery_key(id);
        if !self.txn.contains(&key)? {
            return Ok(false);
        }
        self.txn.delete(key)?;
        Ok(true)
    }

    /// Every recovery marker
    pub fn recovery_information(&mut self) -> Result<Vec<RecoveryMarker>> {
        Ok(self
            .scan(&Partition::Global, Table::Recovery, &[])?
            .into_iter()
            .map(|(_, m)| m)
            .collect())
    }

    /// Transactions that still own provisional records
    ///
    /// A transaction is pending while it has reversal entries or
    /// `PendingSend` outgoing records.
    pub fn pending_transactions(&mut self) -> Result<BTreeSet<TransactionId>> {
        let mut pending = BTreeSet::new();
        for (key, _) in self.txn.scan_prefix(&Partition::Global, Table::Reversals, &[])? {
            if let Some(tx) = tx_from_key(&key) {
                pending.insert(tx);
            }
        }
        for (_, record) in self.all_outgoing()? {
            if record.state == OutgoingState::PendingSend {
                pending.insert(record.transaction_id);
            }
        }
        Ok(pending)
    }

    // ------------------------------------------------------------------------
    // History retention
    // ------------------------------------------------------------------------

    /// Trim processed and outgoing history according to `retention`
    pub fn purge_history(
        &mut self,
        retention: &HistoryRetention,
        now: DateTime<Utc>,
    ) -> Result<PurgeOutcome> {
        let mut outcome = PurgeOutcome::default();

        for queue in self.queues()? {
            let history: Vec<(Key, HistoryRecord)> =
                self.scan(&Partition::queue(&queue), Table::History, &[])?;
            let doomed = purgeable(
                history.iter().map(|(_, r)| r.processed_at).collect(),
                retention.enable_processed_history,
                retention.processed_to_keep,
                cutoff(now, retention.oldest_processed),
            );
            for (i, (key, _)) in history.into_iter().enumerate() {
                if doomed(i) {
                    self.txn.delete(key)?;
                    outcome.processed += 1;
                }
            }
        }

        let sent: Vec<(Key, SentRecord)> =
            self.scan(&Partition::Global, Table::OutgoingHistory, &[])?;
        let doomed = purgeable(
            sent.iter().map(|(_, r)| r.completed_at).collect(),
            retention.enable_outgoing_history,
            retention.outgoing_to_keep,
            cutoff(now, retention.oldest_outgoing),
        );
        for (i, (key, _)) in sent.into_iter().enumerate() {
            if doomed(i) {
                self.txn.delete(key)?;
                outcome.sent += 1;
            }
        }

        if outcome.processed + outcome.sent > 0 {
            debug!(
                processed = outcome.processed,
                sent = outcome.sent,
                "purged history"
            );
        }
        Ok(outcome)
    }
}

/// Which positions of an oldest-first history list to purge
///
/// With history disabled everything goes. Otherwise the newest `keep`
/// entries stay and older ones go once they are older than `cutoff`.
fn purgeable(
    timestamps: Vec<DateTime<Utc>>,
    enabled: bool,
    keep: usize,
    cutoff: DateTime<Utc>,
) -> impl Fn(usize) -> bool {
    let excess = timestamps.len().saturating_sub(keep);
    move |i| !enabled || (i < excess && timestamps[i] < cutoff)
}

/// `now - age`, saturating at the earliest representable instant
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
