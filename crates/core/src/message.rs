//! Messages and the records that hold them in each table
//!
//! A [`Message`] is owned by exactly one table at a time. It moves between
//! tables (outgoing → sent history, incoming → processed history) as part of
//! a single atomic commit; it is never copied.

use crate::types::{Endpoint, MessageId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Payload handed to `send` / `enqueue_directly_to`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Opaque body
    pub data: Vec<u8>,
    /// Application headers
    pub headers: BTreeMap<String, String>,
}

impl MessagePayload {
    /// Payload with a body and no headers
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// An immutable message plus its identity and destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique identity
    pub id: MessageId,
    /// Destination queue
    pub queue: String,
    /// Destination subqueue, `None` for the main queue
    pub subqueue: Option<String>,
    /// Opaque body
    pub data: Vec<u8>,
    /// Application headers
    pub headers: BTreeMap<String, String>,
    /// When the message was enqueued
    pub sent_at: DateTime<Utc>,
    /// Number of failed transmission attempts
    pub send_attempts: u32,
}

impl Message {
    /// Build a message from a payload
    pub fn new(
        id: MessageId,
        queue: impl Into<String>,
        subqueue: Option<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            subqueue,
            data: payload.data,
            headers: payload.headers,
            sent_at: Utc::now(),
            send_attempts: 0,
        }
    }
}

/// Lifecycle of a message queued for transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutgoingState {
    /// Written by an uncommitted transaction; invisible to the transport
    PendingSend,
    /// Committed; the transport may pick it up
    ReadyToSend,
    /// Handed to the transport, awaiting confirmation
    InFlight,
    /// Delivery confirmed (outgoing history only)
    Sent,
    /// Retries exhausted (outgoing history only)
    Failed,
}

/// A message queued to send to a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRecord {
    /// The message
    pub message: Message,
    /// Target endpoint
    pub endpoint: Endpoint,
    /// Enlistment that created the record
    pub transaction_id: TransactionId,
    /// Current state
    pub state: OutgoingState,
    /// Earliest time the transport may (re)try
    pub time_to_send: DateTime<Utc>,
}

/// A message that left the outgoing table (sent or given up on)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    /// The message
    pub message: Message,
    /// Endpoint it was addressed to
    pub endpoint: Endpoint,
    /// `Sent` or `Failed`
    pub state: OutgoingState,
    /// When it left the outgoing table
    pub completed_at: DateTime<Utc>,
}

/// Visibility state of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncomingState {
    /// Visible to receivers
    Queued,
    /// Received by an uncommitted transaction
    Locked(TransactionId),
    /// Source half of an uncommitted move
    Moving(TransactionId),
    /// Inserted by an uncommitted transaction
    Arriving(TransactionId),
}

impl IncomingState {
    /// Transaction holding the record, if any
    pub fn owner(&self) -> Option<TransactionId> {
        match self {
            IncomingState::Queued => None,
            IncomingState::Locked(tx) | IncomingState::Moving(tx) | IncomingState::Arriving(tx) => {
                Some(*tx)
            }
        }
    }

    /// Whether receivers and peekers can see the record
    pub fn is_visible(&self) -> bool {
        matches!(self, IncomingState::Queued)
    }
}

/// A message delivered to a local queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRecord {
    /// The message; `message.subqueue` names the subqueue holding it
    pub message: Message,
    /// Local arrival sequence (FIFO order within a subqueue)
    pub arrival: u64,
    /// Visibility state
    pub state: IncomingState,
}

/// A message whose receiving transaction committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// The message
    pub message: Message,
    /// Commit time of the receiving transaction
    pub processed_at: DateTime<Utc>,
}

/// An in-flight subqueue reassignment
///
/// The source record is hidden as `Moving`, the destination inserted as
/// `Arriving`. Commit deletes the source and reveals the destination;
/// rollback deletes the destination and restores the source's prior state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    /// Queue both halves live in
    pub queue: String,
    /// Subqueue of the source record
    pub from_subqueue: Option<String>,
    /// Arrival sequence of the source record
    pub from_arrival: u64,
    /// Subqueue of the destination record
    pub to_subqueue: Option<String>,
    /// Arrival sequence of the destination record
    pub to_arrival: u64,
    /// Source state before the move
    pub prior_state: IncomingState,
}

/// One entry of a transaction's undo log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reversal {
    /// A receive lock: commit moves the message to history, rollback requeues it
    Unlock {
        /// Queue
        queue: String,
        /// Subqueue
        subqueue: Option<String>,
        /// Arrival sequence
        arrival: u64,
    },
    /// A provisional insert: commit reveals it, rollback deletes it
    Discard {
        /// Queue
        queue: String,
        /// Subqueue
        subqueue: Option<String>,
        /// Arrival sequence
        arrival: u64,
    },
    /// A subqueue move
    Move(MoveRecord),
}

/// Durable proof that an enlistment prepared and has not yet completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMarker {
    /// Enlistment that prepared
    pub enlistment_id: TransactionId,
    /// Ambient coordinator's recovery token
    pub information: Vec<u8>,
}
