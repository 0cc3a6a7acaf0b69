//! Core identifier types for the queue manager
//!
//! This module defines the identifiers used throughout the system:
//! - [`TransactionId`]: Identity of one enlistment and every record it files
//! - [`MessageId`]: Globally unique, per-origin ordered message identity
//! - [`Endpoint`]: Remote host:port a message is addressed to
//! - [`QueueUri`]: Parsed `ferry://host:port/queue[/subqueue]` destination

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// URI scheme for queue addresses
pub const QUEUE_URI_SCHEME: &str = "ferry";

/// Identifier of a transaction enlistment
///
/// Every provisional record (outgoing message, receive lock, move, reversal)
/// is filed under the id of the enlistment that created it. The same id keys
/// the recovery marker written at prepare time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

/// Enlistments are identified by the transaction id they file records under.
pub type EnlistmentId = TransactionId;

impl TransactionId {
    /// Create a new random TransactionId using UUID v4
    ///
    /// # Examples
    ///
    /// ```
    /// use ferry_core::types::TransactionId;
    ///
    /// let a = TransactionId::new();
    /// let b = TransactionId::new();
    /// assert_ne!(a, b);
    /// ```
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }

    /// Create TransactionId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TransactionId(Uuid::from_bytes(bytes))
    }

    /// Get raw bytes representation
    ///
    /// The byte form is the key prefix of every record the transaction owns.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransactionId {
    fn from(id: Uuid) -> Self {
        TransactionId(id)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identity
///
/// The origin store's stable identifier plus a sequence number that is
/// monotonic per origin. Ordering is by origin first, then sequence, so
/// messages from one origin sort in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    /// Store identifier of the queue manager that issued the id
    pub source_instance_id: Uuid,
    /// Monotonic sequence within the origin
    pub message_identifier: u64,
}

impl MessageId {
    /// Create a message id
    pub fn new(source_instance_id: Uuid, message_identifier: u64) -> Self {
        Self {
            source_instance_id,
            message_identifier,
        }
    }

    /// Fixed-width big-endian encoding, ordered like `Ord`
    pub fn to_key_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..16].copy_from_slice(self.source_instance_id.as_bytes());
        out[16..].copy_from_slice(&self.message_identifier.to_be_bytes());
        out
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_instance_id, self.message_identifier)
    }
}

/// Remote endpoint a message is transmitted to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A parsed queue address: `ferry://host:port/queue[/subqueue]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueUri {
    /// Endpoint hosting the queue
    pub endpoint: Endpoint,
    /// Queue name
    pub queue: String,
    /// Optional subqueue
    pub subqueue: Option<String>,
}

impl QueueUri {
    /// Build a queue address from parts
    pub fn new(endpoint: Endpoint, queue: impl Into<String>, subqueue: Option<String>) -> Self {
        Self {
            endpoint,
            queue: queue.into(),
            subqueue,
        }
    }

    /// Parse `ferry://host:port/queue[/subqueue]`
    ///
    /// # Examples
    ///
    /// ```
    /// use ferry_core::types::QueueUri;
    ///
    /// let uri = QueueUri::parse("ferry://localhost:2200/orders/errors").unwrap();
    /// assert_eq!(uri.endpoint.port, 2200);
    /// assert_eq!(uri.queue, "orders");
    /// assert_eq!(uri.subqueue.as_deref(), Some("errors"));
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidInput(format!("queue uri '{}': {}", input, why));

        let rest = input
            .strip_prefix(QUEUE_URI_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| invalid("expected ferry:// scheme"))?;

        let (authority, path) = rest.split_once('/').ok_or_else(|| invalid("missing queue"))?;
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;

        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let queue = segments.next().ok_or_else(|| invalid("missing queue"))?;
        let subqueue = segments.next().map(str::to_string);
        if segments.next().is_some() {
            return Err(invalid("too many path segments"));
        }

        validate_name(queue)?;
        if let Some(sub) = &subqueue {
            validate_name(sub)?;
        }

        Ok(Self {
            endpoint: Endpoint::new(host, port),
            queue: queue.to_string(),
            subqueue,
        })
    }
}

impl std::fmt::Display for QueueUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", QUEUE_URI_SCHEME, self.endpoint, self.queue)?;
        if let Some(sub) = &self.subqueue {
            write!(f, "/{}", sub)?;
        }
        Ok(())
    }
}

/// Validate a queue or subqueue name
///
/// Names are non-empty and may not contain NUL or `/`; NUL separates the
/// subqueue from the arrival sequence in incoming keys.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("queue name must not be empty".into()));
    }
    if name.contains('\0') || name.contains('/') {
        return Err(Error::InvalidInput(format!(
            "queue name '{}' contains a reserved character",
            name.escape_debug()
        )));
    }
    Ok(())
}
