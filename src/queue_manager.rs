//! The queue manager
//!
//! [`QueueManager`] is the entry point: it opens the store, recovers
//! interrupted transactions, and exposes queue operations that join the
//! caller's ambient transaction.
//!
//! # Transactions
//!
//! Every mutating call takes the ambient transaction as a
//! [`TransactionContext`]. The first call in a transaction enlists one
//! [`TransactionEnlistment`] with it; later calls in the same transaction
//! reuse it. Nothing a transaction does becomes visible to other
//! transactions, the transport, or observers until it commits.
//!
//! ```ignore
//! use ferrydb::prelude::*;
//!
//! let coordinator = LocalCoordinator::open("./dtc", DurabilityMode::Strict)?;
//! let qm = QueueManager::builder()
//!     .path("./queues")
//!     .coordinator(coordinator.clone())
//!     .open()?;
//! qm.create_queues(&["orders"])?;
//!
//! let tx = coordinator.begin();
//! qm.send(&tx, &QueueUri::parse("ferry://remote:2200/orders")?, MessagePayload::new("hi"))?;
//! tx.commit()?;
//! ```

use crate::config::{HistoryConfig, QueueManagerConfig};
use crate::error::{Error, Result};
use crate::observer::{QueueEvent, QueueObserver};
use chrono::Utc;
use ferry_core::{
    validate_name, EnlistmentId, Endpoint, HistoryRecord, Message, MessageId, MessagePayload,
    OutgoingRecord, QueueUri, SentRecord,
};
use ferry_durability::DurabilityMode;
use ferry_engine::{
    recover, AssertNotDisposed, EnlistmentOutcome, EnlistmentState, HistoryRetention,
    OnComplete, PurgeOutcome, QueueStorage, RecordStore, RecoveryReport, SendFailure,
    TransactionContext, TransactionCoordinator, TransactionEnlistment,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const OPEN: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

struct Inner {
    storage: Arc<QueueStorage>,
    config: QueueManagerConfig,
    retention: HistoryRetention,
    lifecycle: AtomicU8,
    /// Live enlistments by ambient transaction key
    enlistments: Mutex<HashMap<Uuid, Arc<TransactionEnlistment>>>,
    drained: Condvar,
    /// Events waiting for their transaction to commit
    pending_events: Mutex<HashMap<EnlistmentId, Vec<QueueEvent>>>,
    observers: RwLock<Vec<Arc<dyn QueueObserver>>>,
    /// Bumped after every committed state change
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.lifecycle.load(Ordering::Acquire) == OPEN {
            Ok(())
        } else {
            Err(Error::Disposed)
        }
    }

    fn assert_not_disposed(&self) -> ferry_core::Result<()> {
        if self.lifecycle.load(Ordering::Acquire) == DISPOSED {
            Err(ferry_core::Error::Disposed)
        } else {
            Ok(())
        }
    }

    fn require_queue(&self, queue: &str) -> Result<()> {
        if self.storage.queue_exists(queue) {
            Ok(())
        } else {
            Err(Error::QueueNotFound(queue.to_string()))
        }
    }

    fn signal(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    fn publish(&self, events: &[QueueEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for event in events {
            for observer in &observers {
                observer.on_event(event);
            }
        }
    }

    fn record_event(&self, enlistment: EnlistmentId, event: QueueEvent) {
        self.pending_events
            .lock()
            .entry(enlistment)
            .or_default()
            .push(event);
    }

    /// The enlistment for `tx`, enlisting a new one on first use
    fn enlistment(self: &Arc<Self>, tx: &dyn TransactionContext) -> Result<Arc<TransactionEnlistment>> {
        let key = tx.key();
        let mut enlistments = self.enlistments.lock();
        if let Some(existing) = enlistments.get(&key) {
            if existing.state() != EnlistmentState::Created {
                return Err(Error::InvalidOperation(format!(
                    "transaction {} is already completing",
                    key
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let weak = Arc::downgrade(self);
        let on_complete: OnComplete = Box::new(move |id, outcome| {
            if let Some(inner) = weak.upgrade() {
                inner.complete(key, id, outcome);
            }
        });
        let weak = Arc::downgrade(self);
        let assert_not_disposed: AssertNotDisposed = Box::new(move || match weak.upgrade() {
            Some(inner) => inner.assert_not_disposed(),
            None => Err(ferry_core::Error::Disposed),
        });

        let enlistment = Arc::new(TransactionEnlistment::new(
            Arc::clone(&self.storage),
            on_complete,
            assert_not_disposed,
        ));
        tx.enlist_durable(self.storage.id(), enlistment.clone())?;
        debug!(transaction = %key, enlistment_id = %enlistment.id(), "enlisted queue manager");
        enlistments.insert(key, Arc::clone(&enlistment));
        Ok(enlistment)
    }

    fn complete(&self, key: Uuid, id: EnlistmentId, outcome: EnlistmentOutcome) {
        {
            let mut enlistments = self.enlistments.lock();
            enlistments.remove(&key);
            self.drained.notify_all();
        }
        let events = self.pending_events.lock().remove(&id).unwrap_or_default();
        debug!(enlistment_id = %id, outcome = ?outcome, events = events.len(), "transaction completed");
        if outcome == EnlistmentOutcome::Committed {
            self.publish(&events);
        }
        self.signal();
    }
}

/// `None` is the main queue; a named subqueue must be a valid name
fn validate_subqueue(subqueue: Option<&str>) -> Result<()> {
    match subqueue {
        Some(name) => Ok(validate_name(name)?),
        None => Ok(()),
    }
}

/// A durable, transactional queue manager
///
/// Open one with [`QueueManager::open`] or [`QueueManager::builder`].
pub struct QueueManager {
    inner: Arc<Inner>,
    recovery: RecoveryReport,
}

impl QueueManager {
    /// Open a queue manager, recovering interrupted transactions first
    ///
    /// `coordinator` must be the coordinator whose transactions this store
    /// took part in; recovery asks it for the outcome of every transaction
    /// left prepared. Fails with [`Error::Recovery`] if any stays in doubt.
    pub fn open(
        config: QueueManagerConfig,
        coordinator: Arc<dyn TransactionCoordinator>,
    ) -> Result<Self> {
        config.validate()?;
        let store = match &config.path {
            Some(path) => RecordStore::open(path, config.durability)?,
            None => RecordStore::ephemeral()?,
        };
        if config.path.is_some() && !config.durability.is_crash_safe() {
            warn!(
                durability = ?config.durability,
                "single-phase commits may be lost on crash"
            );
        }
        let storage = Arc::new(QueueStorage::new(Arc::new(store)));
        let recovery = recover(&storage, coordinator.as_ref())?;

        info!(
            id = %storage.id(),
            endpoint = %config.endpoint,
            durability = ?config.durability,
            "queue manager opened"
        );
        let retention = config.history.retention();
        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                config,
                retention,
                lifecycle: AtomicU8::new(OPEN),
                enlistments: Mutex::new(HashMap::new()),
                drained: Condvar::new(),
                pending_events: Mutex::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
                generation: Mutex::new(0),
                changed: Condvar::new(),
            }),
            recovery,
        })
    }

    /// In-memory queue manager; nothing survives the process
    pub fn ephemeral(coordinator: Arc<dyn TransactionCoordinator>) -> Result<Self> {
        Self::builder()
            .no_durability()
            .coordinator(coordinator)
            .open()
    }

    /// Create a builder for queue manager configuration.
    pub fn builder() -> QueueManagerBuilder {
        QueueManagerBuilder::new()
    }

    /// Stable identity of the store (its resource-manager id)
    pub fn id(&self) -> Uuid {
        self.inner.storage.id()
    }

    /// Endpoint this queue manager answers at
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.config.endpoint
    }

    /// Store directory, if any
    pub fn path(&self) -> Option<&Path> {
        self.inner.config.path.as_deref()
    }

    /// Effective configuration
    pub fn config(&self) -> &QueueManagerConfig {
        &self.inner.config
    }

    /// What recovery did when this instance opened
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Register an observer for committed events
    pub fn subscribe(&self, observer: Arc<dyn QueueObserver>) {
        self.inner.observers.write().push(observer);
    }

    // ------------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------------

    /// Create queues that do not exist yet
    pub fn create_queues(&self, names: &[&str]) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.storage.global(|a| {
            for name in names {
                a.create_queue(name)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Queue names in lexical order
    pub fn queues(&self) -> Result<Vec<String>> {
        self.inner.ensure_open()?;
        Ok(self.inner.storage.global(|a| a.queues())?)
    }

    /// Subqueues of `queue`
    pub fn subqueues(&self, queue: &str) -> Result<Vec<String>> {
        self.inner.ensure_open()?;
        self.inner.require_queue(queue)?;
        Ok(self.inner.storage.queue(queue, |a| a.subqueues(queue))?)
    }

    // ------------------------------------------------------------------------
    // Transactional operations
    // ------------------------------------------------------------------------

    /// Queue a message for transmission to `destination`
    ///
    /// The transport sees it once `tx` commits.
    pub fn send(
        &self,
        tx: &dyn TransactionContext,
        destination: &QueueUri,
        payload: MessagePayload,
    ) -> Result<MessageId> {
        self.inner.ensure_open()?;
        validate_name(&destination.queue)?;
        let enlistment = self.inner.enlistment(tx)?;
        let id = enlistment.id();
        let endpoint = destination.endpoint.clone();

        let message = self.inner.storage.global(|a| {
            let message = Message::new(
                a.new_message_id()?,
                destination.queue.clone(),
                destination.subqueue.clone(),
                payload,
            );
            a.enqueue_outgoing(id, endpoint.clone(), message.clone())?;
            Ok(message)
        })?;
        debug!(enlistment_id = %id, message_id = %message.id, endpoint = %endpoint, "queued for send");

        let message_id = message.id;
        self.inner
            .record_event(id, QueueEvent::MessageQueuedForSend { message, endpoint });
        Ok(message_id)
    }

    /// Receive the next message of `(queue, subqueue)`, if one is available
    ///
    /// The message is locked for `tx`: it is consumed when `tx` commits and
    /// becomes visible again, unchanged, if `tx` rolls back.
    pub fn receive(
        &self,
        tx: &dyn TransactionContext,
        queue: &str,
        subqueue: Option<&str>,
    ) -> Result<Option<Message>> {
        self.inner.ensure_open()?;
        self.inner.require_queue(queue)?;
        validate_subqueue(subqueue)?;
        let enlistment = self.inner.enlistment(tx)?;
        let id = enlistment.id();

        let received = self.inner.storage.global(|a| a.receive(id, queue, subqueue))?;
        if let Some(message) = &received {
            debug!(enlistment_id = %id, message_id = %message.id, queue, "received");
            self.inner.record_event(
                id,
                QueueEvent::MessageReceived {
                    message: message.clone(),
                },
            );
        }
        Ok(received)
    }

    /// Receive, waiting up to `timeout` for a message to arrive
    pub fn receive_timeout(
        &self,
        tx: &dyn TransactionContext,
        queue: &str,
        subqueue: Option<&str>,
        timeout: Duration,
    ) -> Result<Message> {
        self.wait_for(timeout, || format!("no message in {}", queue), || {
            self.receive(tx, queue, subqueue)
        })
    }

    /// Move `message` into `subqueue` of its queue
    ///
    /// `message` must be visible or already received by `tx`.
    pub fn move_to(
        &self,
        tx: &dyn TransactionContext,
        subqueue: &str,
        message: &Message,
    ) -> Result<()> {
        self.inner.ensure_open()?;
        validate_name(subqueue)?;
        self.inner.require_queue(&message.queue)?;
        let enlistment = self.inner.enlistment(tx)?;
        let id = enlistment.id();
        self.inner
            .storage
            .global(|a| a.move_to(id, &message.queue, &message.id, subqueue))?;
        debug!(enlistment_id = %id, message_id = %message.id, subqueue, "moved");
        Ok(())
    }

    /// Deliver a message straight into a local queue
    pub fn enqueue_directly_to(
        &self,
        tx: &dyn TransactionContext,
        queue: &str,
        subqueue: Option<&str>,
        payload: MessagePayload,
    ) -> Result<MessageId> {
        self.inner.ensure_open()?;
        self.inner.require_queue(queue)?;
        validate_subqueue(subqueue)?;
        let enlistment = self.inner.enlistment(tx)?;
        let id = enlistment.id();

        let message = self.inner.storage.global(|a| {
            let message = Message::new(
                a.new_message_id()?,
                queue,
                subqueue.map(str::to_string),
                payload,
            );
            a.enqueue_incoming(id, message.clone())?;
            Ok(message)
        })?;

        let message_id = message.id;
        self.inner
            .record_event(id, QueueEvent::MessageQueuedForReceive { message });
        Ok(message_id)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Next visible message of `(queue, subqueue)` without receiving it
    pub fn peek(&self, queue: &str, subqueue: Option<&str>) -> Result<Option<Message>> {
        self.inner.ensure_open()?;
        self.inner.require_queue(queue)?;
        validate_subqueue(subqueue)?;
        Ok(self.inner.storage.queue(queue, |a| a.peek(queue, subqueue))?)
    }

    /// Peek, waiting up to `timeout` for a message to arrive
    pub fn peek_timeout(
        &self,
        queue: &str,
        subqueue: Option<&str>,
        timeout: Duration,
    ) -> Result<Message> {
        self.wait_for(timeout, || format!("no message in {}", queue), || {
            self.peek(queue, subqueue)
        })
    }

    /// Visible message `id` of `queue`, in any subqueue
    pub fn peek_by_id(&self, queue: &str, id: &MessageId) -> Result<Option<Message>> {
        self.inner.ensure_open()?;
        self.inner.require_queue(queue)?;
        Ok(self.inner.storage.queue(queue, |a| a.peek_by_id(queue, id))?)
    }

    /// Visible messages of `(queue, subqueue)` in arrival order
    pub fn get_all_messages(&self, queue: &str, subqueue: Option<&str>) -> Result<Vec<Message>> {
        self.inner.ensure_open()?;
        self.inner.require_queue(queue)?;
        validate_subqueue(subqueue)?;
        Ok(self.inner.storage.queue(queue, |a| a.messages(queue, subqueue))?)
    }

    /// Processed history of `queue`, oldest first
    pub fn get_all_processed_messages(&self, queue: &str) -> Result<Vec<HistoryRecord>> {
        self.inner.ensure_open()?;
        self.inner.require_queue(queue)?;
        Ok(self.inner.storage.queue(queue, |a| a.processed_messages(queue))?)
    }

    /// Outgoing history (sent and failed), oldest first
    pub fn get_all_sent_messages(&self) -> Result<Vec<SentRecord>> {
        self.inner.ensure_open()?;
        Ok(self.inner.storage.global(|a| a.sent_messages())?)
    }

    /// Committed messages not yet confirmed by the transport
    pub fn get_messages_currently_sending(&self) -> Result<Vec<OutgoingRecord>> {
        self.inner.ensure_open()?;
        Ok(self.inner.storage.global(|a| a.messages_currently_sending())?)
    }

    /// Visible messages across every subqueue of `queue`
    pub fn get_number_of_messages(&self, queue: &str) -> Result<usize> {
        self.inner.ensure_open()?;
        self.inner.require_queue(queue)?;
        Ok(self.inner.storage.queue(queue, |a| a.message_count(queue))?)
    }

    // ------------------------------------------------------------------------
    // Transport side
    // ------------------------------------------------------------------------

    /// Hand up to `limit` due messages to the transport
    pub fn take_messages_to_send(&self, limit: usize) -> Result<Vec<OutgoingRecord>> {
        self.inner.ensure_open()?;
        Ok(self
            .inner
            .storage
            .global(|a| a.take_messages_to_send(Utc::now(), limit))?)
    }

    /// The transport delivered these messages
    pub fn mark_sent(&self, ids: &[MessageId]) -> Result<usize> {
        self.inner.ensure_open()?;
        let sent = self.inner.storage.global(|a| a.mark_sent(ids))?;
        let events: Vec<QueueEvent> = sent
            .into_iter()
            .map(|r| QueueEvent::MessageSent {
                message: r.message,
                endpoint: r.endpoint,
            })
            .collect();
        self.inner.publish(&events);
        self.inner.signal();
        Ok(events.len())
    }

    /// The transport could not reach `endpoint`
    ///
    /// Its in-flight messages are rescheduled with backoff; messages that
    /// reached `max_send_attempts` move to the outgoing history as failed.
    pub fn failed_to_send_to(&self, endpoint: &Endpoint) -> Result<SendFailure> {
        self.inner.ensure_open()?;
        let max_attempts = self.inner.config.max_send_attempts;
        let failure = self
            .inner
            .storage
            .global(|a| a.failed_to_send_to(endpoint, max_attempts, Utc::now()))?;
        if !failure.failed.is_empty() {
            warn!(
                endpoint = %endpoint,
                failed = failure.failed.len(),
                "messages exhausted their send attempts"
            );
        }
        self.inner.publish(&[QueueEvent::FailedToSendMessagesTo {
            endpoint: endpoint.clone(),
        }]);
        self.inner.signal();
        Ok(failure)
    }

    /// Wait until no committed message is waiting for the transport
    pub fn wait_for_all_messages_to_be_sent(&self, timeout: Duration) -> Result<()> {
        self.wait_for(timeout, || "messages still sending".to_string(), || {
            self.inner.ensure_open()?;
            let sending = self.inner.storage.global(|a| a.messages_currently_sending())?;
            Ok(sending.is_empty().then_some(()))
        })
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Trim processed and sent history according to the configuration
    pub fn purge_history(&self) -> Result<PurgeOutcome> {
        self.inner.ensure_open()?;
        let retention = &self.inner.retention;
        Ok(self
            .inner
            .storage
            .global(|a| a.purge_history(retention, Utc::now()))?)
    }

    /// Compact the write-ahead log
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.ensure_open()?;
        Ok(self.inner.storage.store().checkpoint()?)
    }

    /// Shut down, letting in-flight transactions finish first
    ///
    /// New operations fail with [`Error::Disposed`] immediately. Enlistments
    /// that have not completed within `dispose_timeout_ms` are left to
    /// recovery.
    pub fn dispose(&self) -> Result<()> {
        if self
            .inner
            .lifecycle
            .compare_exchange(OPEN, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        info!(id = %self.id(), "disposing queue manager");
        self.inner.signal();

        let deadline = Instant::now() + self.inner.config.dispose_timeout();
        {
            let mut enlistments = self.inner.enlistments.lock();
            while !enlistments.is_empty() {
                if self
                    .inner
                    .drained
                    .wait_until(&mut enlistments, deadline)
                    .timed_out()
                {
                    warn!(
                        in_flight = enlistments.len(),
                        "dispose timed out waiting for transactions"
                    );
                    break;
                }
            }
        }

        self.inner.lifecycle.store(DISPOSED, Ordering::Release);
        self.inner.storage.store().flush()?;
        Ok(())
    }

    /// Shut down now; in-flight transactions fail and are left to recovery
    pub fn dispose_rudely(&self) {
        let previous = self.inner.lifecycle.swap(DISPOSED, Ordering::AcqRel);
        if previous == DISPOSED {
            return;
        }
        let in_flight = self.inner.enlistments.lock().len();
        warn!(id = %self.id(), in_flight, "disposing queue manager rudely");
        self.inner.signal();
    }

    /// Check if the queue manager was disposed
    pub fn is_disposed(&self) -> bool {
        self.inner.lifecycle.load(Ordering::Acquire) != OPEN
    }

    /// Retry `attempt` after every committed change until it yields a value
    fn wait_for<T>(
        &self,
        timeout: Duration,
        describe: impl Fn() -> String,
        mut attempt: impl FnMut() -> Result<Option<T>>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.inner.generation.lock();
            if let Some(value) = attempt()? {
                return Ok(value);
            }
            let mut generation = self.inner.generation.lock();
            while *generation == seen {
                if self
                    .inner
                    .changed
                    .wait_until(&mut generation, deadline)
                    .timed_out()
                {
                    return Err(Error::Timeout(describe()));
                }
            }
        }
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("id", &self.id())
            .field("endpoint", self.endpoint())
            .field("path", &self.path())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Builder for queue manager configuration.
///
/// # Example
///
/// ```ignore
/// let qm = QueueManager::builder()
///     .path("./queues")
///     .endpoint(Endpoint::new("localhost", 2200))
///     .max_send_attempts(20)
///     .coordinator(coordinator)
///     .open()?;
/// ```
pub struct QueueManagerBuilder {
    config: QueueManagerConfig,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
}

impl QueueManagerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: QueueManagerConfig::default(),
            coordinator: None,
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: QueueManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the store directory
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    /// Set the local endpoint
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    /// No WAL; nothing survives the process
    pub fn no_durability(mut self) -> Self {
        self.config.durability = DurabilityMode::None;
        self
    }

    /// fsync every commit (default)
    pub fn strict(mut self) -> Self {
        self.config.durability = DurabilityMode::Strict;
        self
    }

    /// fsync every `batch_size` commits or `interval_ms`
    pub fn batched(mut self, interval_ms: u64, batch_size: usize) -> Self {
        self.config.durability = DurabilityMode::Batched {
            interval_ms,
            batch_size,
        };
        self
    }

    /// History retention
    pub fn history(mut self, history: HistoryConfig) -> Self {
        self.config.history = history;
        self
    }

    /// Failed transmissions before a message is given up
    pub fn max_send_attempts(mut self, attempts: u32) -> Self {
        self.config.max_send_attempts = attempts;
        self
    }

    /// How long `dispose` waits for in-flight transactions
    pub fn dispose_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispose_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Coordinator consulted by recovery
    pub fn coordinator(mut self, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Open the queue manager.
    pub fn open(self) -> Result<QueueManager> {
        let coordinator = self
            .coordinator
            .ok_or_else(|| Error::Config("a transaction coordinator is required".into()))?;
        QueueManager::open(self.config, coordinator)
    }
}

impl Default for QueueManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
