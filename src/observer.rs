//! Queue events and their observers
//!
//! Events raised inside an ambient transaction are held until it commits;
//! a rolled-back transaction raises nothing. Transport callbacks
//! (`mark_sent`, `failed_to_send_to`) raise their events immediately.

use ferry_core::{Endpoint, Message};

/// Something observable happened to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A message was committed for transmission
    MessageQueuedForSend {
        /// The message
        message: Message,
        /// Where it is going
        endpoint: Endpoint,
    },
    /// The transport confirmed delivery
    MessageSent {
        /// The message
        message: Message,
        /// Where it went
        endpoint: Endpoint,
    },
    /// A message was committed to a local queue
    MessageQueuedForReceive {
        /// The message
        message: Message,
    },
    /// A consumer's receive was committed
    MessageReceived {
        /// The message
        message: Message,
    },
    /// Transmission to an endpoint failed
    FailedToSendMessagesTo {
        /// The endpoint
        endpoint: Endpoint,
    },
}

impl QueueEvent {
    /// The message this event is about, if any
    pub fn message(&self) -> Option<&Message> {
        match self {
            QueueEvent::MessageQueuedForSend { message, .. }
            | QueueEvent::MessageSent { message, .. }
            | QueueEvent::MessageQueuedForReceive { message }
            | QueueEvent::MessageReceived { message } => Some(message),
            QueueEvent::FailedToSendMessagesTo { .. } => None,
        }
    }
}

/// Receives [`QueueEvent`]s
///
/// Called on the thread that completed the transaction. Keep it short.
pub trait QueueObserver: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &QueueEvent);
}

impl<F> QueueObserver for F
where
    F: Fn(&QueueEvent) + Send + Sync,
{
    fn on_event(&self, event: &QueueEvent) {
        self(event)
    }
}
