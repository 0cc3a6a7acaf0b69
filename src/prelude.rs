//! Convenient imports for FerryDB.
//!
//! ```ignore
//! use ferrydb::prelude::*;
//!
//! let coordinator = LocalCoordinator::ephemeral()?;
//! let qm = QueueManager::ephemeral(coordinator.clone())?;
//! ```

// Main entry point
pub use crate::queue_manager::{QueueManager, QueueManagerBuilder};

// Configuration
pub use crate::config::{HistoryConfig, QueueManagerConfig};

// Error handling
pub use crate::error::{Error, Result};

// Events
pub use crate::observer::{QueueEvent, QueueObserver};

// Messages and addresses
pub use ferry_core::{Endpoint, Message, MessageId, MessagePayload, QueueUri};

// Ambient transactions
pub use ferry_durability::DurabilityMode;
pub use ferry_engine::{LocalCoordinator, LocalTransaction, TransactionContext};
