//! Queue manager configuration
//!
//! [`QueueManagerConfig`] is plain data: build it in code, through
//! [`QueueManager::builder`](crate::QueueManager::builder), or load it from
//! TOML.
//!
//! # Config File Format
//!
//! ```toml
//! path = "/var/lib/ferry/orders"
//! max_send_attempts = 50
//!
//! [endpoint]
//! host = "localhost"
//! port = 2200
//!
//! [durability]
//! mode = "batched"
//! interval_ms = 50
//! batch_size = 500
//!
//! [history]
//! enable_processed_message_history = true
//! number_of_messages_to_keep_in_processed_history = 100
//! oldest_message_in_processed_history_secs = 259200
//! ```
//!
//! Every field is optional; missing fields take the defaults below.

use crate::error::{Error, Result};
use chrono::Duration;
use ferry_core::Endpoint;
use ferry_durability::DurabilityMode;
use ferry_engine::HistoryRetention;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default port for the local endpoint
pub const DEFAULT_PORT: u16 = 2200;

const THREE_DAYS_SECS: u64 = 3 * 24 * 60 * 60;

/// History retention, as it appears in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Keep received messages in the processed history
    pub enable_processed_message_history: bool,
    /// Keep transmitted messages in the outgoing history
    pub enable_outgoing_message_history: bool,
    /// Newest processed messages per queue that are never purged
    pub number_of_messages_to_keep_in_processed_history: usize,
    /// Newest sent messages that are never purged
    pub number_of_messages_to_keep_in_outgoing_history: usize,
    /// Age after which older processed messages are purged
    pub oldest_message_in_processed_history_secs: u64,
    /// Age after which older sent messages are purged
    pub oldest_message_in_outgoing_history_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enable_processed_message_history: true,
            enable_outgoing_message_history: true,
            number_of_messages_to_keep_in_processed_history: 100,
            number_of_messages_to_keep_in_outgoing_history: 100,
            oldest_message_in_processed_history_secs: THREE_DAYS_SECS,
            oldest_message_in_outgoing_history_secs: THREE_DAYS_SECS,
        }
    }
}

impl HistoryConfig {
    /// Retention rules handed to the message tables
    pub fn retention(&self) -> HistoryRetention {
        HistoryRetention {
            enable_processed_history: self.enable_processed_message_history,
            enable_outgoing_history: self.enable_outgoing_message_history,
            processed_to_keep: self.number_of_messages_to_keep_in_processed_history,
            outgoing_to_keep: self.number_of_messages_to_keep_in_outgoing_history,
            oldest_processed: secs(self.oldest_message_in_processed_history_secs),
            oldest_outgoing: secs(self.oldest_message_in_outgoing_history_secs),
        }
    }
}

fn secs(value: u64) -> Duration {
    let value = i64::try_from(value).unwrap_or(i64::MAX);
    Duration::seconds(value.min(i64::MAX / 1000))
}

/// Configuration of one [`QueueManager`](crate::QueueManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueManagerConfig {
    /// Store directory; required unless durability is `none`
    pub path: Option<PathBuf>,
    /// Endpoint this queue manager is reachable at
    pub endpoint: Endpoint,
    /// WAL durability
    pub durability: DurabilityMode,
    /// History retention
    pub history: HistoryConfig,
    /// Failed transmissions before a message is given up
    pub max_send_attempts: u32,
    /// How long `dispose` waits for in-flight transactions
    pub dispose_timeout_ms: u64,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            path: None,
            endpoint: Endpoint::new("localhost", DEFAULT_PORT),
            durability: DurabilityMode::default(),
            history: HistoryConfig::default(),
            max_send_attempts: 100,
            dispose_timeout_ms: 30_000,
        }
    }
}

impl QueueManagerConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Reject combinations the queue manager cannot open with
    pub fn validate(&self) -> Result<()> {
        if self.path.is_none() && self.durability.requires_wal() {
            return Err(Error::Config(format!(
                "durability mode {:?} needs a store path",
                self.durability
            )));
        }
        if self.max_send_attempts == 0 {
            return Err(Error::Config("max_send_attempts must be at least 1".into()));
        }
        if let DurabilityMode::Batched { batch_size: 0, .. } = self.durability {
            return Err(Error::Config("batched durability needs batch_size > 0".into()));
        }
        Ok(())
    }

    /// `dispose_timeout_ms` as a duration
    pub fn dispose_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dispose_timeout_ms)
    }
}
