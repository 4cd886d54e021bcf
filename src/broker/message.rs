//! Message definitions for the delivery pipeline
//!
//! `Message` is what a producer hands to the publisher and what travels
//! through the broker as a JSON body. `DeliveryRecord` is what the worker
//! persists once it has processed a message.
//!
//! Notes on fields:
//! - `content`: required, carried through untouched
//! - `priority`: defaults to `1` when absent; an explicit `null` is kept.
//!   No range is enforced
//! - `timestamp`: ISO-8601, taken when the worker processes the message

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::RelayResult;

pub const DEFAULT_PRIORITY: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    #[serde(default = "default_priority")]
    pub priority: Option<i64>,
}

fn default_priority() -> Option<i64> {
    Some(DEFAULT_PRIORITY)
}

impl Message {
    pub fn new(content: impl Into<String>, priority: impl Into<Option<i64>>) -> Self {
        Self {
            content: content.into(),
            priority: priority.into(),
        }
    }

    /// Canonical wire encoding: a JSON object.
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Fails with `RelayError::Decode` when the body is not a JSON object
    /// with a string `content`.
    pub fn decode(body: &[u8]) -> RelayResult<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// One line of the durable log.
///
/// Field order is part of the on-disk format: `timestamp`, `content`,
/// `priority`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub timestamp: String,
    pub content: String,
    pub priority: Option<i64>,
}

impl DeliveryRecord {
    /// Stamps `message` with the current time.
    pub fn from_message(message: Message) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            content: message.content,
            priority: message.priority,
        }
    }
}
