// Broker capabilities consumed and produced by the bridge

pub mod memory;

pub use crate::errors::BrokerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use uuid::Uuid;

pub use memory::{MemoryBroker, MemoryEnvelope, MemoryExchange, MemoryQueue};

/// Message attributes (headers, content type, delivery mode, ...)
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Queue side of a broker. Fetching never blocks: an empty queue yields `Ok(None)`.
#[cfg_attr(test, mockall::automock(type Envelope = String;))]
pub trait Queue {
    /// One delivered message together with its delivery metadata
    type Envelope;

    fn fetch_next(&self) -> Result<Option<Self::Envelope>, BrokerError>;
}

/// Exchange side of a broker. Publishing either succeeds or fails synchronously.
#[cfg_attr(test, mockall::automock)]
pub trait Exchange {
    fn publish(&self, message: &PendingMessage) -> Result<(), BrokerError>;
}

/// AMQP publish flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublishFlags(u32);

impl PublishFlags {
    pub const NONE: Self = Self(0);
    /// Fail the publish when the message cannot be routed to any queue
    pub const MANDATORY: Self = Self(1);
    pub const IMMEDIATE: Self = Self(2);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PublishFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<u32> for PublishFlags {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

/// A message waiting in a producer's buffer for the next tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    /// Correlation ID assigned when the message is buffered
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub flags: PublishFlags,
    pub attributes: Attributes,
    /// Timestamp when the message entered the buffer
    pub queued_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn new(
        payload: impl Into<Vec<u8>>,
        routing_key: impl Into<String>,
        flags: PublishFlags,
        attributes: Attributes,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
            routing_key: routing_key.into(),
            flags,
            attributes,
            queued_at: Utc::now(),
        }
    }

    /// Payload as UTF-8, replacing invalid sequences
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl fmt::Display for PendingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> '{}' ({} bytes)",
            self.id,
            self.routing_key,
            self.payload.len()
        )
    }
}
