//! Records exchanged with the transport.
//!
//! The core never talks to a message broker. Inputs arrive as
//! [`InboundRecord`]s over bounded channels and sink output leaves as
//! [`OutboundRecord`]s; the binary bridges both to the wire.

use chrono::{DateTime, Utc};

/// Logical topic of arena upserts and tombstones.
pub const ARENAS_TOPIC: &str = "arenas";

/// Logical topic of round events.
pub const ROUNDS_TOPIC: &str = "rounds";

/// Logical topic of victory decisions.
pub const RESULTS_TOPIC: &str = "results";

/// A raw record as received from a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    /// Partitioning key, when the producer set one.
    pub key: Option<String>,
    /// Undecoded payload. Empty on an arena feed means delete.
    pub payload: Vec<u8>,
    /// When the record reached the pipeline.
    pub arrival: DateTime<Utc>,
}

impl InboundRecord {
    /// A record arriving now.
    pub fn new(key: Option<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
            arrival: Utc::now(),
        }
    }

    /// A keyed record arriving now.
    pub fn keyed(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(key.into()), payload)
    }

    /// Override the arrival time.
    #[must_use]
    pub const fn arrived_at(mut self, arrival: DateTime<Utc>) -> Self {
        self.arrival = arrival;
        self
    }
}

/// A record produced by a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Logical topic of the sink that produced it.
    pub topic: String,
    /// Record key.
    pub key: Option<String>,
    /// Encoded payload.
    pub payload: Vec<u8>,
}
