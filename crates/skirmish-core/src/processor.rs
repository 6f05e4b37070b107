//! The processing unit seam.
//!
//! A [`Processor`] is one node of a sub-topology. It is built by a factory
//! once per task, initialized with an [`InitContext`] that hands out the
//! store handles its node was granted, and then receives records one at a
//! time. Records it wants downstream go through
//! [`ProcessContext::forward`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use skirmish_store::StoreError;
use skirmish_types::{ArenaId, PlayerEvent, VictoryRecord};

use crate::feed::{InboundRecord, OutboundRecord};
use crate::stores::{ARENA_STORE, ArenaReader, ArenaRegistry, TaskStores, VICTORY_STORE, VictoryStore};
use crate::task::TaskMetrics;
use crate::topology::{StoreAccess, TopologyError};

/// Errors raised while processing a single record.
///
/// Only [`Storage`](Self::Storage) is fatal to a task. Every other kind
/// skips the offending record and the task moves on.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The payload could not be decoded or failed validation.
    #[error("poison record: {reason}")]
    Poison {
        /// What was wrong with it.
        reason: String,
    },

    /// The referenced arena is not registered.
    #[error("arena {arena_id} is not registered")]
    UnresolvedArena {
        /// The missing arena.
        arena_id: ArenaId,
    },

    /// No event time could be resolved.
    #[error("event time extraction failed: {reason}")]
    TimeExtraction {
        /// Why extraction failed.
        reason: String,
    },

    /// A node received a payload kind it does not handle.
    #[error("{node} cannot handle a {found} payload")]
    UnexpectedPayload {
        /// Receiving node.
        node: String,
        /// Kind of payload received.
        found: &'static str,
    },

    /// A record reached a processor before `init` ran.
    #[error("{node} received a record before it was initialized")]
    NotInitialized {
        /// The processor's node.
        node: String,
    },

    /// Output could not be encoded.
    #[error("failed to encode output: {source}")]
    Encode {
        /// The underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// A state store failed.
    #[error("storage fault: {source}")]
    Storage {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },
}

impl ProcessError {
    /// Whether the error requires the task to be rebuilt.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

/// Payload of a record moving through a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Undecoded bytes from a source.
    Raw(Vec<u8>),
    /// One participant of a round.
    Player(PlayerEvent),
    /// A decided round.
    Victory(VictoryRecord),
}

impl Payload {
    /// Short name of the payload kind, for diagnostics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Raw(_) => "raw",
            Self::Player(_) => "player",
            Self::Victory(_) => "victory",
        }
    }
}

/// A record moving through a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Record key.
    pub key: Option<String>,
    /// Event time once a processor resolved it, arrival time before.
    pub timestamp: DateTime<Utc>,
    /// When the source record reached the pipeline.
    pub arrival: DateTime<Utc>,
    /// The payload.
    pub payload: Payload,
}

impl Record {
    /// A record as it leaves a source node.
    pub fn from_inbound(inbound: InboundRecord) -> Self {
        Self {
            key: inbound.key,
            timestamp: inbound.arrival,
            arrival: inbound.arrival,
            payload: Payload::Raw(inbound.payload),
        }
    }

    /// A record derived from this one, keeping its arrival time.
    pub fn derive(&self, key: Option<String>, timestamp: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            key,
            timestamp,
            arrival: self.arrival,
            payload,
        }
    }

    /// Encode for a sink writing to `topic`. Raw payloads pass through,
    /// decoded ones are written as JSON.
    pub fn into_outbound(self, topic: &str) -> Result<OutboundRecord, ProcessError> {
        let payload = match self.payload {
            Payload::Raw(bytes) => bytes,
            Payload::Player(event) => serde_json::to_vec(&event)?,
            Payload::Victory(victory) => serde_json::to_vec(&victory)?,
        };
        Ok(OutboundRecord {
            topic: topic.to_owned(),
            key: self.key,
            payload,
        })
    }
}

/// A stage of a sub-topology.
pub trait Processor: Send {
    /// Acquire store handles. Called once before the first record.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError`] when the node asks for a store it was
    /// not granted.
    fn init(&mut self, context: &mut InitContext<'_>) -> Result<(), TopologyError> {
        let _ = context;
        Ok(())
    }

    /// Handle one record.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`]; see its docs for which kinds are fatal.
    fn process(&mut self, record: Record, context: &mut ProcessContext<'_>)
    -> Result<(), ProcessError>;

    /// Make state written since the last commit durable and visible.
    fn commit(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }

    /// Release resources. Called once when the task shuts down.
    fn close(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// Store access offered to a processor during [`Processor::init`].
pub struct InitContext<'a> {
    node: &'a str,
    partition: u32,
    access: &'a BTreeMap<String, StoreAccess>,
    stores: &'a mut TaskStores,
}

impl<'a> InitContext<'a> {
    pub(crate) const fn new(
        node: &'a str,
        partition: u32,
        access: &'a BTreeMap<String, StoreAccess>,
        stores: &'a mut TaskStores,
    ) -> Self {
        Self {
            node,
            partition,
            access,
            stores,
        }
    }

    /// Name of the node being initialized.
    pub const fn node(&self) -> &str {
        self.node
    }

    /// Partition of the owning task.
    pub const fn partition(&self) -> u32 {
        self.partition
    }

    /// Write handle on the arena registry. Requires ownership.
    pub fn arena_registry(&mut self) -> Result<ArenaRegistry, TopologyError> {
        self.require(ARENA_STORE, true)?;
        Ok(ArenaRegistry::from_shared(Arc::clone(&self.stores.arenas)))
    }

    /// Read-only handle on the arena registry.
    pub fn arena_reader(&self) -> Result<ArenaReader, TopologyError> {
        self.require(ARENA_STORE, false)?;
        Ok(ArenaReader::from_shared(Arc::clone(&self.stores.arenas)))
    }

    /// The task's victory window store. Requires ownership and can be
    /// taken once.
    pub fn victory_store(&mut self) -> Result<VictoryStore, TopologyError> {
        self.require(VICTORY_STORE, true)?;
        self.stores
            .victories
            .take()
            .ok_or_else(|| TopologyError::StoreUnavailable {
                store: VICTORY_STORE.to_owned(),
                node: self.node.to_owned(),
            })
    }

    fn require(&self, store: &str, owner: bool) -> Result<(), TopologyError> {
        match self.access.get(store) {
            Some(StoreAccess::Owner) => Ok(()),
            Some(StoreAccess::ReadOnly) if !owner => Ok(()),
            Some(StoreAccess::ReadOnly) => Err(TopologyError::ReadOnlyStore {
                store: store.to_owned(),
                node: self.node.to_owned(),
            }),
            None => Err(TopologyError::UndeclaredStoreAccess {
                store: store.to_owned(),
                node: self.node.to_owned(),
            }),
        }
    }
}

/// Per-record context passed to [`Processor::process`].
pub struct ProcessContext<'a> {
    node: &'a str,
    partition: u32,
    metrics: &'a mut TaskMetrics,
    forwarded: Vec<Record>,
}

impl<'a> ProcessContext<'a> {
    pub(crate) const fn new(node: &'a str, partition: u32, metrics: &'a mut TaskMetrics) -> Self {
        Self {
            node,
            partition,
            metrics,
            forwarded: Vec::new(),
        }
    }

    /// Name of the node processing the record.
    pub const fn node(&self) -> &str {
        self.node
    }

    /// Partition of the owning task.
    pub const fn partition(&self) -> u32 {
        self.partition
    }

    /// Send `record` to every child of this node.
    pub fn forward(&mut self, record: Record) {
        self.forwarded.push(record);
    }

    /// Count an emission suppressed by deduplication.
    pub const fn record_suppressed(&mut self) {
        self.metrics.suppressed = self.metrics.suppressed.saturating_add(1);
    }

    /// Count pending state abandoned without producing output.
    pub fn record_abandoned(&mut self, count: usize) {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        self.metrics.abandoned = self.metrics.abandoned.saturating_add(count);
    }

    pub(crate) fn into_forwarded(self) -> Vec<Record> {
        self.forwarded
    }
}
