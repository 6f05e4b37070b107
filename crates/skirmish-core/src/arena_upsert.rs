//! Arena registry maintenance.
//!
//! Every record on the arena feed is a full arena record. A non-empty
//! payload replaces whatever the registry holds for that arena; an empty
//! payload is a tombstone that deletes the arena named by the record key.
//! Nothing is forwarded.

use skirmish_types::{Arena, ArenaId};
use tracing::{debug, info, warn};

use crate::processor::{InitContext, Payload, ProcessContext, ProcessError, Processor, Record};
use crate::stores::ArenaRegistry;
use crate::topology::TopologyError;

/// Applies arena upserts and tombstones to the registry.
#[derive(Debug, Default)]
pub struct ArenaUpsert {
    registry: Option<ArenaRegistry>,
    upserts: u64,
    deletes: u64,
}

impl ArenaUpsert {
    /// A processor that acquires the registry on init.
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self, node: &str) -> Result<&ArenaRegistry, ProcessError> {
        self.registry
            .as_ref()
            .ok_or_else(|| ProcessError::NotInitialized {
                node: node.to_owned(),
            })
    }
}

impl Processor for ArenaUpsert {
    fn init(&mut self, context: &mut InitContext<'_>) -> Result<(), TopologyError> {
        self.registry = Some(context.arena_registry()?);
        Ok(())
    }

    fn process(&mut self, record: Record, context: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let found = record.payload.kind();
        let Payload::Raw(bytes) = record.payload else {
            return Err(ProcessError::UnexpectedPayload {
                node: context.node().to_owned(),
                found,
            });
        };

        if bytes.is_empty() {
            let Some(key) = record.key else {
                return Err(ProcessError::Poison {
                    reason: "arena tombstone without a key".to_owned(),
                });
            };
            let arena_id = ArenaId::new(key);
            let removed = self.registry(context.node())?.delete(&arena_id)?;
            self.deletes = self.deletes.saturating_add(1);
            debug!(%arena_id, existed = removed.is_some(), "Arena deleted");
            return Ok(());
        }

        let arena: Arena = serde_json::from_slice(&bytes).map_err(|e| ProcessError::Poison {
            reason: format!("invalid arena payload: {e}"),
        })?;
        if let Some(key) = record.key.as_deref()
            && key != arena.arena_id.as_str()
        {
            warn!(key, arena_id = %arena.arena_id, "Arena key differs from payload id, using payload id");
        }
        debug!(arena_id = %arena.arena_id, name = arena.name, "Arena upserted");
        self.registry(context.node())?.upsert(arena)?;
        self.upserts = self.upserts.saturating_add(1);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ProcessError> {
        if let Some(registry) = &self.registry
            && registry.compact_if_needed()?
        {
            debug!(arenas = registry.len(), "Arena changelog compacted");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProcessError> {
        if let Some(registry) = &self.registry {
            registry.flush()?;
            info!(
                arenas = registry.len(),
                upserts = self.upserts,
                deletes = self.deletes,
                "Arena registry closed"
            );
        }
        Ok(())
    }
}
