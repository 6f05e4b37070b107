//! Player correlator: joins player events against the arena registry.
//!
//! Stateless apart from the registry handle. The registry is updated by a
//! different task, so a lookup may see an arena slightly late; events are
//! never held back waiting for one.

use tracing::debug;

use crate::config::UnresolvedArenaPolicy;
use crate::processor::{InitContext, Payload, ProcessContext, ProcessError, Processor, Record};
use crate::stores::ArenaReader;
use crate::topology::TopologyError;

/// Attaches arena metadata to each player event.
#[derive(Debug)]
pub struct PlayerCorrelator {
    policy: UnresolvedArenaPolicy,
    arenas: Option<ArenaReader>,
}

impl PlayerCorrelator {
    /// Correlator applying `policy` to events whose arena is unknown.
    pub const fn new(policy: UnresolvedArenaPolicy) -> Self {
        Self {
            policy,
            arenas: None,
        }
    }
}

impl Processor for PlayerCorrelator {
    fn init(&mut self, context: &mut InitContext<'_>) -> Result<(), TopologyError> {
        self.arenas = Some(context.arena_reader()?);
        Ok(())
    }

    fn process(&mut self, mut record: Record, context: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let Some(arenas) = &self.arenas else {
            return Err(ProcessError::NotInitialized {
                node: context.node().to_owned(),
            });
        };
        let found = record.payload.kind();
        let Payload::Player(event) = &mut record.payload else {
            return Err(ProcessError::UnexpectedPayload {
                node: context.node().to_owned(),
                found,
            });
        };

        match arenas.get(&event.arena_id) {
            Some(arena) => {
                event.arena = Some(arena);
                event.unresolved_arena = false;
            }
            None if self.policy == UnresolvedArenaPolicy::Drop => {
                return Err(ProcessError::UnresolvedArena {
                    arena_id: event.arena_id.clone(),
                });
            }
            None => {
                debug!(
                    round_id = %event.round_id,
                    arena_id = %event.arena_id,
                    "Arena unresolved, forwarding flagged"
                );
                event.unresolved_arena = true;
            }
        }
        context.forward(record);
        Ok(())
    }
}
