//! The combat telemetry topology.
//!
//! ```text
//! arenas --> arena-upsert          (owns arena-store)
//! rounds --> round-intake --> player-correlator --> victory-detector --> results
//!                             (reads arena-store)   (owns victory-store)
//! ```

use std::sync::Arc;

use crate::arena_upsert::ArenaUpsert;
use crate::config::SkirmishConfig;
use crate::correlator::PlayerCorrelator;
use crate::feed::{ARENAS_TOPIC, RESULTS_TOPIC, ROUNDS_TOPIC};
use crate::intake::RoundIntake;
use crate::stores::{ARENA_STORE, VICTORY_STORE};
use crate::time::{PayloadTimestampExtractor, TimestampExtractor};
use crate::topology::{StoreAccess, StoreScope, Topology, TopologyBuilder, TopologyError};
use crate::victory::VictoryDetector;

/// Source node of the arena feed.
pub const ARENA_SOURCE: &str = "arena-source";
/// Arena registry writer.
pub const ARENA_UPSERT: &str = "arena-upsert";
/// Source node of the round feed.
pub const ROUND_SOURCE: &str = "round-source";
/// Round decoder and fan-out.
pub const ROUND_INTAKE: &str = "round-intake";
/// Arena join.
pub const PLAYER_CORRELATOR: &str = "player-correlator";
/// Winner decision and deduplication.
pub const VICTORY_DETECTOR: &str = "victory-detector";
/// Sink of the results feed.
pub const RESULTS_SINK: &str = "results-sink";

/// Build the topology configured by `config`.
pub fn combat_topology(config: &SkirmishConfig) -> Result<Topology, TopologyError> {
    let extractor: Arc<dyn TimestampExtractor> = Arc::new(PayloadTimestampExtractor::new(
        config.intake.timestamp_fallback,
        config.intake.sentinel_time().unwrap_or_default(),
    ));
    let unresolved = config.correlator.unresolved_arena;

    TopologyBuilder::new()
        .add_source(ARENA_SOURCE, ARENAS_TOPIC)?
        .add_processor(ARENA_UPSERT, || Box::new(ArenaUpsert::new()), &[ARENA_SOURCE])?
        .add_source(ROUND_SOURCE, ROUNDS_TOPIC)?
        .add_processor(
            ROUND_INTAKE,
            move || Box::new(RoundIntake::new(Arc::clone(&extractor))),
            &[ROUND_SOURCE],
        )?
        .add_processor(
            PLAYER_CORRELATOR,
            move || Box::new(PlayerCorrelator::new(unresolved)),
            &[ROUND_INTAKE],
        )?
        .add_processor(VICTORY_DETECTOR, || Box::new(VictoryDetector::new()), &[PLAYER_CORRELATOR])?
        .add_sink(RESULTS_SINK, RESULTS_TOPIC, &[VICTORY_DETECTOR])?
        .add_state_store(ARENA_STORE, StoreScope::Global)?
        .add_state_store(VICTORY_STORE, StoreScope::Partitioned)?
        .connect_store(ARENA_STORE, ARENA_UPSERT, StoreAccess::Owner)?
        .connect_store(ARENA_STORE, PLAYER_CORRELATOR, StoreAccess::ReadOnly)?
        .connect_store(VICTORY_STORE, VICTORY_DETECTOR, StoreAccess::Owner)?
        .build()
}
