//! Shared type definitions for the Skirmish combat telemetry pipeline.
//!
//! This crate is the single source of truth for the records that flow
//! through the processing topology and out to the query API.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe string wrappers for arena, round, and player ids
//! - [`arena`] -- Arena reference data
//! - [`round`] -- Raw round payloads, validated rounds, and per-player events
//! - [`victory`] -- Victory decisions and their decision key

pub mod arena;
pub mod ids;
pub mod round;
pub mod victory;

// Re-export all public types at crate root for convenience.
pub use arena::Arena;
pub use ids::{ArenaId, PlayerId, RoundId};
pub use round::{PlayerContribution, PlayerEvent, Round, RoundPayload};
pub use victory::{DecisionKey, VictoryRecord};
