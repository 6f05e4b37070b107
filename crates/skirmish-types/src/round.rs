//! Round payloads and the per-player events fanned out from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arena::Arena;
use crate::ids::{ArenaId, PlayerId, RoundId};

/// A round as it arrives on the round feed, before validation.
///
/// Every field is optional at this stage so that a malformed payload can be
/// reported precisely instead of failing deserialization as a whole.
/// `event_time` is kept as raw JSON because producers send either an
/// RFC 3339 string or epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundPayload {
    /// Round identifier.
    #[serde(default)]
    pub round_id: Option<RoundId>,
    /// Arena the round was fought in.
    #[serde(default)]
    pub arena_id: Option<ArenaId>,
    /// Embedded event time, authoritative for windowing.
    #[serde(default)]
    pub event_time: Option<serde_json::Value>,
    /// Per-player contributions in the order the server reported them.
    #[serde(default)]
    pub players: Vec<PlayerContribution>,
}

/// One participant's contribution to a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerContribution {
    /// The participant.
    pub player_id: PlayerId,
    /// Score used to decide the winner. Higher wins.
    pub metric: i64,
    /// When the contribution was recorded. Defaults to the round's time.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// A validated round with its authoritative event time resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    /// Round identifier.
    pub round_id: RoundId,
    /// Arena the round was fought in.
    pub arena_id: ArenaId,
    /// Authoritative event time.
    pub event_time: DateTime<Utc>,
    /// Participants with duplicate player ids already removed.
    pub players: Vec<PlayerContribution>,
}

/// One participant's contribution, routed through the correlator and
/// accumulated by the victory detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEvent {
    /// Round the event belongs to.
    pub round_id: RoundId,
    /// Arena the round was fought in.
    pub arena_id: ArenaId,
    /// The participant.
    pub player_id: PlayerId,
    /// Score used to decide the winner.
    pub metric: i64,
    /// When the contribution happened (first tie-breaker).
    pub event_time: DateTime<Utc>,
    /// Number of distinct participants in the source round.
    pub participants: u32,
    /// Arena reference data attached by the correlator.
    #[serde(default)]
    pub arena: Option<Arena>,
    /// Set when the arena could not be resolved at join time.
    #[serde(default)]
    pub unresolved_arena: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn payload_tolerates_missing_fields() {
        let payload: RoundPayload = serde_json::from_str(r#"{"players":[]}"#).unwrap();
        assert!(payload.round_id.is_none());
        assert!(payload.arena_id.is_none());
        assert!(payload.event_time.is_none());
    }

    #[test]
    fn contribution_time_is_optional() {
        let c: PlayerContribution =
            serde_json::from_str(r#"{"player_id":"A","metric":5}"#).unwrap();
        assert_eq!(c.metric, 5);
        assert!(c.at.is_none());
    }
}
