//! Victory decisions and the key they are stored and emitted under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ArenaId, PlayerId, RoundId};

/// Key a victory is deduplicated, stored, and emitted under.
///
/// Ordering is arena first, then round, so all decisions of one arena form
/// a contiguous run in an ordered map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DecisionKey {
    /// Arena the round was fought in.
    pub arena_id: ArenaId,
    /// The decided round.
    pub round_id: RoundId,
}

impl DecisionKey {
    /// Create a decision key.
    pub fn new(arena_id: impl Into<ArenaId>, round_id: impl Into<RoundId>) -> Self {
        Self {
            arena_id: arena_id.into(),
            round_id: round_id.into(),
        }
    }

    /// The smallest key belonging to `arena_id`.
    pub fn arena_floor(arena_id: &ArenaId) -> Self {
        Self {
            arena_id: arena_id.clone(),
            round_id: RoundId::new(String::new()),
        }
    }
}

impl core::fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.arena_id, self.round_id)
    }
}

/// The decided winner of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VictoryRecord {
    /// The decided round.
    pub round_id: RoundId,
    /// Arena the round was fought in.
    pub arena_id: ArenaId,
    /// Arena display name, when the arena was resolved at join time.
    #[serde(default)]
    pub arena_name: Option<String>,
    /// The winning player.
    pub winner_id: PlayerId,
    /// The winner's metric.
    pub winning_metric: i64,
    /// Event time of the round. Replays decide with the same value.
    pub decided_at: DateTime<Utc>,
}

impl VictoryRecord {
    /// The key this record is stored and emitted under.
    pub fn decision_key(&self) -> DecisionKey {
        DecisionKey {
            arena_id: self.arena_id.clone(),
            round_id: self.round_id.clone(),
        }
    }
}
