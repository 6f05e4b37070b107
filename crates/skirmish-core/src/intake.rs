//! Round intake: decode, validate, resolve event time, fan out.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use skirmish_types::{PlayerEvent, Round, RoundPayload};
use tracing::{debug, warn};

use crate::processor::{Payload, ProcessContext, ProcessError, Processor, Record};
use crate::time::TimestampExtractor;

/// Decode and validate a raw round payload.
///
/// Duplicate player ids keep their first contribution.
///
/// # Errors
///
/// [`ProcessError::Poison`] for undecodable or incomplete rounds and
/// [`ProcessError::TimeExtraction`] when the extractor rejects the round.
pub fn decode_round(
    bytes: &[u8],
    arrival: DateTime<Utc>,
    extractor: &dyn TimestampExtractor,
) -> Result<Round, ProcessError> {
    let payload: RoundPayload = serde_json::from_slice(bytes).map_err(|e| ProcessError::Poison {
        reason: format!("invalid round payload: {e}"),
    })?;
    let Some(round_id) = payload.round_id.clone() else {
        return Err(ProcessError::Poison {
            reason: "round is missing round_id".to_owned(),
        });
    };
    let Some(arena_id) = payload.arena_id.clone() else {
        return Err(ProcessError::Poison {
            reason: format!("round {round_id} is missing arena_id"),
        });
    };
    if payload.players.is_empty() {
        return Err(ProcessError::Poison {
            reason: format!("round {round_id} has no players"),
        });
    }
    let event_time = extractor.extract(&payload, arrival)?;
    let players = payload.players;

    let mut seen = BTreeSet::new();
    let mut distinct = Vec::with_capacity(players.len());
    for contribution in players {
        if seen.insert(contribution.player_id.clone()) {
            distinct.push(contribution);
        } else {
            warn!(
                %round_id,
                player_id = %contribution.player_id,
                "Duplicate player in round, keeping first contribution"
            );
        }
    }

    Ok(Round {
        round_id,
        arena_id,
        event_time,
        players: distinct,
    })
}

/// Fan a round out into one event per participant.
pub fn fan_out(round: Round) -> Result<Vec<PlayerEvent>, ProcessError> {
    let participants = u32::try_from(round.players.len()).map_err(|e| ProcessError::Poison {
        reason: format!("round {} has too many players: {e}", round.round_id),
    })?;
    Ok(round
        .players
        .into_iter()
        .map(|c| PlayerEvent {
            round_id: round.round_id.clone(),
            arena_id: round.arena_id.clone(),
            player_id: c.player_id,
            metric: c.metric,
            event_time: c.at.unwrap_or(round.event_time),
            participants,
            arena: None,
            unresolved_arena: false,
        })
        .collect())
}

/// Turns raw round records into per-player records stamped with the
/// round's event time.
pub struct RoundIntake {
    extractor: Arc<dyn TimestampExtractor>,
}

impl RoundIntake {
    /// Intake resolving event time with `extractor`.
    pub fn new(extractor: Arc<dyn TimestampExtractor>) -> Self {
        Self { extractor }
    }
}

impl Processor for RoundIntake {
    fn process(&mut self, record: Record, context: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let Payload::Raw(bytes) = &record.payload else {
            return Err(ProcessError::UnexpectedPayload {
                node: context.node().to_owned(),
                found: record.payload.kind(),
            });
        };

        let round = decode_round(bytes, record.arrival, self.extractor.as_ref())?;
        let event_time = round.event_time;
        let key = round.round_id.to_string();
        debug!(
            round_id = %round.round_id,
            arena_id = %round.arena_id,
            players = round.players.len(),
            %event_time,
            lag_ms = record.arrival.signed_duration_since(event_time).num_milliseconds(),
            "Round accepted"
        );

        for event in fan_out(round)? {
            context.forward(record.derive(Some(key.clone()), event_time, Payload::Player(event)));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RoundIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundIntake").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::feed::InboundRecord;
    use crate::task::TaskMetrics;
    use crate::time::PayloadTimestampExtractor;

    const T: i64 = 1_700_000_000_000;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn run(payload: &str, arrival: DateTime<Utc>) -> Result<Vec<Record>, ProcessError> {
        let mut intake = RoundIntake::new(Arc::new(PayloadTimestampExtractor::rejecting()));
        let mut metrics = TaskMetrics::default();
        let mut context = ProcessContext::new("round-intake", 0, &mut metrics);
        let record = Record::from_inbound(InboundRecord::keyed("r-1", payload).arrived_at(arrival));
        intake.process(record, &mut context)?;
        Ok(context.into_forwarded())
    }

    #[test]
    fn windowed_at_event_time_not_arrival() {
        let arrival = ts(T) + TimeDelta::seconds(60);
        let out = run(
            &format!(r#"{{"round_id":"r-1","arena_id":"a","event_time":{T},"players":[{{"player_id":"A","metric":1}}]}}"#),
            arrival,
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        let record = out.first().unwrap();
        assert_eq!(record.timestamp, ts(T));
        assert_eq!(record.arrival, arrival);
    }

    #[test]
    fn fans_out_one_event_per_distinct_player() {
        let out = run(
            r#"{"round_id":"r-1","arena_id":"a","event_time":"2024-01-01T00:00:00Z","players":[
                {"player_id":"A","metric":5},
                {"player_id":"B","metric":3},
                {"player_id":"A","metric":99}
            ]}"#,
            ts(T),
        )
        .unwrap();
        let events: Vec<&PlayerEvent> = out
            .iter()
            .filter_map(|r| match &r.payload {
                Payload::Player(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.participants == 2));
        assert_eq!(events.first().map(|e| e.metric), Some(5));
        assert!(out.iter().all(|r| r.key.as_deref() == Some("r-1")));
    }

    #[test]
    fn contribution_time_overrides_round_time() {
        let out = run(
            r#"{"round_id":"r-1","arena_id":"a","event_time":"2024-01-01T00:00:00Z","players":[
                {"player_id":"A","metric":5,"at":"2024-01-01T00:00:02Z"}
            ]}"#,
            ts(T),
        )
        .unwrap();
        let event_time = out
            .first()
            .and_then(|r| match &r.payload {
                Payload::Player(e) => Some(e.event_time),
                _ => None,
            })
            .unwrap();
        assert_eq!(event_time.to_rfc3339(), "2024-01-01T00:00:02+00:00");
    }

    #[test]
    fn missing_round_id_is_poison() {
        let result = run(
            r#"{"arena_id":"a","event_time":1,"players":[{"player_id":"A","metric":1}]}"#,
            ts(T),
        );
        assert!(matches!(result, Err(ProcessError::Poison { reason }) if reason.contains("round_id")));
    }

    #[test]
    fn invalid_json_and_empty_rounds_are_poison() {
        assert!(matches!(run("{", ts(T)), Err(ProcessError::Poison { .. })));
        assert!(matches!(
            run(r#"{"round_id":"r","arena_id":"a","event_time":1,"players":[]}"#, ts(T)),
            Err(ProcessError::Poison { .. })
        ));
    }

    #[test]
    fn missing_event_time_is_rejected_by_default() {
        let result = run(
            r#"{"round_id":"r","arena_id":"a","players":[{"player_id":"A","metric":1}]}"#,
            ts(T),
        );
        assert!(matches!(result, Err(ProcessError::TimeExtraction { .. })));
    }
}
