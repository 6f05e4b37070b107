//! Victory detection.
//!
//! The detector collects the player events of each round until every
//! participant has arrived, decides the winner, and emits the decision
//! unless the victory window already holds one for the same arena and
//! round. The window is first-write-wins: a replayed round inside the
//! retention horizon is suppressed, one arriving after it is decided
//! again.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use skirmish_types::{DecisionKey, PlayerEvent, PlayerId, VictoryRecord};
use tracing::{debug, info, warn};

use crate::processor::{InitContext, Payload, ProcessContext, ProcessError, Processor, Record};
use crate::stores::VictoryStore;
use crate::topology::TopologyError;

/// Pick the winner: highest metric, then earliest event time, then the
/// lexically smallest player id.
pub fn decide_winner<'a>(events: impl IntoIterator<Item = &'a PlayerEvent>) -> Option<&'a PlayerEvent> {
    events.into_iter().min_by(|a, b| {
        b.metric
            .cmp(&a.metric)
            .then_with(|| a.event_time.cmp(&b.event_time))
            .then_with(|| a.player_id.cmp(&b.player_id))
    })
}

/// Build the decision for a completed round.
pub fn decide(events: &[PlayerEvent], decided_at: DateTime<Utc>) -> Option<VictoryRecord> {
    let winner = decide_winner(events)?;
    Some(VictoryRecord {
        round_id: winner.round_id.clone(),
        arena_id: winner.arena_id.clone(),
        arena_name: events
            .iter()
            .find_map(|e| e.arena.as_ref().map(|a| a.name.clone())),
        winner_id: winner.player_id.clone(),
        winning_metric: winner.metric,
        decided_at,
    })
}

/// A round still waiting for participants.
#[derive(Debug)]
struct PendingRound {
    event_time: DateTime<Utc>,
    expected: u32,
    events: BTreeMap<PlayerId, PlayerEvent>,
}

impl PendingRound {
    fn is_complete(&self) -> bool {
        u32::try_from(self.events.len()).is_ok_and(|n| n >= self.expected)
    }
}

/// Accumulates player events per round and emits deduplicated victories.
#[derive(Debug, Default)]
pub struct VictoryDetector {
    store: Option<VictoryStore>,
    pending: HashMap<DecisionKey, PendingRound>,
    next_sweep: Option<DateTime<Utc>>,
    decided: u64,
}

impl VictoryDetector {
    /// A detector that takes its window store on init.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rounds still waiting for participants.
    pub fn pending_rounds(&self) -> usize {
        self.pending.len()
    }

    /// Drop pending rounds that fell behind the retention horizon. Runs at
    /// most once per bucket width of stream time.
    fn evict_stale(&mut self, context: &mut ProcessContext<'_>) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(now) = store.stream_time() else {
            return;
        };
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        let config = store.config();
        let bucket = TimeDelta::from_std(config.bucket_size).unwrap_or(TimeDelta::MAX);
        let retention = TimeDelta::from_std(config.retention()).unwrap_or(TimeDelta::MAX);
        self.next_sweep = now.checked_add_signed(bucket);
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return;
        };

        let before = self.pending.len();
        self.pending.retain(|key, round| {
            let keep = round.event_time >= cutoff;
            if !keep {
                warn!(
                    %key,
                    received = round.events.len(),
                    expected = round.expected,
                    event_time = %round.event_time,
                    "Abandoning incomplete round outside retention"
                );
            }
            keep
        });
        context.record_abandoned(before.saturating_sub(self.pending.len()));
    }
}

impl Processor for VictoryDetector {
    fn init(&mut self, context: &mut InitContext<'_>) -> Result<(), TopologyError> {
        self.store = Some(context.victory_store()?);
        Ok(())
    }

    fn process(&mut self, record: Record, context: &mut ProcessContext<'_>) -> Result<(), ProcessError> {
        let found = record.payload.kind();
        let arrival = record.arrival;
        let Payload::Player(event) = record.payload else {
            return Err(ProcessError::UnexpectedPayload {
                node: context.node().to_owned(),
                found,
            });
        };
        let Some(store) = self.store.as_mut() else {
            return Err(ProcessError::NotInitialized {
                node: context.node().to_owned(),
            });
        };

        let round_time = record.timestamp;
        store.advance(round_time);
        self.evict_stale(context);

        let key = DecisionKey::new(event.arena_id.clone(), event.round_id.clone());
        let round = self.pending.entry(key.clone()).or_insert_with(|| PendingRound {
            event_time: round_time,
            expected: event.participants,
            events: BTreeMap::new(),
        });
        if event.participants != round.expected {
            warn!(
                %key,
                expected = round.expected,
                got = event.participants,
                "Participant count disagrees within round, keeping first"
            );
        }
        if round.events.contains_key(&event.player_id) {
            debug!(%key, player_id = %event.player_id, "Duplicate player event ignored");
            return Ok(());
        }
        round.events.insert(event.player_id.clone(), event);
        if !round.is_complete() {
            return Ok(());
        }

        let Some(round) = self.pending.remove(&key) else {
            return Ok(());
        };
        let events: Vec<PlayerEvent> = round.events.into_values().collect();
        let Some(victory) = decide(&events, round.event_time) else {
            return Ok(());
        };
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };

        if store.contains(&key) {
            debug!(%key, "Victory already decided within window, suppressing");
            context.record_suppressed();
            return Ok(());
        }
        if !store.put(key.clone(), victory.clone(), round.event_time) {
            debug!(%key, event_time = %round.event_time, "Round older than retention, not stored");
        }
        self.decided = self.decided.saturating_add(1);
        debug!(
            %key,
            winner = %victory.winner_id,
            metric = victory.winning_metric,
            "Victory decided"
        );
        context.forward(Record {
            key: Some(key.to_string()),
            timestamp: round.event_time,
            arrival,
            payload: Payload::Victory(victory),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ProcessError> {
        if let Some(store) = self.store.as_mut() {
            store.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProcessError> {
        self.commit()?;
        info!(
            decided = self.decided,
            pending = self.pending.len(),
            stream_time = ?self.store.as_ref().and_then(VictoryStore::stream_time),
            "Victory detector closed"
        );
        Ok(())
    }
}
