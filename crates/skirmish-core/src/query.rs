//! Read-only queries over the victory windows of every partition.
//!
//! The service never touches a writer. Each call reads the snapshots the
//! partition tasks published at their last commit, so results reflect
//! committed state only.
//!
//! Partitions advance their stream time independently; a partition that
//! receives nothing keeps buckets its siblings have long moved past. The
//! service therefore applies the window's bucket rule against the largest
//! stream time of any partition before returning a value.

use std::iter::Peekable;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use skirmish_store::{Stamped, WindowConfig, WindowIter, WindowRange};
use skirmish_types::{ArenaId, DecisionKey, VictoryRecord};

use crate::stores::VictoryReader;

/// Which values are still inside the retention horizon.
#[derive(Debug, Clone, Copy)]
struct Horizon {
    window: WindowConfig,
    stream_time: Option<DateTime<Utc>>,
}

impl Horizon {
    fn admits(&self, stamped: &Stamped<VictoryRecord>) -> bool {
        self.stream_time
            .is_none_or(|now| self.window.is_live(stamped.timestamp, now))
    }
}

/// A restartable range of victories for one decision key.
///
/// Holds the snapshots it was created from; iterating again yields the
/// same records.
#[derive(Debug, Clone)]
pub struct VictoryRange {
    ranges: Vec<WindowRange<DecisionKey, VictoryRecord>>,
    horizon: Horizon,
}

impl VictoryRange {
    /// Iterate the range from the beginning, oldest first.
    pub fn iter(&self) -> VictoryIter<'_> {
        VictoryIter {
            heads: self.ranges.iter().map(|range| range.iter().peekable()).collect(),
            horizon: self.horizon,
        }
    }

    /// Collect the range into owned records.
    pub fn to_vec(&self) -> Vec<VictoryRecord> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a VictoryRange {
    type Item = &'a VictoryRecord;
    type IntoIter = VictoryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy merge of the per-partition ranges of a [`VictoryRange`], ordered
/// by decision time.
pub struct VictoryIter<'a> {
    heads: Vec<Peekable<WindowIter<'a, DecisionKey, VictoryRecord>>>,
    horizon: Horizon,
}

impl<'a> Iterator for VictoryIter<'a> {
    type Item = &'a VictoryRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut earliest: Option<(DateTime<Utc>, usize)> = None;
            for (i, head) in self.heads.iter_mut().enumerate() {
                if let Some(ts) = head.peek().map(|stamped| stamped.timestamp)
                    && earliest.is_none_or(|(best, _)| ts < best)
                {
                    earliest = Some((ts, i));
                }
            }
            let (_, i) = earliest?;
            let stamped = self.heads.get_mut(i)?.next()?;
            if self.horizon.admits(stamped) {
                return Some(&stamped.value);
            }
        }
    }
}

/// Query entry point shared with the HTTP layer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct VictoryQueryService {
    readers: Arc<[VictoryReader]>,
    window: WindowConfig,
}

impl VictoryQueryService {
    /// A service over one reader per partition, all windowed by `window`.
    pub fn new(readers: impl Into<Arc<[VictoryReader]>>, window: WindowConfig) -> Self {
        Self {
            readers: readers.into(),
            window,
        }
    }

    /// Number of partitions covered.
    pub fn partitions(&self) -> usize {
        self.readers.len()
    }

    /// Largest stream time published by any partition.
    pub fn stream_time(&self) -> Option<DateTime<Utc>> {
        self.readers
            .iter()
            .filter_map(|reader| reader.snapshot().stream_time())
            .max()
    }

    fn horizon(&self) -> Horizon {
        Horizon {
            window: self.window,
            stream_time: self.stream_time(),
        }
    }

    /// The most recent victory stored under `key`, or `None` when the key
    /// is not in any live window.
    pub fn query_latest_victory(&self, key: &DecisionKey) -> Option<VictoryRecord> {
        let horizon = self.horizon();
        self.readers
            .iter()
            .filter_map(|reader| reader.fetch_latest(key))
            .filter(|stamped| horizon.admits(stamped))
            .max_by_key(|stamped| stamped.timestamp)
            .map(|stamped| stamped.value)
    }

    /// Victories stored under `key` with `from <= decided_at <= to`.
    pub fn query_range(&self, key: &DecisionKey, from: DateTime<Utc>, to: DateTime<Utc>) -> VictoryRange {
        VictoryRange {
            horizon: self.horizon(),
            ranges: self
                .readers
                .iter()
                .map(|reader| reader.range(key.clone(), from, to))
                .collect(),
        }
    }

    /// The most recent victory of any round in `arena_id`.
    pub fn latest_in_arena(&self, arena_id: &ArenaId) -> Option<VictoryRecord> {
        self.range_in_arena(arena_id, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            .pop()
    }

    /// Every victory in `arena_id` with `from <= decided_at <= to`, oldest
    /// first.
    pub fn range_in_arena(&self, arena_id: &ArenaId, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<VictoryRecord> {
        let horizon = self.horizon();
        let start = DecisionKey::arena_floor(arena_id);
        let mut found: Vec<(DateTime<Utc>, VictoryRecord)> = Vec::new();
        for reader in self.readers.iter() {
            let snapshot = reader.snapshot();
            found.extend(
                snapshot
                    .fetch_run(&start, |key| key.arena_id == *arena_id, from, to)
                    .into_iter()
                    .filter(|(_, stamped)| horizon.admits(stamped))
                    .map(|(_, stamped)| (stamped.timestamp, stamped.value.clone())),
            );
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.round_id.cmp(&b.1.round_id)));
        found.into_iter().map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stores::VictoryStore;

    const T: i64 = 1_700_000_000_000;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(T.saturating_add(offset_secs.saturating_mul(1000))).unwrap()
    }

    fn victory(arena: &str, round: &str, winner: &str, at: DateTime<Utc>) -> VictoryRecord {
        VictoryRecord {
            round_id: round.into(),
            arena_id: arena.into(),
            arena_name: None,
            winner_id: winner.into(),
            winning_metric: 1,
            decided_at: at,
        }
    }

    fn store_with(records: &[VictoryRecord]) -> VictoryStore {
        let mut store = VictoryStore::in_memory("victories", WindowConfig::default());
        for record in records {
            store.put(record.decision_key(), record.clone(), record.decided_at);
        }
        store.publish();
        store
    }

    #[test]
    fn latest_merges_partitions() {
        let p0 = store_with(&[victory("a", "r-1", "A", ts(0))]);
        let p1 = store_with(&[victory("a", "r-2", "B", ts(5))]);
        let service = VictoryQueryService::new(vec![p0.reader(), p1.reader()], WindowConfig::default());

        let latest = service.query_latest_victory(&DecisionKey::new("a", "r-2")).unwrap();
        assert_eq!(latest.winner_id.as_str(), "B");
        assert!(service.query_latest_victory(&DecisionKey::new("a", "r-9")).is_none());
        assert_eq!(service.stream_time(), Some(ts(5)));
        assert_eq!(service.partitions(), 2);
    }

    #[test]
    fn range_is_restartable() {
        let p0 = store_with(&[victory("a", "r-1", "A", ts(0))]);
        let service = VictoryQueryService::new(vec![p0.reader()], WindowConfig::default());
        let range = service.query_range(&DecisionKey::new("a", "r-1"), ts(-10), ts(10));
        assert_eq!(range.iter().count(), 1);
        assert_eq!((&range).into_iter().count(), 1);
        assert_eq!(range.to_vec().first().map(|v| v.winner_id.as_str()), Some("A"));
    }

    #[test]
    fn arena_scans_stay_in_arena_and_order_by_time() {
        let p0 = store_with(&[
            victory("a", "r-2", "B", ts(3)),
            victory("b", "r-1", "X", ts(4)),
        ]);
        let p1 = store_with(&[victory("a", "r-1", "A", ts(1)), victory("ab", "r-1", "Y", ts(2))]);
        let service = VictoryQueryService::new(vec![p0.reader(), p1.reader()], WindowConfig::default());

        let arena = ArenaId::from("a");
        let winners: Vec<String> = service
            .range_in_arena(&arena, ts(0), ts(10))
            .into_iter()
            .map(|v| v.winner_id.into_inner())
            .collect();
        assert_eq!(winners, vec!["A".to_owned(), "B".to_owned()]);
        assert_eq!(
            service.latest_in_arena(&arena).map(|v| v.winner_id.into_inner()),
            Some("B".to_owned())
        );
        assert!(service.latest_in_arena(&ArenaId::from("zzz")).is_none());
    }

    #[test]
    fn idle_partition_expires_with_the_others() {
        let p0 = store_with(&[victory("a", "r-a", "A", ts(0))]);
        let p1 = store_with(&[victory("a", "r-b", "B", ts(120))]);
        let service = VictoryQueryService::new(vec![p0.reader(), p1.reader()], WindowConfig::default());

        let key = DecisionKey::new("a", "r-a");
        assert!(service.query_latest_victory(&key).is_none());
        assert_eq!(service.query_range(&key, ts(-10), ts(10)).iter().count(), 0);
        let arena: Vec<String> = service
            .range_in_arena(&ArenaId::from("a"), ts(-10), ts(200))
            .into_iter()
            .map(|v| v.round_id.into_inner())
            .collect();
        assert_eq!(arena, vec!["r-b".to_owned()]);
    }

    #[test]
    fn visible_while_any_partition_is_within_retention() {
        let p0 = store_with(&[victory("a", "r-a", "A", ts(0))]);
        let p1 = store_with(&[victory("a", "r-b", "B", ts(20))]);
        let service = VictoryQueryService::new(vec![p0.reader(), p1.reader()], WindowConfig::default());
        assert!(service.query_latest_victory(&DecisionKey::new("a", "r-a")).is_some());
    }

    #[test]
    fn range_merges_partitions_in_time_order() {
        let config = WindowConfig {
            retain_duplicates: true,
            ..WindowConfig::default()
        };
        let mut p0 = VictoryStore::in_memory("victories", config);
        let mut p1 = VictoryStore::in_memory("victories", config);
        let key = DecisionKey::new("a", "r-1");
        p0.put(key.clone(), victory("a", "r-1", "A", ts(1)), ts(1));
        p0.put(key.clone(), victory("a", "r-1", "C", ts(3)), ts(3));
        p1.put(key.clone(), victory("a", "r-1", "B", ts(2)), ts(2));
        p1.put(key.clone(), victory("a", "r-1", "D", ts(4)), ts(4));
        p0.publish();
        p1.publish();
        let service = VictoryQueryService::new(vec![p0.reader(), p1.reader()], config);

        let range = service.query_range(&key, ts(0), ts(10));
        let winners: Vec<&str> = range.iter().map(|v| v.winner_id.as_str()).collect();
        assert_eq!(winners, vec!["A", "B", "C", "D"]);
        assert_eq!(range.iter().take(1).count(), 1);
    }
}
