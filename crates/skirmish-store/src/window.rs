//! Time-bucketed window store.
//!
//! [`WindowStore`] keeps timestamped values in a ring of fixed-size time
//! buckets, each an independent ordered map. The store's stream time is the
//! largest timestamp it has observed; once a bucket falls `bucket_count`
//! buckets behind the bucket holding the stream time it is dropped whole.
//! Nothing ever scans keys to expire them.
//!
//! # Readers
//!
//! The single writer owns the live ring. [`WindowStore::publish`] makes the
//! current ring visible to every [`WindowReader`] as an immutable
//! [`WindowSnapshot`] swapped in atomically. Buckets are shared between the
//! live ring and published snapshots through [`Arc`], and the writer clones
//! a bucket only the first time it modifies it after a publish. Readers
//! therefore never take a lock the writer waits on.
//!
//! # Persistence
//!
//! A persistent store writes one segment file per bucket
//! (`segment-{index}.json`) on [`flush`](WindowStore::flush), rewriting only
//! buckets touched since the previous flush and deleting segments of
//! evicted buckets.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::fs::{remove_if_exists, write_atomic};

/// Segment file name prefix.
const SEGMENT_PREFIX: &str = "segment-";

/// Bucket and retention parameters of a window store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Width of one bucket.
    pub bucket_size: Duration,
    /// Number of buckets retained concurrently.
    pub bucket_count: u32,
    /// Keep every value written under a key within a bucket instead of only
    /// the last one.
    pub retain_duplicates: bool,
}

impl WindowConfig {
    /// Total time span covered by the retained buckets.
    pub fn retention(&self) -> Duration {
        self.bucket_size.saturating_mul(self.bucket_count)
    }

    /// Index of the bucket holding `timestamp`.
    pub fn bucket_index(&self, timestamp: DateTime<Utc>) -> i64 {
        timestamp.timestamp_millis().div_euclid(self.bucket_millis())
    }

    /// Whether a value stamped `timestamp` is still inside the retained
    /// buckets once stream time has reached `stream_time`.
    pub fn is_live(&self, timestamp: DateTime<Utc>, stream_time: DateTime<Utc>) -> bool {
        self.is_bucket_live(self.bucket_index(timestamp), stream_time)
    }

    fn is_bucket_live(&self, index: i64, stream_time: DateTime<Utc>) -> bool {
        index
            > self
                .bucket_index(stream_time)
                .saturating_sub(i64::from(self.bucket_count))
    }

    fn bucket_millis(&self) -> i64 {
        i64::try_from(self.bucket_size.as_millis())
            .unwrap_or(i64::MAX)
            .max(1)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            bucket_size: Duration::from_secs(15),
            bucket_count: 2,
            retain_duplicates: false,
        }
    }
}

/// A value together with the event time it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<V> {
    /// Event time of the value.
    pub timestamp: DateTime<Utc>,
    /// The stored value.
    pub value: V,
}

/// One time bucket: every value whose timestamp falls in
/// `[index * bucket_size, (index + 1) * bucket_size)`.
#[derive(Debug, Clone)]
struct Bucket<K, V> {
    index: i64,
    entries: BTreeMap<K, Vec<Stamped<V>>>,
}

/// On-disk layout of one bucket.
#[derive(Deserialize)]
struct Segment<K, V> {
    index: i64,
    entries: Vec<(K, Vec<Stamped<V>>)>,
}

/// Immutable view of the window at the moment it was published.
#[derive(Debug, Clone)]
pub struct WindowSnapshot<K, V> {
    buckets: Vec<Arc<Bucket<K, V>>>,
    stream_time: Option<DateTime<Utc>>,
}

impl<K, V> Default for WindowSnapshot<K, V> {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
            stream_time: None,
        }
    }
}

impl<K: Ord, V> WindowSnapshot<K, V> {
    /// Largest timestamp the store had observed when this view was taken.
    pub const fn stream_time(&self) -> Option<DateTime<Utc>> {
        self.stream_time
    }

    /// Values stored under `key` with `from <= timestamp <= to`, oldest
    /// first. The iterator is lazy and borrows this snapshot.
    pub fn fetch<'a>(
        &'a self,
        key: &'a K,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> WindowIter<'a, K, V> {
        WindowIter {
            buckets: self.buckets.iter(),
            current: std::slice::Iter::default(),
            key,
            from,
            to,
        }
    }

    /// The most recent value stored under `key`.
    pub fn fetch_latest(&self, key: &K) -> Option<&Stamped<V>> {
        self.buckets
            .iter()
            .rev()
            .filter_map(|bucket| bucket.entries.get(key).and_then(|values| values.last()))
            .max_by_key(|stamped| stamped.timestamp)
    }

    /// Whether any retained bucket holds a value for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.buckets
            .iter()
            .any(|bucket| bucket.entries.contains_key(key))
    }

    /// Values of every key in the contiguous run starting at `start` for
    /// which `in_run` holds, restricted to `from <= timestamp <= to` and
    /// ordered by timestamp.
    pub fn fetch_run<'a>(
        &'a self,
        start: &K,
        in_run: impl Fn(&K) -> bool,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<(&'a K, &'a Stamped<V>)> {
        let mut out: Vec<(&K, &Stamped<V>)> = self
            .buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .entries
                    .range(start..)
                    .take_while(|(key, _)| in_run(key))
                    .flat_map(|(key, values)| values.iter().map(move |stamped| (key, stamped)))
                    .filter(|(_, stamped)| stamped.timestamp >= from && stamped.timestamp <= to)
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by_key(|(_, stamped)| stamped.timestamp);
        out
    }

    /// Number of stored values across all buckets.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.entries.values())
            .map(Vec::len)
            .sum()
    }

    /// Whether the view holds no values.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|bucket| bucket.entries.is_empty())
    }

    /// Indices of the retained buckets, oldest first.
    pub fn bucket_indices(&self) -> Vec<i64> {
        self.buckets.iter().map(|bucket| bucket.index).collect()
    }
}

/// Lazy iterator over the values of one key, returned by
/// [`WindowSnapshot::fetch`].
pub struct WindowIter<'a, K, V> {
    buckets: std::slice::Iter<'a, Arc<Bucket<K, V>>>,
    current: std::slice::Iter<'a, Stamped<V>>,
    key: &'a K,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl<'a, K: Ord, V> Iterator for WindowIter<'a, K, V> {
    type Item = &'a Stamped<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for stamped in self.current.by_ref() {
                if stamped.timestamp > self.to {
                    break;
                }
                if stamped.timestamp >= self.from {
                    return Some(stamped);
                }
            }
            let bucket = self.buckets.next()?;
            self.current = bucket
                .entries
                .get(self.key)
                .map(|values| values.iter())
                .unwrap_or_default();
        }
    }
}

/// An owned, restartable range query over a published snapshot.
///
/// Holding a `WindowRange` pins the snapshot it was created from, so
/// iterating it again yields the same values even if the writer has moved
/// on in the meantime.
#[derive(Debug, Clone)]
pub struct WindowRange<K, V> {
    snapshot: Arc<WindowSnapshot<K, V>>,
    key: K,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl<K: Ord, V> WindowRange<K, V> {
    /// Iterate the range from the beginning.
    pub fn iter(&self) -> WindowIter<'_, K, V> {
        self.snapshot.fetch(&self.key, self.from, self.to)
    }
}

impl<'a, K: Ord, V> IntoIterator for &'a WindowRange<K, V> {
    type Item = &'a Stamped<V>;
    type IntoIter = WindowIter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Read-only handle to a window store. Cheap to clone.
#[derive(Debug)]
pub struct WindowReader<K, V> {
    published: Arc<ArcSwap<WindowSnapshot<K, V>>>,
}

impl<K, V> Clone for WindowReader<K, V> {
    fn clone(&self) -> Self {
        Self {
            published: Arc::clone(&self.published),
        }
    }
}

impl<K, V> Default for WindowReader<K, V> {
    fn default() -> Self {
        Self {
            published: Arc::new(ArcSwap::from_pointee(WindowSnapshot::default())),
        }
    }
}

impl<K: Ord, V> WindowReader<K, V> {
    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<WindowSnapshot<K, V>> {
        self.published.load_full()
    }

    /// The latest value under `key`, cloned out of the current snapshot.
    pub fn fetch_latest(&self, key: &K) -> Option<Stamped<V>>
    where
        V: Clone,
    {
        self.published.load().fetch_latest(key).cloned()
    }

    /// A restartable range over `key` pinned to the current snapshot.
    pub fn range(&self, key: K, from: DateTime<Utc>, to: DateTime<Utc>) -> WindowRange<K, V> {
        WindowRange {
            snapshot: self.snapshot(),
            key,
            from,
            to,
        }
    }
}

/// Writer side of a window store. There is exactly one per store.
pub struct WindowStore<K, V> {
    name: String,
    config: WindowConfig,
    ring: VecDeque<Arc<Bucket<K, V>>>,
    stream_time: Option<DateTime<Utc>>,
    published: Arc<ArcSwap<WindowSnapshot<K, V>>>,
    dir: Option<PathBuf>,
    dirty: BTreeSet<i64>,
    evicted: BTreeSet<i64>,
}

impl<K, V> WindowStore<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Create a store that lives only in memory.
    pub fn in_memory(name: impl Into<String>, config: WindowConfig) -> Self {
        Self {
            name: name.into(),
            config,
            ring: VecDeque::new(),
            stream_time: None,
            published: Arc::new(ArcSwap::from_pointee(WindowSnapshot::default())),
            dir: None,
            dirty: BTreeSet::new(),
            evicted: BTreeSet::new(),
        }
    }

    /// Open (or create) a persistent store under `dir`.
    ///
    /// Loads every segment file, restores stream time from the newest stored
    /// value, and deletes segments that are already outside retention.
    pub fn open(
        dir: &Path,
        name: impl Into<String>,
        config: WindowConfig,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(StoreError::io(dir))?;
        let mut store = Self {
            dir: Some(dir.to_path_buf()),
            ..Self::in_memory(name, config)
        };

        let mut loaded: Vec<Bucket<K, V>> = Vec::new();
        for entry in fs::read_dir(dir).map_err(StoreError::io(dir))? {
            let path = entry.map_err(StoreError::io(dir))?.path();
            if segment_index(&path).is_none() {
                continue;
            }
            let bytes = fs::read(&path).map_err(StoreError::io(&path))?;
            let segment: Segment<K, V> =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    path: path.clone(),
                    line: e.line(),
                    reason: e.to_string(),
                })?;
            loaded.push(Bucket {
                index: segment.index,
                entries: segment.entries.into_iter().collect(),
            });
        }
        loaded.sort_by_key(|bucket| bucket.index);

        let newest = loaded
            .iter()
            .flat_map(|bucket| bucket.entries.values().flatten())
            .map(|stamped| stamped.timestamp)
            .max();
        store.ring = loaded.into_iter().map(Arc::new).collect();
        if let Some(ts) = newest {
            store.advance(ts);
        }
        store.flush()?;

        info!(
            store = store.name,
            buckets = store.ring.len(),
            stream_time = ?store.stream_time,
            "Window store restored"
        );
        Ok(store)
    }

    /// The store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store's bucket and retention parameters.
    pub const fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Largest timestamp observed so far.
    pub const fn stream_time(&self) -> Option<DateTime<Utc>> {
        self.stream_time
    }

    /// A new read-only handle onto this store's published snapshots.
    pub fn reader(&self) -> WindowReader<K, V> {
        WindowReader {
            published: Arc::clone(&self.published),
        }
    }

    /// Publish to `reader` from now on, replacing this store's own handle.
    ///
    /// Used when a store is reopened from disk so that readers handed out
    /// before the reopen keep following it. Publishes immediately.
    pub fn attach(&mut self, reader: &WindowReader<K, V>) {
        self.published = Arc::clone(&reader.published);
        self.publish();
    }

    /// Store `value` under `key` at `timestamp`.
    ///
    /// Advances stream time first. Returns `false` when the timestamp falls
    /// into a bucket that is already outside retention; such writes are
    /// dropped.
    pub fn put(&mut self, key: K, value: V, timestamp: DateTime<Utc>) -> bool {
        self.advance(timestamp);

        let index = self.bucket_index(timestamp);
        if !self.is_live(index) {
            debug!(
                store = self.name,
                %timestamp,
                bucket = index,
                "Dropping write outside retention"
            );
            return false;
        }

        let position = self.ring.partition_point(|bucket| bucket.index < index);
        if self.ring.get(position).is_none_or(|bucket| bucket.index != index) {
            self.ring.insert(
                position,
                Arc::new(Bucket {
                    index,
                    entries: BTreeMap::new(),
                }),
            );
        }
        let Some(bucket) = self.ring.get_mut(position) else {
            return false;
        };

        let values = Arc::make_mut(bucket).entries.entry(key).or_default();
        let stamped = Stamped { timestamp, value };
        if self.config.retain_duplicates {
            let at = values.partition_point(|existing| existing.timestamp <= timestamp);
            values.insert(at, stamped);
        } else {
            values.clear();
            values.push(stamped);
        }
        self.dirty.insert(index);
        true
    }

    /// Advance stream time to `timestamp` (never backwards) and drop every
    /// bucket that falls out of retention. Returns the number of buckets
    /// dropped.
    pub fn advance(&mut self, timestamp: DateTime<Utc>) -> usize {
        if self.stream_time.is_some_and(|current| current >= timestamp) {
            return 0;
        }
        self.stream_time = Some(timestamp);

        let mut dropped = 0_usize;
        while let Some(front) = self.ring.front() {
            if self.is_live(front.index) {
                break;
            }
            let index = front.index;
            self.ring.pop_front();
            self.dirty.remove(&index);
            self.evicted.insert(index);
            dropped = dropped.saturating_add(1);
        }
        if dropped > 0 {
            debug!(store = self.name, dropped, "Evicted expired buckets");
        }
        dropped
    }

    /// The latest value under `key` in the live ring.
    pub fn fetch_latest(&self, key: &K) -> Option<&Stamped<V>> {
        self.ring
            .iter()
            .rev()
            .filter_map(|bucket| bucket.entries.get(key).and_then(|values| values.last()))
            .max_by_key(|stamped| stamped.timestamp)
    }

    /// Whether the live ring holds a value for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.ring
            .iter()
            .any(|bucket| bucket.entries.contains_key(key))
    }

    /// Make the live ring visible to readers.
    pub fn publish(&self) {
        self.published.store(Arc::new(WindowSnapshot {
            buckets: self.ring.iter().cloned().collect(),
            stream_time: self.stream_time,
        }));
    }

    /// Publish, then persist touched buckets and delete evicted segments.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.publish();
        let Some(dir) = &self.dir else {
            self.dirty.clear();
            self.evicted.clear();
            return Ok(());
        };

        for index in &self.evicted {
            remove_if_exists(&segment_path(dir, *index))?;
        }
        for index in &self.dirty {
            let Some(bucket) = self.ring.iter().find(|bucket| bucket.index == *index) else {
                continue;
            };
            let segment = SegmentRef {
                index: *index,
                entries: bucket.entries.iter().collect(),
            };
            write_atomic(&segment_path(dir, *index), &serde_json::to_vec(&segment)?)?;
        }
        debug!(
            store = self.name,
            written = self.dirty.len(),
            removed = self.evicted.len(),
            "Window segments flushed"
        );
        self.dirty.clear();
        self.evicted.clear();
        Ok(())
    }

    fn bucket_index(&self, timestamp: DateTime<Utc>) -> i64 {
        self.config.bucket_index(timestamp)
    }

    fn is_live(&self, index: i64) -> bool {
        self.stream_time
            .is_none_or(|now| self.config.is_bucket_live(index, now))
    }
}

/// Borrowed on-disk layout used when writing a bucket.
#[derive(Serialize)]
struct SegmentRef<'a, K, V> {
    index: i64,
    entries: Vec<(&'a K, &'a Vec<Stamped<V>>)>,
}

fn segment_path(dir: &Path, index: i64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{index}.json"))
}

fn segment_index(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

impl<K, V> std::fmt::Debug for WindowStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowStore")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("buckets", &self.ring.len())
            .field("stream_time", &self.stream_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000_i64.saturating_add(secs), 0)
            .unwrap()
    }

    fn store() -> WindowStore<String, u32> {
        WindowStore::in_memory("test", WindowConfig::default())
    }

    #[test]
    fn liveness_follows_whole_buckets() {
        let config = WindowConfig::default();
        assert!(config.is_live(at(0), at(0)));
        assert!(config.is_live(at(0), at(20)));
        assert!(!config.is_live(at(0), at(30)));
        // Values ahead of the given stream time are never expired.
        assert!(config.is_live(at(60), at(0)));
    }

    #[test]
    fn retention_is_bucket_span() {
        assert_eq!(WindowConfig::default().retention(), Duration::from_secs(30));
    }

    #[test]
    fn latest_survives_within_horizon() {
        let mut store = store();
        assert!(store.put("k".to_owned(), 1, at(0)));
        store.advance(at(10));
        assert_eq!(store.fetch_latest(&"k".to_owned()).map(|s| s.value), Some(1));
    }

    #[test]
    fn whole_bucket_dropped_after_horizon() {
        let mut store = store();
        store.put("k".to_owned(), 1, at(0));
        let dropped = store.advance(at(31));
        assert_eq!(dropped, 1);
        assert!(!store.contains(&"k".to_owned()));
    }

    #[test]
    fn late_write_outside_retention_is_dropped() {
        let mut store = store();
        store.advance(at(100));
        assert!(!store.put("k".to_owned(), 1, at(0)));
        assert!(!store.contains(&"k".to_owned()));
        // Stream time never moves backwards.
        assert_eq!(store.stream_time(), Some(at(100)));
    }

    #[test]
    fn no_duplicates_keeps_last_write_in_bucket() {
        let mut store = store();
        store.put("k".to_owned(), 1, at(0));
        store.put("k".to_owned(), 2, at(1));
        store.publish();
        let snapshot = store.reader().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.fetch_latest(&"k".to_owned()).map(|s| s.value), Some(2));
    }

    #[test]
    fn retain_duplicates_keeps_all_in_time_order() {
        let config = WindowConfig {
            retain_duplicates: true,
            ..WindowConfig::default()
        };
        let mut store: WindowStore<String, u32> = WindowStore::in_memory("dups", config);
        store.put("k".to_owned(), 2, at(2));
        store.put("k".to_owned(), 1, at(1));
        store.publish();
        let snapshot = store.reader().snapshot();
        let values: Vec<u32> = snapshot
            .fetch(&"k".to_owned(), at(0), at(10))
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn readers_see_only_published_state() {
        let mut store = store();
        let reader = store.reader();
        store.put("k".to_owned(), 1, at(0));
        assert!(reader.fetch_latest(&"k".to_owned()).is_none());
        store.publish();
        assert_eq!(reader.fetch_latest(&"k".to_owned()).map(|s| s.value), Some(1));
    }

    #[test]
    fn range_is_restartable_and_pinned() {
        let mut store = store();
        store.put("k".to_owned(), 1, at(0));
        store.put("k".to_owned(), 2, at(16));
        store.publish();

        let range = store.reader().range("k".to_owned(), at(0), at(20));
        store.put("k".to_owned(), 3, at(17));
        store.publish();

        let first: Vec<u32> = range.iter().map(|s| s.value).collect();
        let second: Vec<u32> = (&range).into_iter().map(|s| s.value).collect();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(first, second);
    }

    #[test]
    fn attached_reader_follows_reopened_store() {
        let reader: WindowReader<String, u32> = WindowReader::default();
        let mut first = store();
        first.attach(&reader);
        first.put("k".to_owned(), 1, at(0));
        first.publish();
        drop(first);

        let mut second = store();
        second.attach(&reader);
        assert!(reader.fetch_latest(&"k".to_owned()).is_none());
        second.put("k".to_owned(), 2, at(1));
        second.publish();
        assert_eq!(reader.fetch_latest(&"k".to_owned()).map(|s| s.value), Some(2));
    }

    #[test]
    fn fetch_respects_bounds() {
        let mut store = store();
        store.put("k".to_owned(), 1, at(0));
        store.put("k".to_owned(), 2, at(16));
        store.publish();
        let snapshot = store.reader().snapshot();
        let values: Vec<u32> = snapshot
            .fetch(&"k".to_owned(), at(10), at(20))
            .map(|s| s.value)
            .collect();
        assert_eq!(values, vec![2]);
    }

    #[test]
    fn fetch_run_scans_contiguous_keys() {
        let mut store: WindowStore<(String, String), u32> =
            WindowStore::in_memory("runs", WindowConfig::default());
        store.put(("a".to_owned(), "1".to_owned()), 1, at(3));
        store.put(("b".to_owned(), "1".to_owned()), 2, at(2));
        store.put(("b".to_owned(), "2".to_owned()), 3, at(1));
        store.put(("c".to_owned(), "1".to_owned()), 4, at(0));
        store.publish();

        let snapshot = store.reader().snapshot();
        let start = ("b".to_owned(), String::new());
        let run: Vec<u32> = snapshot
            .fetch_run(&start, |key| key.0 == "b", at(0), at(10))
            .into_iter()
            .map(|(_, stamped)| stamped.value)
            .collect();
        assert_eq!(run, vec![3, 2]);
    }
}
