//! Persistent key-value store.
//!
//! [`KeyValueStore`] keeps its entries in a sharded concurrent map so any
//! number of readers can look keys up while the single owning writer
//! mutates it. Durability comes from an append-only changelog
//! (`{name}.log`, one JSON entry per line) that is replayed on open and
//! compacted on [`flush`](KeyValueStore::flush).
//!
//! A mutation is appended and flushed to the changelog before it touches
//! the map, so a failed write leaves the key unchanged. A torn final line
//! left by an abrupt stop is discarded during replay.

use std::fs::{self, File, OpenOptions};
use std::hash::Hash;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::fs::write_atomic;

/// A changelog entry as written.
#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntryRef<'a, K, V> {
    Put { key: &'a K, value: &'a V },
    Delete { key: &'a K },
}

/// A changelog entry as replayed.
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry<K, V> {
    Put { key: K, value: V },
    Delete { key: K },
}

/// Superseded entries tolerated before [`KeyValueStore::compact_if_needed`]
/// rewrites the changelog.
const MIN_COMPACTION_BACKLOG: usize = 64;

/// Open changelog file handle.
struct ChangeLog {
    path: PathBuf,
    file: File,
    /// Entries appended since the last compaction.
    appended: usize,
}

impl ChangeLog {
    fn open_append(path: PathBuf) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(StoreError::io(&path))?;
        Ok(Self {
            path,
            file,
            appended: 0,
        })
    }

    fn append(&mut self, line: &[u8]) -> Result<(), StoreError> {
        self.file
            .write_all(line)
            .and_then(|()| self.file.flush())
            .map_err(StoreError::io(&self.path))?;
        self.appended = self.appended.saturating_add(1);
        Ok(())
    }
}

/// A keyed store with concurrent reads and an optional on-disk changelog.
pub struct KeyValueStore<K, V> {
    name: String,
    entries: DashMap<K, V>,
    log: Option<Mutex<ChangeLog>>,
}

impl<K, V> KeyValueStore<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Create a store that lives only in memory.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            log: None,
        }
    }

    /// Open (or create) a persistent store named `name` under `dir`.
    ///
    /// Replays the existing changelog, then compacts it so the file holds
    /// exactly one entry per live key.
    pub fn open(dir: &Path, name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        fs::create_dir_all(dir).map_err(StoreError::io(dir))?;
        let path = dir.join(format!("{name}.log"));

        let entries = DashMap::new();
        let replayed = if path.exists() {
            replay(&path, &entries)?
        } else {
            0
        };

        let store = Self {
            name,
            entries,
            log: None,
        };
        store.compact_into(&path)?;
        let store = Self {
            log: Some(Mutex::new(ChangeLog::open_append(path)?)),
            ..store
        };

        info!(
            store = store.name,
            replayed,
            keys = store.entries.len(),
            "Key-value store restored"
        );
        Ok(store)
    }

    /// The store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up `key`, returning a clone of the stored value.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Insert or fully replace the value stored under `key`.
    pub fn put(&self, key: K, value: V) -> Result<(), StoreError> {
        self.append(&LogEntryRef::Put {
            key: &key,
            value: &value,
        })?;
        self.entries.insert(key, value);
        Ok(())
    }

    /// Remove `key`, returning the previous value if there was one.
    pub fn delete(&self, key: &K) -> Result<Option<V>, StoreError> {
        if !self.entries.contains_key(key) {
            return Ok(None);
        }
        let entry: LogEntryRef<'_, K, V> = LogEntryRef::Delete { key };
        self.append(&entry)?;
        Ok(self.entries.remove(key).map(|(_, value)| value))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compact the changelog down to one entry per live key.
    ///
    /// No-op for in-memory stores.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let mut log = log
            .lock()
            .map_err(|e| StoreError::Poisoned(format!("{}: {e}", self.name)))?;
        self.compact_into(&log.path)?;
        *log = ChangeLog::open_append(log.path.clone())?;
        debug!(store = self.name, keys = self.entries.len(), "Changelog compacted");
        Ok(())
    }

    /// Compact once the entries appended since the last compaction reach
    /// the live key count, or [`MIN_COMPACTION_BACKLOG`] if that is larger.
    ///
    /// Returns whether a compaction ran.
    pub fn compact_if_needed(&self) -> Result<bool, StoreError> {
        let Some(log) = &self.log else {
            return Ok(false);
        };
        let backlog = log
            .lock()
            .map_err(|e| StoreError::Poisoned(format!("{}: {e}", self.name)))?
            .appended;
        if backlog < self.entries.len().max(MIN_COMPACTION_BACKLOG) {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    fn append(&self, entry: &LogEntryRef<'_, K, V>) -> Result<(), StoreError> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        log.lock()
            .map_err(|e| StoreError::Poisoned(format!("{}: {e}", self.name)))?
            .append(&line)
    }

    fn compact_into(&self, path: &Path) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            serde_json::to_writer(
                &mut buf,
                &LogEntryRef::Put {
                    key: entry.key(),
                    value: entry.value(),
                },
            )?;
            buf.push(b'\n');
        }
        write_atomic(path, &buf)
    }
}

/// Replay a changelog into `entries`, returning the number of entries applied.
fn replay<K, V>(path: &Path, entries: &DashMap<K, V>) -> Result<usize, StoreError>
where
    K: Eq + Hash + DeserializeOwned,
    V: DeserializeOwned,
{
    let file = File::open(path).map_err(StoreError::io(path))?;
    let lines = BufReader::new(file)
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::io(path))?;
    let last = lines.len();

    let mut applied = 0_usize;
    for (n, line) in lines.iter().enumerate() {
        let line_no = n.saturating_add(1);
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry<K, V>>(line) {
            Ok(LogEntry::Put { key, value }) => {
                entries.insert(key, value);
            }
            Ok(LogEntry::Delete { key }) => {
                entries.remove(&key);
            }
            Err(e) if line_no == last => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %e,
                    "Discarding torn changelog tail"
                );
                continue;
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: e.to_string(),
                });
            }
        }
        applied = applied.saturating_add(1);
    }
    Ok(applied)
}

impl<K: Eq + Hash, V> std::fmt::Debug for KeyValueStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("name", &self.name)
            .field("keys", &self.entries.len())
            .field("persistent", &self.log.is_some())
            .finish()
    }
}
