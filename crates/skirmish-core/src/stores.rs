//! Typed store handles and the per-process store set.
//!
//! The arena registry is one global key-value store shared by every task;
//! only the node that owns it gets an [`ArenaRegistry`], everyone else an
//! [`ArenaReader`]. The victory window is partitioned: each round task
//! owns its own [`VictoryStore`], and the query layer holds a
//! [`VictoryReader`] per partition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use skirmish_store::{KeyValueStore, StoreError, WindowConfig, WindowReader, WindowStore};
use skirmish_types::{Arena, ArenaId, DecisionKey, VictoryRecord};
use tracing::info;

use crate::config::StoreConfig;

/// Name of the global arena store.
pub const ARENA_STORE: &str = "arena-store";

/// Name of the partitioned victory window store.
pub const VICTORY_STORE: &str = "victory-store";

/// Writer side of one partition's victory window.
pub type VictoryStore = WindowStore<DecisionKey, VictoryRecord>;

/// Reader side of one partition's victory window.
pub type VictoryReader = WindowReader<DecisionKey, VictoryRecord>;

/// Write handle on the arena registry.
#[derive(Debug)]
pub struct ArenaRegistry {
    store: Arc<KeyValueStore<ArenaId, Arena>>,
}

impl ArenaRegistry {
    pub(crate) const fn from_shared(store: Arc<KeyValueStore<ArenaId, Arena>>) -> Self {
        Self { store }
    }

    /// A registry that lives only in memory.
    pub fn in_memory() -> Self {
        Self::from_shared(Arc::new(KeyValueStore::in_memory(ARENA_STORE)))
    }

    /// Insert `arena`, fully replacing any record with the same id.
    pub fn upsert(&self, arena: Arena) -> Result<(), StoreError> {
        self.store.put(arena.arena_id.clone(), arena)
    }

    /// Look up an arena.
    pub fn get(&self, arena_id: &ArenaId) -> Option<Arena> {
        self.store.get(arena_id)
    }

    /// Remove an arena, returning the removed record.
    pub fn delete(&self, arena_id: &ArenaId) -> Result<Option<Arena>, StoreError> {
        self.store.delete(arena_id)
    }

    /// Number of registered arenas.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether no arena is registered.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Compact the changelog.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }

    /// Compact the changelog if it has grown past the live data.
    pub fn compact_if_needed(&self) -> Result<bool, StoreError> {
        self.store.compact_if_needed()
    }

    /// A read-only handle on the same registry.
    pub fn reader(&self) -> ArenaReader {
        ArenaReader::from_shared(Arc::clone(&self.store))
    }
}

/// Read-only handle on the arena registry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ArenaReader {
    store: Arc<KeyValueStore<ArenaId, Arena>>,
}

impl ArenaReader {
    pub(crate) const fn from_shared(store: Arc<KeyValueStore<ArenaId, Arena>>) -> Self {
        Self { store }
    }

    /// Look up an arena.
    pub fn get(&self, arena_id: &ArenaId) -> Option<Arena> {
        self.store.get(arena_id)
    }

    /// Number of registered arenas.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether no arena is registered.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Stores handed to one task when it is built.
#[derive(Debug)]
pub struct TaskStores {
    pub(crate) arenas: Arc<KeyValueStore<ArenaId, Arena>>,
    pub(crate) victories: Option<VictoryStore>,
}

/// Every store instance of the process.
///
/// Opened once at startup. Victory stores are opened per task build, so a
/// task rebuilt after a storage fault starts again from what is on disk,
/// while the readers handed to the query layer stay valid across rebuilds.
#[derive(Debug)]
pub struct StateStores {
    state_dir: Option<PathBuf>,
    window: WindowConfig,
    arenas: Arc<KeyValueStore<ArenaId, Arena>>,
    victory_readers: Vec<VictoryReader>,
}

impl StateStores {
    /// Open the arena registry and prepare `partitions` victory readers.
    pub fn open(config: &StoreConfig, partitions: u32) -> Result<Self, StoreError> {
        let arenas = match &config.state_dir {
            Some(dir) => KeyValueStore::open(&dir.join("arenas"), ARENA_STORE)?,
            None => KeyValueStore::in_memory(ARENA_STORE),
        };
        let victory_readers = (0..partitions).map(|_| VictoryReader::default()).collect();

        info!(
            state_dir = ?config.state_dir,
            arenas = arenas.len(),
            partitions,
            "State stores opened"
        );
        Ok(Self {
            state_dir: config.state_dir.clone(),
            window: config.window(),
            arenas: Arc::new(arenas),
            victory_readers,
        })
    }

    /// A store set that keeps everything in memory.
    pub fn in_memory(window: WindowConfig, partitions: u32) -> Self {
        Self {
            state_dir: None,
            window,
            arenas: Arc::new(KeyValueStore::in_memory(ARENA_STORE)),
            victory_readers: (0..partitions).map(|_| VictoryReader::default()).collect(),
        }
    }

    /// Directory holding persistent state, if any.
    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    /// Read-only handle on the arena registry.
    pub fn arena_reader(&self) -> ArenaReader {
        ArenaReader::from_shared(Arc::clone(&self.arenas))
    }

    /// Bucket layout shared by every partition's victory window.
    pub const fn window(&self) -> WindowConfig {
        self.window
    }

    /// One victory reader per partition, indexed by partition.
    pub fn victory_readers(&self) -> &[VictoryReader] {
        &self.victory_readers
    }

    /// Build the store set for one task. `with_victories` opens the
    /// partition's victory window and attaches it to its reader.
    pub fn task_stores(&self, partition: u32, with_victories: bool) -> Result<TaskStores, StoreError> {
        let victories = if with_victories {
            Some(self.open_victories(partition)?)
        } else {
            None
        };
        Ok(TaskStores {
            arenas: Arc::clone(&self.arenas),
            victories,
        })
    }

    fn open_victories(&self, partition: u32) -> Result<VictoryStore, StoreError> {
        let name = format!("{VICTORY_STORE}-{partition}");
        let mut store = match &self.state_dir {
            Some(dir) => VictoryStore::open(
                &dir.join("victories").join(format!("partition-{partition}")),
                name,
                self.window,
            )?,
            None => VictoryStore::in_memory(name, self.window),
        };
        let index = usize::try_from(partition).unwrap_or(usize::MAX);
        if let Some(reader) = self.victory_readers.get(index) {
            store.attach(reader);
        }
        Ok(store)
    }
}
