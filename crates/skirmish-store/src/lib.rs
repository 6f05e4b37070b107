//! State stores for the Skirmish pipeline.
//!
//! Two store shapes back the processing topology:
//!
//! ```text
//! arena feed --> KeyValueStore<ArenaId, Arena>      (unbounded, changelog on disk)
//! victories  --> WindowStore<DecisionKey, Victory>  (ring of time buckets, one
//!                                                     segment file per bucket)
//! ```
//!
//! Both support reads concurrent with their single writer. The key-value
//! store uses a sharded concurrent map; the window store publishes
//! immutable snapshots that readers load without locking.
//!
//! # Modules
//!
//! - [`kv`] -- Persistent key-value store with changelog replay
//! - [`window`] -- Time-bucketed window store with whole-bucket eviction
//! - [`error`] -- Shared error types

pub mod error;
mod fs;
pub mod kv;
pub mod window;

// Re-export primary types for convenience.
pub use error::StoreError;
pub use fs::remove_state_dir;
pub use kv::KeyValueStore;
pub use window::{
    Stamped, WindowConfig, WindowIter, WindowRange, WindowReader, WindowSnapshot, WindowStore,
};
