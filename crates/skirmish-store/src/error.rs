//! Error types for the state stores.
//!
//! All failures are reported via [`StoreError`]. Every I/O variant carries
//! the path that was being touched so a storage fault can be traced back to
//! the store and segment that caused it.

use std::path::PathBuf;

/// Errors that can occur in the state store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file or directory being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted state could not be decoded and cannot be skipped safely.
    #[error("corrupt store file {path} at line {line}: {reason}")]
    Corrupt {
        /// The damaged file.
        path: PathBuf,
        /// One-based line number of the damaged entry.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A lock guarding store state was poisoned by a panicking writer.
    #[error("store {0} is poisoned")]
    Poisoned(String),
}

impl StoreError {
    /// Build a closure that wraps an [`std::io::Error`] with `path`.
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
