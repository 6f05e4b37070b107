//! Error types for the engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps every failure
//! mode during startup, running, and shutdown.

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: skirmish_core::config::ConfigError,
    },

    /// The pipeline failed to open or ended with an error.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: skirmish_core::runner::RunnerError,
    },

    /// NATS connection or messaging failed.
    #[error("NATS error: {source}")]
    Nats {
        /// The underlying bridge error.
        #[from]
        source: crate::nats_feed::FeedError,
    },

    /// The query server failed to start or serve.
    #[error("query server error: {message}")]
    Query {
        /// Description of the server failure.
        message: String,
    },

    /// Waiting for a termination signal failed.
    #[error("signal error: {message}")]
    Signal {
        /// Description of the signal failure.
        message: String,
    },
}
