//! Query server startup helper for embedding in the engine binary.
//!
//! [`spawn_query_server`] binds eagerly, so a taken port is reported to
//! the caller, then serves on a background Tokio task.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::server::{ServerConfig, ServerError, bind, serve};
use crate::state::AppState;

/// Errors that can occur when spawning the query server.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The server failed to bind.
    #[error("server start error: {0}")]
    Server(#[from] ServerError),
}

/// Spawn the query HTTP server on a background Tokio task.
///
/// The server stops once `shutdown` observes `true`. The returned handle
/// resolves with the serve result.
pub async fn spawn_query_server(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<Result<(), ServerError>>, StartupError> {
    let listener = bind(config).await?;
    let handle = tokio::spawn(serve(listener, state, shutdown));
    tracing::info!(port = config.port, "Query server spawned on background task");
    Ok(handle)
}
