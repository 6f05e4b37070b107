//! Shared application state for the query API server.

use chrono::{DateTime, Utc};
use skirmish_core::query::VictoryQueryService;
use skirmish_core::stores::ArenaReader;

/// State handed to every handler. Holds read handles only.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Cross-partition victory queries.
    pub victories: VictoryQueryService,
    /// Read view of the arena registry, used for health reporting.
    pub arenas: ArenaReader,
    /// When the server state was created.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build state over the given read handles.
    pub fn new(victories: VictoryQueryService, arenas: ArenaReader) -> Self {
        Self {
            victories,
            arenas,
            started_at: Utc::now(),
        }
    }
}
