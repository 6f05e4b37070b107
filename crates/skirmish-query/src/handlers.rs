//! REST endpoint handlers for the query API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness and stream status |
//! | `GET` | `/api/victories/{arena_id}/{round_id}/latest` | Latest decision for one round |
//! | `GET` | `/api/victories/{arena_id}/{round_id}` | Decisions for one round in a time range |
//! | `GET` | `/api/arenas/{arena_id}/victories/latest` | Latest decision in an arena |
//! | `GET` | `/api/arenas/{arena_id}/victories` | Decisions in an arena in a time range |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use skirmish_types::{ArenaId, DecisionKey, RoundId, VictoryRecord};

use crate::error::QueryError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameter structs
// ---------------------------------------------------------------------------

/// Time bounds accepted by the range endpoints. Both are RFC 3339 and
/// both are optional; a missing bound leaves that side open.
#[derive(Debug, Default, serde::Deserialize)]
pub struct RangeQuery {
    /// Inclusive lower bound on `decided_at`.
    pub from: Option<String>,
    /// Inclusive upper bound on `decided_at`.
    pub to: Option<String>,
}

impl RangeQuery {
    /// Parse both bounds, rejecting malformed timestamps and `from > to`.
    pub fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), QueryError> {
        let from = parse_bound("from", self.from.as_deref())?.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let to = parse_bound("to", self.to.as_deref())?.unwrap_or(DateTime::<Utc>::MAX_UTC);
        if from > to {
            return Err(QueryError::InvalidQuery(format!(
                "from ({}) is after to ({})",
                from.to_rfc3339(),
                to.to_rfc3339()
            )));
        }
        Ok((from, to))
    }
}

fn parse_bound(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, QueryError> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|e| QueryError::InvalidQuery(format!("{name}: {e}")))
    })
    .transpose()
}

fn list_body(victories: &[VictoryRecord]) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "count": victories.len(),
        "victories": victories,
    }))
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

/// Report liveness plus the partition count and current stream time.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime_secs = Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "partitions": state.victories.partitions(),
        "stream_time": state.victories.stream_time(),
        "arenas": state.arenas.len(),
    }))
}

// ---------------------------------------------------------------------------
// GET /api/victories/{arena_id}/{round_id}[/latest]
// ---------------------------------------------------------------------------

/// Latest committed victory for one round.
pub async fn latest_victory(
    State(state): State<Arc<AppState>>,
    Path((arena_id, round_id)): Path<(String, String)>,
) -> Result<Json<VictoryRecord>, QueryError> {
    let key = DecisionKey::new(ArenaId::from(arena_id), RoundId::from(round_id));
    state
        .victories
        .query_latest_victory(&key)
        .map(Json)
        .ok_or_else(|| QueryError::NotFound(format!("no victory for {key}")))
}

/// Committed victories for one round within `[from, to]`, oldest first.
pub async fn victory_range(
    State(state): State<Arc<AppState>>,
    Path((arena_id, round_id)): Path<(String, String)>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, QueryError> {
    let (from, to) = params.bounds()?;
    let key = DecisionKey::new(ArenaId::from(arena_id), RoundId::from(round_id));
    let victories = state.victories.query_range(&key, from, to).to_vec();
    Ok(list_body(&victories))
}

// ---------------------------------------------------------------------------
// GET /api/arenas/{arena_id}/victories[/latest]
// ---------------------------------------------------------------------------

/// Latest committed victory of any round in an arena.
pub async fn latest_in_arena(
    State(state): State<Arc<AppState>>,
    Path(arena_id): Path<String>,
) -> Result<Json<VictoryRecord>, QueryError> {
    let arena_id = ArenaId::from(arena_id);
    state
        .victories
        .latest_in_arena(&arena_id)
        .map(Json)
        .ok_or_else(|| QueryError::NotFound(format!("no victory in arena {arena_id}")))
}

/// Committed victories in an arena within `[from, to]`, oldest first.
pub async fn arena_range(
    State(state): State<Arc<AppState>>,
    Path(arena_id): Path<String>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<serde_json::Value>, QueryError> {
    let (from, to) = params.bounds()?;
    let victories = state
        .victories
        .range_in_arena(&ArenaId::from(arena_id), from, to);
    Ok(list_body(&victories))
}
