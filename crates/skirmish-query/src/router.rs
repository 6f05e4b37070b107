//! Axum router construction for the query API.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the complete Axum router for the query server.
///
/// The router includes:
/// - `GET /health`
/// - `GET /api/victories/{arena_id}/{round_id}/latest`
/// - `GET /api/victories/{arena_id}/{round_id}?from=&to=`
/// - `GET /api/arenas/{arena_id}/victories/latest`
/// - `GET /api/arenas/{arena_id}/victories?from=&to=`
///
/// Every route is a read. CORS allows any origin.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        // Per round
        .route(
            "/api/victories/{arena_id}/{round_id}/latest",
            get(handlers::latest_victory),
        )
        .route(
            "/api/victories/{arena_id}/{round_id}",
            get(handlers::victory_range),
        )
        // Per arena
        .route(
            "/api/arenas/{arena_id}/victories/latest",
            get(handlers::latest_in_arena),
        )
        .route(
            "/api/arenas/{arena_id}/victories",
            get(handlers::arena_range),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
